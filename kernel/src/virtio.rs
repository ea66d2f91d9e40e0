//! Virtio-MMIO block driver (§4.5). Descriptor/avail/used ring layout and
//! the legacy-transport negotiation sequence are grounded on the rv6-family
//! `virtio_disk.rs` reference drivers in the retrieval pack; this version
//! busy-polls to completion instead of sleeping on an interrupt, per §5
//! ("block I/O does not suspend the caller").

use crate::config::{
    VIRTIO_BLOCK_DEVICE_ID, VIRTIO_MAGIC, VIRTIO_MMIO_BASE, VIRTIO_MMIO_SLOTS, VIRTIO_MMIO_STRIDE,
};
use crate::error::{KernelError, KernelResult};
use crate::pmm;
use conquer_once::spin::OnceCell;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};
use spin::Mutex;

// MMIO register offsets, common to legacy (v1) and modern (v2) transports.
mod reg {
    pub const MAGIC_VALUE: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const GUEST_PAGE_SIZE: usize = 0x028; // legacy only
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_ALIGN: usize = 0x03c; // legacy only
    pub const QUEUE_PFN: usize = 0x040; // legacy only
    pub const QUEUE_READY: usize = 0x044; // modern only
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080; // modern
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_AVAIL_LOW: usize = 0x090;
    pub const QUEUE_AVAIL_HIGH: usize = 0x094;
    pub const QUEUE_USED_LOW: usize = 0x0a0;
    pub const QUEUE_USED_HIGH: usize = 0x0a4;
}

bitflags::bitflags! {
    struct Status: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
    }
}

const QUEUE_SIZE: usize = 8;
const GUEST_PAGE_SIZE: u32 = 4096;

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;

pub const VIRTIO_BLK_T_IN: u32 = 0; // read from device
pub const VIRTIO_BLK_T_OUT: u32 = 1; // write to device

#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct VirtqAvail {
    flags: u16,
    idx: u16,
    ring: [u16; QUEUE_SIZE],
}

#[repr(C)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct VirtqUsed {
    flags: u16,
    idx: u16,
    ring: [VirtqUsedElem; QUEUE_SIZE],
}

#[repr(C)]
struct BlkReqHeader {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Transport {
    Legacy,
    Modern,
}

struct VirtioBlk {
    mmio_base: usize,
    transport: Transport,
    queue_page: usize, // one frame holding desc+avail, with used forced to offset 4096
    last_used_idx: u16,
}

impl VirtioBlk {
    fn reg_ptr(&self, offset: usize) -> *mut u32 {
        (self.mmio_base + offset) as *mut u32
    }

    fn read_reg(&self, offset: usize) -> u32 {
        unsafe { read_volatile(self.reg_ptr(offset)) }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        unsafe { write_volatile(self.reg_ptr(offset), value) };
    }

    fn desc_table(&self) -> *mut VirtqDesc {
        self.queue_page as *mut VirtqDesc
    }

    fn avail(&self) -> *mut VirtqAvail {
        (self.queue_page + QUEUE_SIZE * core::mem::size_of::<VirtqDesc>()) as *mut VirtqAvail
    }

    fn used(&self) -> *mut VirtqUsed {
        (self.queue_page + 4096) as *mut VirtqUsed
    }

    /// Probes `[0x1000_1000, 0x1000_9000)` for the first virtio-blk slot and
    /// runs feature negotiation + queue setup (§4.5).
    fn probe() -> KernelResult<Self> {
        for slot in 0..VIRTIO_MMIO_SLOTS {
            let base = VIRTIO_MMIO_BASE + slot * VIRTIO_MMIO_STRIDE;
            let magic = unsafe { read_volatile((base + reg::MAGIC_VALUE) as *const u32) };
            let device_id = unsafe { read_volatile((base + reg::DEVICE_ID) as *const u32) };
            if magic == VIRTIO_MAGIC && device_id == VIRTIO_BLOCK_DEVICE_ID {
                let version = unsafe { read_volatile((base + reg::VERSION) as *const u32) };
                let transport = if version == 1 { Transport::Legacy } else { Transport::Modern };
                return Self::init_at(base, transport);
            }
        }
        Err(KernelError::NotFound)
    }

    fn init_at(base: usize, transport: Transport) -> KernelResult<Self> {
        let dev = VirtioBlk { mmio_base: base, transport, queue_page: 0, last_used_idx: 0 };

        dev.write_reg(reg::STATUS, 0);
        dev.write_reg(reg::STATUS, Status::ACKNOWLEDGE.bits() | Status::DRIVER.bits());

        let _features = dev.read_reg(reg::DEVICE_FEATURES);
        dev.write_reg(reg::DRIVER_FEATURES, 0); // request nothing optional

        let mut status = Status::ACKNOWLEDGE.bits() | Status::DRIVER.bits() | Status::FEATURES_OK.bits();
        dev.write_reg(reg::STATUS, status);
        if transport == Transport::Modern {
            let readback = dev.read_reg(reg::STATUS);
            if readback & Status::FEATURES_OK.bits() == 0 {
                return Err(KernelError::Unsupported);
            }
        }

        dev.write_reg(reg::QUEUE_SEL, 0);
        let max = dev.read_reg(reg::QUEUE_NUM_MAX);
        let queue_num = core::cmp::min(max, QUEUE_SIZE as u32);
        dev.write_reg(reg::QUEUE_NUM, queue_num);

        // desc+avail live in the first frame; the used ring is forced to
        // offset 4096 (§4.5), i.e. the start of a second frame, so the
        // queue needs two physically contiguous frames, not one. The
        // page-frame allocator hands out frames in ascending index order
        // with no intervening frees this early in boot (pmm.rs's free list
        // is a stack populated in reverse-index order before any work has
        // run), so two back-to-back `alloc()`s are guaranteed adjacent.
        let queue_frame = pmm::alloc()?;
        let used_frame = pmm::alloc()?;
        assert_eq!(
            used_frame,
            queue_frame + crate::config::PAGE_SIZE,
            "virtio queue region must be two contiguous frames"
        );

        match transport {
            Transport::Legacy => {
                dev.write_reg(reg::GUEST_PAGE_SIZE, GUEST_PAGE_SIZE);
                dev.write_reg(reg::QUEUE_ALIGN, GUEST_PAGE_SIZE);
                dev.write_reg(reg::QUEUE_PFN, (queue_frame >> 12) as u32);
            }
            Transport::Modern => {
                let desc_addr = queue_frame as u64;
                let avail_addr = desc_addr + (QUEUE_SIZE * core::mem::size_of::<VirtqDesc>()) as u64;
                let used_addr = queue_frame as u64 + 4096;
                dev.write_reg(reg::QUEUE_DESC_LOW, desc_addr as u32);
                dev.write_reg(reg::QUEUE_DESC_HIGH, (desc_addr >> 32) as u32);
                dev.write_reg(reg::QUEUE_AVAIL_LOW, avail_addr as u32);
                dev.write_reg(reg::QUEUE_AVAIL_HIGH, (avail_addr >> 32) as u32);
                dev.write_reg(reg::QUEUE_USED_LOW, used_addr as u32);
                dev.write_reg(reg::QUEUE_USED_HIGH, (used_addr >> 32) as u32);
                dev.write_reg(reg::QUEUE_READY, 1);
            }
        }

        status |= Status::DRIVER_OK.bits();
        dev.write_reg(reg::STATUS, status);

        Ok(VirtioBlk { queue_page: queue_frame, ..dev })
    }

    /// Builds the 3-descriptor request chain (header/data/status), notifies
    /// the device, and busy-polls `used.idx` until the request completes.
    /// Only one request may be outstanding; callers serialize (all
    /// filesystem calls run with interrupts disabled during I/O, per §5).
    fn do_io(&mut self, req_type: u32, sector: u64, buf: &mut [u8; 512]) -> KernelResult<()> {
        assert!(buf.len() == 512);

        let header = BlkReqHeader { req_type, reserved: 0, sector };
        let header_frame = pmm::alloc()?;
        let status_frame = pmm::alloc()?;

        unsafe {
            (header_frame as *mut BlkReqHeader).write(header);
        }

        let desc_table = self.desc_table();
        unsafe {
            desc_table.add(0).write(VirtqDesc {
                addr: header_frame as u64,
                len: core::mem::size_of::<BlkReqHeader>() as u32,
                flags: VIRTQ_DESC_F_NEXT,
                next: 1,
            });
            desc_table.add(1).write(VirtqDesc {
                addr: buf.as_ptr() as u64,
                len: 512,
                flags: VIRTQ_DESC_F_NEXT | if req_type == VIRTIO_BLK_T_IN { VIRTQ_DESC_F_WRITE } else { 0 },
                next: 2,
            });
            desc_table.add(2).write(VirtqDesc {
                addr: status_frame as u64,
                len: 1,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            });
        }

        let avail = self.avail();
        unsafe {
            let idx = read_volatile(&raw const (*avail).idx);
            write_volatile(&raw mut (*avail).ring[(idx as usize) % QUEUE_SIZE], 0);
            fence(Ordering::SeqCst);
            write_volatile(&raw mut (*avail).idx, idx.wrapping_add(1));
        }

        self.write_reg(reg::QUEUE_NOTIFY, 0);

        let used = self.used();
        loop {
            fence(Ordering::SeqCst);
            let idx = unsafe { read_volatile(&raw const (*used).idx) };
            if idx != self.last_used_idx {
                break;
            }
        }
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let status = unsafe { read_volatile(status_frame as *const u8) };

        pmm::free(header_frame);
        pmm::free(status_frame);

        if status == 0 {
            Ok(())
        } else {
            Err(KernelError::IoError)
        }
    }
}

unsafe impl Send for VirtioBlk {}

static DISK: OnceCell<Mutex<VirtioBlk>> = OnceCell::uninit();

pub fn init() -> KernelResult<()> {
    let dev = VirtioBlk::probe()?;
    DISK.try_init_once(|| Mutex::new(dev))
        .map_err(|_| KernelError::Unsupported)
}

pub fn read_sector(sector: u64, buf: &mut [u8; 512]) -> KernelResult<()> {
    DISK.get()
        .ok_or(KernelError::NotFound)?
        .lock()
        .do_io(VIRTIO_BLK_T_IN, sector, buf)
}

pub fn write_sector(sector: u64, buf: &mut [u8; 512]) -> KernelResult<()> {
    DISK.get()
        .ok_or(KernelError::NotFound)?
        .lock()
        .do_io(VIRTIO_BLK_T_OUT, sector, buf)
}

/// Reads `INTERRUPT_STATUS`, ACKs the low two bits, and reports whether
/// `used.idx` advanced — kept for parity with §4.5's `blk_intr`, though the
/// polling `do_io` above never actually waits on this path.
pub fn handle_interrupt(_irq: u32) -> bool {
    let Some(disk) = DISK.get() else { return false };
    let disk = disk.lock();
    let status = disk.read_reg(reg::INTERRUPT_STATUS);
    disk.write_reg(reg::INTERRUPT_ACK, status & 0x3);
    let used = disk.used();
    let idx = unsafe { read_volatile(&raw const (*used).idx) };
    idx != disk.last_used_idx
}
