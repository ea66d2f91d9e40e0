//! Virtual memory manager (§4.2), implemented as Sv39 — the explicitly
//! permitted three-level reinterpretation of the source's two-level 32-bit
//! page tables. Behavior (map/unmap/translate, idempotence, leak-freedom) is
//! unchanged from the two-level contract; only the index decomposition grows
//! a third level.

use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::pmm;
use bitflags::bitflags;
use conquer_once::spin::OnceCell;
use core::ptr::{read_volatile, write_volatile};
use spin::Mutex;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXEC = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

pub const RW: PteFlags = PteFlags::READ.union(PteFlags::WRITE);
/// Kernel text/data/heap: readable, writable, executable, never user-mode
/// accessible. `start.rs` drops hart 0 into supervisor mode before `kmain`
/// ever runs, and S-mode instruction fetch from a `U=1` page is an
/// unconditional fault (S-mode load/store to one needs `sstatus.SUM=1`,
/// which this kernel never sets) — so every page the kernel itself executes
/// or touches directly must carry `U=0`.
pub const RWX: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::EXEC);

const ENTRIES_PER_TABLE: usize = 512;
const PTE_PPN_SHIFT: u64 = 10;

#[derive(Clone, Copy)]
struct VirtAddrParts {
    vpn: [usize; 3],
    offset: usize,
}

fn decompose(v: usize) -> VirtAddrParts {
    VirtAddrParts {
        vpn: [
            (v >> 12) & 0x1ff,
            (v >> 21) & 0x1ff,
            (v >> 30) & 0x1ff,
        ],
        offset: v & 0xfff,
    }
}

fn pte_addr(pte: u64) -> usize {
    ((pte >> PTE_PPN_SHIFT) << 12) as usize
}

fn make_pte(phys: usize, flags: PteFlags) -> u64 {
    ((phys as u64 >> 12) << PTE_PPN_SHIFT) | flags.bits()
}

struct PageTable {
    root: usize,
}

impl PageTable {
    fn entry_ptr(table_phys: usize, index: usize) -> *mut u64 {
        (table_phys + index * 8) as *mut u64
    }

    fn read_entry(table_phys: usize, index: usize) -> u64 {
        unsafe { read_volatile(Self::entry_ptr(table_phys, index)) }
    }

    fn write_entry(table_phys: usize, index: usize, value: u64) {
        unsafe { write_volatile(Self::entry_ptr(table_phys, index), value) };
    }

    /// Walks down to the leaf PTE for `v`, allocating intermediate
    /// page-table frames as needed when `create` is set.
    fn walk(&mut self, v: usize, create: bool) -> KernelResult<Option<(usize, usize)>> {
        let parts = decompose(v);
        let mut table = self.root;

        for level in (1..3).rev() {
            let idx = parts.vpn[level];
            let entry = Self::read_entry(table, idx);

            if entry & PteFlags::VALID.bits() == 0 {
                if !create {
                    return Ok(None);
                }
                let frame = pmm::alloc()?;
                // A non-leaf PTE is identified by R=W=X=0; setting any of
                // those here would make the hardware walker treat this
                // entry as a giant-page leaf instead of a pointer to the
                // next level.
                let new_entry = make_pte(frame, PteFlags::VALID);
                Self::write_entry(table, idx, new_entry);
                table = frame;
            } else {
                table = pte_addr(entry);
            }
        }

        Ok(Some((table, parts.vpn[0])))
    }
}

pub struct VirtualMemoryManager {
    kernel_table: PageTable,
}

impl VirtualMemoryManager {
    /// Allocates the root page-table frame. Idempotent in the sense that
    /// calling it twice just leaks the first frame (matches the source's
    /// "page-table frames are never reclaimed" design note); callers only
    /// ever call it once in practice.
    pub fn init() -> KernelResult<Self> {
        let root = pmm::alloc()?;
        Ok(VirtualMemoryManager {
            kernel_table: PageTable { root },
        })
    }

    pub fn root(&self) -> usize {
        self.kernel_table.root
    }

    /// Requires both `v` and `p` frame-aligned. Overwriting an existing
    /// mapping is permitted; the previous physical frame is not freed.
    pub fn map(&mut self, v: usize, p: usize, flags: PteFlags) -> KernelResult<()> {
        if v % PAGE_SIZE != 0 || p % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let (table, leaf_idx) = self
            .kernel_table
            .walk(v, true)?
            .expect("walk(create=true) always yields a leaf slot");
        let entry = make_pte(p, flags | PteFlags::VALID);
        PageTable::write_entry(table, leaf_idx, entry);
        Ok(())
    }

    /// `alloc + map`, with the fresh frame freed back to the allocator if
    /// the mapping step fails.
    pub fn map_page(&mut self, v: usize, flags: PteFlags) -> KernelResult<usize> {
        let frame = pmm::alloc()?;
        if let Err(e) = self.map(v, frame, flags) {
            pmm::free(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Clears the PTE for `v`. Returns the physical frame to the allocator
    /// when `free_phys` is set. Page-table frames are never reclaimed even
    /// once emptied — a documented leak, acceptable for this kernel's
    /// lifetime.
    pub fn unmap(&mut self, v: usize, free_phys: bool) -> KernelResult<()> {
        let (table, leaf_idx) = self
            .kernel_table
            .walk(v, false)?
            .ok_or(KernelError::NotFound)?;
        let entry = PageTable::read_entry(table, leaf_idx);
        if entry & PteFlags::VALID.bits() == 0 {
            return Err(KernelError::NotFound);
        }
        let phys = pte_addr(entry);
        PageTable::write_entry(table, leaf_idx, 0);
        if free_phys {
            pmm::free(phys);
        }
        Ok(())
    }

    pub fn translate(&mut self, v: usize) -> Option<usize> {
        let (table, leaf_idx) = self.kernel_table.walk(v, false).ok()??;
        let entry = PageTable::read_entry(table, leaf_idx);
        if entry & PteFlags::VALID.bits() == 0 {
            return None;
        }
        Some(pte_addr(entry) | decompose(v).offset)
    }

    /// Loads `satp` with this table's root frame (Sv39 mode) and fences.
    ///
    /// # Safety
    /// The mapped address space must contain the code currently executing,
    /// at identical virtual addresses, or control flow will fault on the
    /// next instruction fetch.
    #[cfg(not(test))]
    pub unsafe fn activate(&self) {
        let ppn = (self.kernel_table.root >> 12) as u64;
        let satp: u64 = (8u64 << 60) | ppn; // mode=8 => Sv39
        unsafe {
            core::arch::asm!("csrw satp, {0}", "sfence.vma", in(reg) satp);
        }
    }
}

/// Diagnostic hook invoked from the trap handler on a store/load/instruction
/// page fault. Currently just a place to hang a future COW/demand-paging
/// handler; this kernel has neither, so it always indicates a fatal fault.
pub fn page_fault(fault_addr: usize, cause: usize) {
    crate::kernel_log_line!("page fault at {:#x}, scause={:#x}", fault_addr, cause);
}

pub static VMM: OnceCell<Mutex<VirtualMemoryManager>> = OnceCell::uninit();

pub fn init() {
    let vmm = VirtualMemoryManager::init().expect("vmm::init requires free frames");
    VMM.try_init_once(|| Mutex::new(vmm))
        .map_err(|_| ())
        .expect("vmm::init should only be called once");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_test_pmm<F: FnOnce()>(f: F) {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            let bytes = vec![0u8; 64 * 1024 * 1024].into_boxed_slice();
            let start = Box::leak(bytes).as_mut_ptr() as usize;
            let aligned = (start + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
            unsafe { crate::pmm::init(aligned, aligned + 32 * 1024 * 1024) };
        });
        f();
    }

    #[test]
    fn map_translate_unmap_roundtrip() {
        with_test_pmm(|| {
            let mut vmm = VirtualMemoryManager::init().unwrap();
            let before = crate::pmm::PMM.get().unwrap().lock().free_frames();
            let frame = vmm.map_page(0x4000_0000, RW).unwrap();
            assert_eq!(vmm.translate(0x4000_0000), Some(frame));
            vmm.unmap(0x4000_0000, true).unwrap();
            assert_eq!(vmm.translate(0x4000_0000), None);
            let after = crate::pmm::PMM.get().unwrap().lock().free_frames();
            assert_eq!(before, after);
        });
    }

    #[test]
    fn remap_does_not_leak_frames() {
        with_test_pmm(|| {
            let mut vmm = VirtualMemoryManager::init().unwrap();
            let f1 = crate::pmm::alloc().unwrap();
            vmm.map(0x5000_0000, f1, RW).unwrap();
            let f2 = crate::pmm::alloc().unwrap();
            vmm.map(0x5000_0000, f2, RW).unwrap();
            assert_eq!(vmm.translate(0x5000_0000), Some(f2));
            crate::pmm::free(f1);
            crate::pmm::free(f2);
        });
    }

    #[test]
    fn unaligned_map_is_invalid_argument() {
        with_test_pmm(|| {
            let mut vmm = VirtualMemoryManager::init().unwrap();
            assert_eq!(vmm.map(0x1001, 0x2000, RW), Err(KernelError::InvalidArgument));
        });
    }
}
