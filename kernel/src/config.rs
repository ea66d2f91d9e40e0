//! Compile-time layout constants for the QEMU `virt` machine and the kernel's
//! own bookkeeping structures. Stands in for the teacher's per-boot
//! `BootloaderConfig`: nothing here is negotiated at runtime, it is all fixed
//! before the first instruction executes.

pub const PAGE_SIZE: usize = 4096;

/// Physical memory handed to the page-frame allocator. QEMU `virt` places
/// RAM at 0x8000_0000; the kernel image itself occupies the first stretch of
/// it, so the managed heap starts well past the image and link-time symbols.
pub const HEAP_START: usize = 0x8020_0000;
pub const HEAP_SIZE: usize = 32 * 1024 * 1024;
pub const HEAP_END: usize = HEAP_START + HEAP_SIZE;

/// Bump allocator backing `alloc::*` inside the kernel itself (separate from
/// the page-frame allocator, which hands out whole frames to the VMM).
pub const KERNEL_HEAP_START: usize = 0x8600_0000;
pub const KERNEL_HEAP_SIZE: usize = 4 * 1024 * 1024;

pub const MAX_PROCS: usize = 64;
pub const KSTACK_PAGES: usize = 1;

/// Per-process heap window: process `pid` owns `[HEAP_USER_BASE + pid *
/// PER_PROC_HEAP, HEAP_USER_BASE + (pid+1) * PER_PROC_HEAP)`.
pub const HEAP_USER_BASE: usize = 0x1_0000_0000;
pub const PER_PROC_HEAP: usize = 16 * 1024 * 1024;

pub const TIMER_INTERVAL: u64 = 1_000_000;

pub const UART0_BASE: usize = 0x1000_0000;

pub const VIRTIO_MMIO_BASE: usize = 0x1000_1000;
pub const VIRTIO_MMIO_STRIDE: usize = 0x1000;
pub const VIRTIO_MMIO_SLOTS: usize = 8;
pub const VIRTIO_MAGIC: u32 = 0x7472_6976;
pub const VIRTIO_BLOCK_DEVICE_ID: u32 = 2;

pub const PLIC_BASE: usize = 0x0c00_0000;
pub const PLIC_PRIORITY_OFFSET: usize = 0x0;
pub const PLIC_ENABLE_OFFSET: usize = 0x2000;
pub const PLIC_THRESHOLD_OFFSET: usize = 0x20_0000;
pub const PLIC_CLAIM_OFFSET: usize = 0x20_0004;

pub const CLINT_BASE: usize = 0x0200_0000;
pub const CLINT_MTIMECMP_OFFSET: usize = 0x4000;
pub const CLINT_MTIME_OFFSET: usize = 0xbff8;

/// Filesystem image geometry (§3): 128 blocks of 512 bytes.
pub const BSIZE: usize = 512;
pub const FS_NBLOCKS: usize = 128;
pub const NINODE: usize = 32;
pub const NDIRECT: usize = 10;
pub const NINDIRECT: usize = BSIZE / 4;
pub const MAXFILE: usize = NDIRECT + NINDIRECT;
pub const FS_MAGIC: u32 = 0x4d4f_5346;
pub const ROOT_INUM: u32 = 1;

pub const FS_FD_BASE: usize = 3;
pub const FS_MAX_FILES: usize = 16;
