//! Kernel entry point. QEMU's `virt` machine resets hart 0 straight into
//! machine mode at the kernel's load address (no firmware sits in front of
//! us here, since the launcher passes `-bios none`); `start.rs` gets us down
//! into supervisor mode and calls `kmain`, which brings up every subsystem
//! in dependency order and then hands off to the scheduler for good.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(naked_functions)]

extern crate alloc;

// The riscv64-only subsystems (raw CSR access, naked trap/context-switch
// vectors, the `ecall` demo wrapper) cannot assemble for the host target
// `cargo test` otherwise runs unit tests under, so they are cut out of that
// build entirely. None of them carry `#[cfg(test)]` tests of their own (see
// DESIGN.md) — the hardware-independent core (`pmm`, `vmm`'s map/unmap
// logic, `proc`, `fs`'s directory-entry codec) does, and stays compiled
// either way.
#[cfg(not(test))]
mod clint;
mod config;
#[cfg(not(test))]
mod demos;
mod error;
mod fs;
#[cfg(not(test))]
mod panic;
#[cfg(not(test))]
mod plic;
mod pmm;
mod proc;
#[cfg(not(test))]
mod scheduler;
#[cfg(not(test))]
mod start;
#[cfg(not(test))]
mod syscall;
#[cfg(not(test))]
mod trap;
mod uart;
#[cfg(not(test))]
mod user;
mod virtio;
mod vmm;

#[cfg(not(test))]
use config::{
    CLINT_BASE, HEAP_END, HEAP_START, KERNEL_HEAP_SIZE, KERNEL_HEAP_START, PAGE_SIZE, PLIC_BASE,
    UART0_BASE, VIRTIO_MMIO_BASE, VIRTIO_MMIO_SLOTS, VIRTIO_MMIO_STRIDE,
};
use linked_list_allocator::LockedHeap;

/// Backs `alloc::*` inside the kernel itself. Separate from the page-frame
/// allocator (`pmm`), which hands out whole frames to the VMM.
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Identity-maps one or more pages covering `[base, base+len)` with `flags`,
/// rounding down/up to page boundaries. Used for MMIO windows, where the
/// physical and "virtual" address are the same thing by construction (this
/// kernel runs out of a single, shared, always-identity-mapped address space
/// rather than per-process ones).
#[cfg(not(test))]
fn identity_map_range(vmm: &mut vmm::VirtualMemoryManager, base: usize, len: usize, flags: vmm::PteFlags) {
    let start = base / PAGE_SIZE * PAGE_SIZE;
    let end = (base + len).div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let mut addr = start;
    while addr < end {
        vmm.map(addr, addr, flags).expect("identity map must not fail during boot");
        addr += PAGE_SIZE;
    }
}

/// Runs on hart 0 in supervisor mode, called by `start::mstart` after the
/// privilege transition. Brings every subsystem up in the order each one
/// depends on the last, then falls into the scheduler and never returns.
#[cfg(not(test))]
pub extern "C" fn kmain(hartid: usize) -> ! {
    unsafe {
        ALLOCATOR
            .lock()
            .init(KERNEL_HEAP_START as *mut u8, KERNEL_HEAP_SIZE);
    }

    kernel_log_line!();
    kernel_log_line!("booting on hart {}", hartid);

    unsafe { pmm::init(HEAP_START, HEAP_END) };
    vmm::init();

    {
        let vmm_lock = vmm::VMM.get().expect("vmm::init just ran");
        let mut v = vmm_lock.lock();

        // All of managed RAM, executable (the kernel image itself lives
        // below HEAP_START but is covered separately, see below). Mapped
        // U=0: "user" processes in this kernel never actually leave
        // supervisor mode (see scheduler::spawn_user), so nothing needs a
        // U=1 view of this range, and the kernel itself must never get one
        // (S-mode fetch from a U=1 page always faults).
        identity_map_range(&mut v, HEAP_START, HEAP_END - HEAP_START, vmm::RWX);
        // The kernel's own text/data, below the managed heap. Same U=0
        // requirement: this is the region `activate()` below immediately
        // fetches its next instruction from.
        identity_map_range(&mut v, 0x8000_0000, HEAP_START - 0x8000_0000, vmm::RWX);
        // The bump heap backing `alloc::*`, which sits past the pmm-managed
        // region and is touched constantly (every `String`/`Vec`) once
        // paging is live — it has to be mapped before `activate()`, not just
        // identity-addressed by happenstance.
        identity_map_range(&mut v, KERNEL_HEAP_START, KERNEL_HEAP_SIZE, vmm::RW);

        identity_map_range(&mut v, UART0_BASE, PAGE_SIZE, vmm::RW);
        identity_map_range(
            &mut v,
            VIRTIO_MMIO_BASE,
            VIRTIO_MMIO_SLOTS * VIRTIO_MMIO_STRIDE,
            vmm::RW,
        );
        identity_map_range(&mut v, PLIC_BASE, 0x20_1000, vmm::RW);
        identity_map_range(&mut v, CLINT_BASE, 0xc000, vmm::RW);
    }

    unsafe {
        vmm::VMM
            .get()
            .expect("vmm::init just ran")
            .lock()
            .activate();
    }
    kernel_log_line!("vmm: Sv39 paging active");

    trap::init(hartid);
    kernel_log_line!("trap: stvec installed, timer armed");

    virtio::init().expect("virtio-blk device must be present");
    kernel_log_line!("virtio: block device ready");

    fs::init().expect("filesystem must mount or format cleanly");
    kernel_log_line!("fs: mounted");

    scheduler::init();
    kernel_log_line!("scheduler: idle process ready, entering dispatch loop");

    let shell_entry = user::lookup("shell").expect("shell must be in the program table");
    scheduler::spawn_user("shell", shell_entry as usize, 1)
        .expect("shell must be spawnable at boot");
    kernel_log_line!("scheduler: shell spawned");

    trap::intr_on();
    scheduler::schedule();

    // schedule() only returns here if there was never a process to switch
    // to, which cannot happen once the idle process exists.
    kernel_log_line!("kmain: schedule() returned unexpectedly, halting");
    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}
