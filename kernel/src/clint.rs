//! Core Local Interruptor: `mtime`, the per-HART `mtimecmp` comparator, and
//! the machine-mode timer trap vector that turns CLINT ticks into the
//! supervisor-software-interrupt `trap.rs` dispatches on.
//!
//! RISC-V's machine timer interrupt (`mip`/`mideleg` bit 7) is not a
//! delegable interrupt source — the bit is hardwired to zero on real
//! hardware and in QEMU, so `start::mstart`'s blanket `mideleg` write can
//! never route it to `stvec` directly. Every bare-metal RISC-V kernel that
//! owns its own timer (rather than asking an SBI implementation to do it)
//! works around this the same way xv6-riscv's `timervec`/`kernelvec.S`
//! does: a tiny machine-mode handler reprograms `mtimecmp` and then injects
//! a supervisor software interrupt (`sip.SSIP`, which *is* a delegable,
//! S-mode-writable bit) before `mret`-ing straight back to whatever was
//! running. `trap.rs`'s vector then sees an ordinary supervisor trap.

use crate::config::{CLINT_BASE, CLINT_MTIMECMP_OFFSET, CLINT_MTIME_OFFSET, TIMER_INTERVAL};
use core::ptr::{read_volatile, write_volatile};

fn mtime_ptr() -> *mut u64 {
    (CLINT_BASE + CLINT_MTIME_OFFSET) as *mut u64
}

fn mtimecmp_ptr(hartid: usize) -> *mut u64 {
    (CLINT_BASE + CLINT_MTIMECMP_OFFSET + 8 * hartid) as *mut u64
}

pub fn now() -> u64 {
    unsafe { read_volatile(mtime_ptr()) }
}

/// Scratch area `timervec` uses to save/restore the three registers it
/// clobbers and to find this HART's `mtimecmp` address and tick interval,
/// without touching the stack (machine mode has none of its own here).
/// Field order and offsets (0/8/16/24/32) are load-bearing: `timervec`
/// indexes into this by raw byte offset.
#[repr(C)]
struct TimerScratch {
    saved: [u64; 3],
    mtimecmp_addr: u64,
    interval: u64,
}

// Single-HART kernel (§1 Non-goals: no SMP) — one scratch area suffices.
static mut TIMER_SCRATCH: TimerScratch = TimerScratch {
    saved: [0; 3],
    mtimecmp_addr: 0,
    interval: 0,
};

/// Machine-mode trap vector, installed in `mtvec` by `init_mtime_trap`.
/// Reprograms `mtimecmp` for the next tick, then sets `sip.SSIP` (value 2)
/// so the pending interrupt is visible to supervisor mode as an ordinary,
/// delegable supervisor software interrupt once this `mret`s back.
#[naked]
unsafe extern "C" fn timervec() {
    core::arch::naked_asm!(concat!(
        "csrrw a0, mscratch, a0\n",
        "sd a1, 0(a0)\n",
        "sd a2, 8(a0)\n",
        "sd a3, 16(a0)\n",

        "ld a1, 24(a0)\n", // a1 = &mtimecmp
        "ld a2, 32(a0)\n", // a2 = interval
        "ld a3, 0(a1)\n",
        "add a3, a3, a2\n",
        "sd a3, 0(a1)\n",

        "li a1, 2\n", // SSIP
        "csrs sip, a1\n",

        "ld a3, 16(a0)\n",
        "ld a2, 8(a0)\n",
        "ld a1, 0(a0)\n",
        "csrrw a0, mscratch, a0\n",

        "mret\n",
    ));
}

/// Arms the first tick, points `mscratch` at this HART's `TimerScratch`,
/// installs `timervec` as the machine-mode trap vector, and unmasks the
/// machine timer interrupt line. Must run in machine mode, once, before
/// `mret` drops to supervisor mode — from that point on, machine-mode
/// interrupts are unconditionally live regardless of `mstatus.MIE` (RISC-V
/// guarantees traps to a stricter privilege mode are never masked while
/// running less-privileged), so no further arming is needed.
///
/// # Safety
/// Must be called from machine mode, exactly once, on the boot HART.
pub unsafe fn init_mtime_trap(hartid: usize) {
    let scratch = &raw mut TIMER_SCRATCH;
    unsafe {
        (*scratch).mtimecmp_addr = mtimecmp_ptr(hartid) as u64;
        (*scratch).interval = TIMER_INTERVAL;
        write_volatile(mtimecmp_ptr(hartid), now() + TIMER_INTERVAL);

        core::arch::asm!("csrw mscratch, {0}", in(reg) scratch as usize);
        core::arch::asm!("csrw mtvec, {0}", in(reg) timervec as usize);
        core::arch::asm!("csrs mie, {0}", in(reg) 1u64 << 7); // MTIE
    }
}
