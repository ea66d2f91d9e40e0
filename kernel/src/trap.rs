//! Trap and interrupt dispatch (§4.3). A single assembly vector saves the
//! full integer register file into the interrupted process's `TrapFrame`
//! and calls into `trap_handler`; `trap_return` is its mirror image for the
//! return path. Both are unavoidably assembly, per §9's design note on
//! `switch_context` — the same contract shape applies here.

use crate::config::TIMER_INTERVAL;
use crate::proc::{ProcId, TrapFrame};
use crate::{kernel_log_line, plic, scheduler, syscall, vmm};
use core::mem::offset_of;

const SCAUSE_INTERRUPT_BIT: u64 = 1 << 63;
// The machine timer interrupt can't be delegated to S-mode (see
// clint.rs), so the tick this kernel actually dispatches on arrives as a
// supervisor software interrupt that `clint::init_mtime_trap`'s M-mode
// `timervec` injects once it has reprogrammed `mtimecmp`.
const SCAUSE_S_SOFTWARE: u64 = 1;
const SCAUSE_S_EXTERNAL: u64 = 9;
const SCAUSE_ECALL_FROM_U: u64 = 8;
// Every process this kernel runs stays in supervisor mode (see
// scheduler::spawn_user), so its `ecall`s actually arrive with this cause,
// not SCAUSE_ECALL_FROM_U. Numerically the same value as SCAUSE_S_EXTERNAL,
// but never ambiguous: the interrupt bit (checked first, below) routes one
// to the interrupt match arm and the other to the exception match arm.
const SCAUSE_ECALL_FROM_S: u64 = 9;

const VIRTIO_IRQ_BASE: u32 = 1;

pub fn intr_on() {
    unsafe { core::arch::asm!("csrsi sstatus, 0x2") };
}

pub fn intr_off() {
    unsafe { core::arch::asm!("csrci sstatus, 0x2") };
}

pub fn intr_enabled() -> bool {
    let sstatus: u64;
    unsafe { core::arch::asm!("csrr {0}, sstatus", out(reg) sstatus) };
    sstatus & 0x2 != 0
}

/// Installs `trap_entry` as the direct (non-vectored) `stvec` handler for
/// this HART and unmasks the interrupt sources it handles. The first timer
/// tick is already armed by `clint::init_mtime_trap`, run earlier in
/// machine mode by `start::mstart`.
pub fn init(hartid: usize) {
    let _ = hartid;
    unsafe {
        core::arch::asm!("csrw stvec, {0}", in(reg) trap_entry as usize);
        // sie: enable the supervisor software interrupt (bit 1, the
        // M-mode timervec's tick channel) and external interrupts
        // (bit 9, PLIC-routed).
        core::arch::asm!("csrsi sie, 0", options(nomem, nostack));
        core::arch::asm!("csrs sie, {0}", in(reg) (1u64 << 1) | (1u64 << 9));
    }
    plic::init();
}

/// Assembly trap vector: saves the full GPR file to `sscratch` (the
/// interrupted process's `TrapFrame`), calls `trap_handler`, restores, and
/// `sret`s. Mirrors the teacher's IDT-entry save/restore shells, just
/// collapsed to the single vector RISC-V's direct `stvec` mode uses.
#[naked]
unsafe extern "C" fn trap_entry() {
    core::arch::naked_asm!(
        concat!("
            csrrw sp, sscratch, sp
            sd ra,  {off_ra}(sp)
            sd gp,  {off_gp}(sp)
            sd tp,  {off_tp}(sp)
            sd t0,  {off_t0}(sp)
            sd t1,  {off_t1}(sp)
            sd t2,  {off_t2}(sp)
            sd s0,  {off_s0}(sp)
            sd s1,  {off_s1}(sp)
            sd a0,  {off_a0}(sp)
            sd a1,  {off_a1}(sp)
            sd a2,  {off_a2}(sp)
            sd a3,  {off_a3}(sp)
            sd a4,  {off_a4}(sp)
            sd a5,  {off_a5}(sp)
            sd a6,  {off_a6}(sp)
            sd a7,  {off_a7}(sp)
            sd s2,  {off_s2}(sp)
            sd s3,  {off_s3}(sp)
            sd s4,  {off_s4}(sp)
            sd s5,  {off_s5}(sp)
            sd s6,  {off_s6}(sp)
            sd s7,  {off_s7}(sp)
            sd s8,  {off_s8}(sp)
            sd s9,  {off_s9}(sp)
            sd s10, {off_s10}(sp)
            sd s11, {off_s11}(sp)
            sd t3,  {off_t3}(sp)
            sd t4,  {off_t4}(sp)
            sd t5,  {off_t5}(sp)
            sd t6,  {off_t6}(sp)

            csrr t0, sepc
            sd t0, {off_sepc}(sp)
            csrr t0, sstatus
            sd t0, {off_sstatus}(sp)

            csrrw t0, sscratch, sp
            sd t0, {off_sp}(sp)

            mv a0, sp
            call {handler}

            ld t0, {off_sp}(sp)
            csrw sscratch, t0

            ld t0, {off_sepc}(sp)
            csrw sepc, t0
            ld t0, {off_sstatus}(sp)
            csrw sstatus, t0

            ld ra,  {off_ra}(sp)
            ld gp,  {off_gp}(sp)
            ld tp,  {off_tp}(sp)
            ld t0,  {off_t0}(sp)
            ld t1,  {off_t1}(sp)
            ld t2,  {off_t2}(sp)
            ld s0,  {off_s0}(sp)
            ld s1,  {off_s1}(sp)
            ld a0,  {off_a0}(sp)
            ld a1,  {off_a1}(sp)
            ld a2,  {off_a2}(sp)
            ld a3,  {off_a3}(sp)
            ld a4,  {off_a4}(sp)
            ld a5,  {off_a5}(sp)
            ld a6,  {off_a6}(sp)
            ld a7,  {off_a7}(sp)
            ld s2,  {off_s2}(sp)
            ld s3,  {off_s3}(sp)
            ld s4,  {off_s4}(sp)
            ld s5,  {off_s5}(sp)
            ld s6,  {off_s6}(sp)
            ld s7,  {off_s7}(sp)
            ld s8,  {off_s8}(sp)
            ld s9,  {off_s9}(sp)
            ld s10, {off_s10}(sp)
            ld s11, {off_s11}(sp)
            ld t3,  {off_t3}(sp)
            ld t4,  {off_t4}(sp)
            ld t5,  {off_t5}(sp)
            ld t6,  {off_t6}(sp)
            ld sp,  {off_sp}(sp)

            sret
            "),
        off_ra = const(offset_of!(TrapFrame, ra)),
        off_sp = const(offset_of!(TrapFrame, sp)),
        off_gp = const(offset_of!(TrapFrame, gp)),
        off_tp = const(offset_of!(TrapFrame, tp)),
        off_t0 = const(offset_of!(TrapFrame, t0)),
        off_t1 = const(offset_of!(TrapFrame, t1)),
        off_t2 = const(offset_of!(TrapFrame, t2)),
        off_s0 = const(offset_of!(TrapFrame, s0)),
        off_s1 = const(offset_of!(TrapFrame, s1)),
        off_a0 = const(offset_of!(TrapFrame, a0)),
        off_a1 = const(offset_of!(TrapFrame, a1)),
        off_a2 = const(offset_of!(TrapFrame, a2)),
        off_a3 = const(offset_of!(TrapFrame, a3)),
        off_a4 = const(offset_of!(TrapFrame, a4)),
        off_a5 = const(offset_of!(TrapFrame, a5)),
        off_a6 = const(offset_of!(TrapFrame, a6)),
        off_a7 = const(offset_of!(TrapFrame, a7)),
        off_s2 = const(offset_of!(TrapFrame, s2)),
        off_s3 = const(offset_of!(TrapFrame, s3)),
        off_s4 = const(offset_of!(TrapFrame, s4)),
        off_s5 = const(offset_of!(TrapFrame, s5)),
        off_s6 = const(offset_of!(TrapFrame, s6)),
        off_s7 = const(offset_of!(TrapFrame, s7)),
        off_s8 = const(offset_of!(TrapFrame, s8)),
        off_s9 = const(offset_of!(TrapFrame, s9)),
        off_s10 = const(offset_of!(TrapFrame, s10)),
        off_s11 = const(offset_of!(TrapFrame, s11)),
        off_t3 = const(offset_of!(TrapFrame, t3)),
        off_t4 = const(offset_of!(TrapFrame, t4)),
        off_t5 = const(offset_of!(TrapFrame, t5)),
        off_t6 = const(offset_of!(TrapFrame, t6)),
        off_sepc = const(offset_of!(TrapFrame, sepc)),
        off_sstatus = const(offset_of!(TrapFrame, sstatus)),
        handler = sym trap_handler,
    );
}

/// Jumps to `sret` using whatever `TrapFrame`/`sscratch` is already staged
/// for the current process — used by `forkret` on a brand-new process's
/// first resume, where there was no real trap to return from.
pub fn trap_return() -> ! {
    let pid = scheduler::current().expect("trap_return with no current process");
    let tf_ptr = {
        let mut table = crate::proc::PROC_TABLE.lock();
        let pcb = table.get_mut(pid).expect("current process must exist");
        &mut pcb.trapframe as *mut TrapFrame
    };
    unsafe {
        core::arch::asm!(
            "csrw sscratch, {0}",
            "ld t0, {off_sepc}(t1)",
            "csrw sepc, t0",
            "ld t0, {off_sstatus}(t1)",
            "csrw sstatus, t0",
            "mv sp, t1",
            "ld a0, {off_a0}(sp)",
            "sret",
            in(reg) tf_ptr,
            in("t1") tf_ptr,
            off_sepc = const(offset_of!(TrapFrame, sepc)),
            off_sstatus = const(offset_of!(TrapFrame, sstatus)),
            off_a0 = const(offset_of!(TrapFrame, a0)),
            options(noreturn),
        );
    }
}

fn read_scause() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("csrr {0}, scause", out(reg) v) };
    v
}

fn read_stval() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("csrr {0}, stval", out(reg) v) };
    v
}

/// Called from `trap_entry` with `a0` pointing at the interrupted process's
/// `TrapFrame`. Decodes `scause` and dispatches.
extern "C" fn trap_handler(tf: *mut TrapFrame) {
    let scause = read_scause();
    let is_interrupt = scause & SCAUSE_INTERRUPT_BIT != 0;
    let code = scause & !SCAUSE_INTERRUPT_BIT;

    if is_interrupt {
        match code {
            SCAUSE_S_SOFTWARE => {
                // Acknowledge: mtimecmp was already reprogrammed by
                // timervec before it set this bit.
                unsafe { core::arch::asm!("csrc sip, {0}", in(reg) 2u64) };
                scheduler::on_timer_tick();
            }
            SCAUSE_S_EXTERNAL => {
                let irq = plic::claim();
                if irq >= VIRTIO_IRQ_BASE {
                    crate::virtio::handle_interrupt(irq);
                }
                plic::complete(irq);
            }
            other => kernel_log_line!("unexpected interrupt, scause={:#x}", other),
        }
        return;
    }

    match code {
        SCAUSE_ECALL_FROM_U | SCAUSE_ECALL_FROM_S => {
            let frame = unsafe { &mut *tf };
            frame.sepc += 4;

            let num = frame.a7;
            let args = [frame.a0, frame.a1, frame.a2, frame.a3, frame.a4, frame.a5];

            if num == syscall::SYS_EXEC {
                syscall::exec_rewrite(frame, args[0] as usize);
            } else {
                let ret = syscall::dispatch(num, args, frame.sepc);
                frame.a0 = ret as u64;
            }
        }
        _ => {
            let fault_addr = read_stval() as usize;
            vmm::page_fault(fault_addr, code as usize);
            kernel_log_line!("unhandled exception, scause={:#x}, killing process", code);
            if let Some(pid) = scheduler::current() {
                let _: ProcId = pid;
                scheduler::sys_kill(pid);
                scheduler::schedule();
            }
        }
    }
}

const _: () = assert!(TIMER_INTERVAL > 0);
