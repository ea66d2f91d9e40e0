//! Round-robin scheduler over the process table (§4.4). Ready/zombie/blocked
//! queues are `VecDeque<ProcId>` over the `proc::PROC_TABLE` slab rather than
//! the teacher's `Arc<Mutex<Thread>>` graph — a PCB's lifetime here is
//! exactly its process's lifetime, so there is no shared ownership to model.

use crate::config::{HEAP_USER_BASE, PAGE_SIZE, PER_PROC_HEAP};
use crate::error::KernelResult;
use crate::pmm;
use crate::proc::{Context, ProcId, ProcState, PROC_TABLE};
use crate::{kernel_log, kernel_log_line};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::mem::offset_of;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

static READY: Mutex<VecDeque<ProcId>> = Mutex::new(VecDeque::new());
static ZOMBIES: Mutex<VecDeque<ProcId>> = Mutex::new(VecDeque::new());
static BLOCKED: Mutex<VecDeque<ProcId>> = Mutex::new(VecDeque::new());
/// Processes parked by `sys_sleep`, paired with the tick count at which
/// they become eligible for `ready_queue` again.
static SLEEPING: Mutex<Vec<(ProcId, u64)>> = Mutex::new(Vec::new());
static CURRENT: Mutex<Option<ProcId>> = Mutex::new(None);
static IDLE: OnceCell<ProcId> = OnceCell::uninit();
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Saved/restored by `switch_context`: `ra`, `sp`, `s0..s11`. See
/// `proc::Context` for the field layout; this is purely the asm contract.
#[naked]
unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    core::arch::naked_asm!(
        concat!("
            sd ra, {off_ra}(a0)
            sd sp, {off_sp}(a0)
            sd s0, {off_s0}(a0)
            sd s1, {off_s1}(a0)
            sd s2, {off_s2}(a0)
            sd s3, {off_s3}(a0)
            sd s4, {off_s4}(a0)
            sd s5, {off_s5}(a0)
            sd s6, {off_s6}(a0)
            sd s7, {off_s7}(a0)
            sd s8, {off_s8}(a0)
            sd s9, {off_s9}(a0)
            sd s10, {off_s10}(a0)
            sd s11, {off_s11}(a0)

            ld ra, {off_ra}(a1)
            ld sp, {off_sp}(a1)
            ld s0, {off_s0}(a1)
            ld s1, {off_s1}(a1)
            ld s2, {off_s2}(a1)
            ld s3, {off_s3}(a1)
            ld s4, {off_s4}(a1)
            ld s5, {off_s5}(a1)
            ld s6, {off_s6}(a1)
            ld s7, {off_s7}(a1)
            ld s8, {off_s8}(a1)
            ld s9, {off_s9}(a1)
            ld s10, {off_s10}(a1)
            ld s11, {off_s11}(a1)

            ret
            "),
        off_ra = const(offset_of!(Context, ra)),
        off_sp = const(offset_of!(Context, sp)),
        off_s0 = const(offset_of!(Context, s0)),
        off_s1 = const(offset_of!(Context, s1)),
        off_s2 = const(offset_of!(Context, s2)),
        off_s3 = const(offset_of!(Context, s3)),
        off_s4 = const(offset_of!(Context, s4)),
        off_s5 = const(offset_of!(Context, s5)),
        off_s6 = const(offset_of!(Context, s6)),
        off_s7 = const(offset_of!(Context, s7)),
        off_s8 = const(offset_of!(Context, s8)),
        off_s9 = const(offset_of!(Context, s9)),
        off_s10 = const(offset_of!(Context, s10)),
        off_s11 = const(offset_of!(Context, s11)),
    );
}

/// Trampoline that every freshly created process resumes into on its first
/// context switch: re-enable interrupts, then fall through to `sret`-based
/// user entry arranged by whoever built the PCB's trapframe. Never called
/// directly; its address is the `ra` baked into a new process's `Context`.
extern "C" fn forkret() {
    crate::trap::intr_on();
    crate::trap::trap_return();
}

/// Creates the idle PCB (pid reserved by the process table's normal
/// allocator), off-queue, running `wfi` in a loop. Must run once before the
/// first call to `schedule`.
pub fn init() {
    let pid = {
        let mut table = PROC_TABLE.lock();
        table
            .create("idle", idle_entry as usize, 0)
            .expect("idle process must be creatable at boot")
    };

    {
        let mut table = PROC_TABLE.lock();
        let pcb = table.get_mut(pid).expect("just created");
        // Idle never runs user code and never returns from a trap, so it
        // skips forkret/trap_return entirely: its saved `ra` is the idle
        // loop itself, reached by plain `ret` out of switch_context.
        pcb.context.ra = idle_entry as u64;
        pcb.context.sp = pcb.kstack_top() as u64;
        pcb.entry_pc = idle_entry as usize;
    }

    IDLE.try_init_once(|| pid)
        .map_err(|_| ())
        .expect("scheduler::init should only be called once");
}

extern "C" fn idle_entry() -> ! {
    crate::trap::intr_on();
    loop {
        unsafe {
            core::arch::asm!("wfi");
        }
    }
}

pub fn enqueue_ready(pid: ProcId) {
    READY.lock().push_back(pid);
}

pub fn current() -> Option<ProcId> {
    *CURRENT.lock()
}

/// Runs with interrupts disabled, per §4.4's policy. Callers are
/// responsible for having disabled interrupts already (the trap handler and
/// `proc_exit` both do).
pub fn schedule() {
    let idle = *IDLE.get().expect("scheduler::init must run first");

    let next = READY.lock().pop_front();
    let cur = *CURRENT.lock();

    let next = match next {
        Some(n) => n,
        None => {
            let running_non_idle = cur.is_some_and(|c| {
                c != idle
                    && PROC_TABLE
                        .lock()
                        .get(c)
                        .map(|p| p.state == ProcState::Running)
                        .unwrap_or(false)
            });
            if running_non_idle {
                cur.unwrap()
            } else {
                idle
            }
        }
    };

    if Some(next) == cur {
        if let Some(c) = cur {
            if PROC_TABLE.lock().get(c).map(|p| p.state) == Some(ProcState::Running) {
                zombies_free();
                crate::trap::intr_on();
                return;
            }
        }
    }

    let mut old_ctx_ptr: *mut Context = core::ptr::null_mut();
    let new_ctx_ptr: *const Context;

    {
        let mut table = PROC_TABLE.lock();

        if let Some(c) = cur {
            if table.get(c).map(|p| p.state) == Some(ProcState::Running) {
                if c != idle {
                    table.get_mut(c).unwrap().state = ProcState::Ready;
                    drop(table);
                    enqueue_ready(c);
                    table = PROC_TABLE.lock();
                }
            }
            old_ctx_ptr = &mut table.get_mut(c).unwrap().context as *mut Context;
        }

        table.get_mut(next).unwrap().state = ProcState::Running;
        new_ctx_ptr = &table.get(next).unwrap().context as *const Context;
    }

    *CURRENT.lock() = Some(next);

    static mut DUMMY: Context = Context {
        ra: 0,
        sp: 0,
        s0: 0,
        s1: 0,
        s2: 0,
        s3: 0,
        s4: 0,
        s5: 0,
        s6: 0,
        s7: 0,
        s8: 0,
        s9: 0,
        s10: 0,
        s11: 0,
    };
    if old_ctx_ptr.is_null() {
        old_ctx_ptr = &raw mut DUMMY;
    }

    unsafe {
        switch_context(old_ctx_ptr, new_ctx_ptr);
    }

    // We were switched back into; reap zombies and re-enable interrupts.
    zombies_free();
    crate::trap::intr_on();
}

/// Marks `current` terminated, splices it onto the zombie list, and
/// reschedules. Never returns.
pub fn proc_exit(code: i64) -> ! {
    crate::trap::intr_off();

    let pid = current().expect("proc_exit with no current process");
    {
        let mut table = PROC_TABLE.lock();
        let pcb = table.get_mut(pid).expect("current process must exist");
        pcb.state = ProcState::Terminated;
        pcb.exit_code = code;
    }
    ZOMBIES.lock().push_back(pid);

    schedule();

    kernel_log_line!("proc_exit: schedule() returned into a dead process, halting");
    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}

/// Runs on every return from `schedule()`. Frees the kernel stack and PCB
/// of every zombie except `current` (never reap the context we are
/// executing on).
pub fn zombies_free() {
    let cur = current();
    let mut zombies = ZOMBIES.lock();
    let mut still_zombie = VecDeque::new();

    while let Some(pid) = zombies.pop_front() {
        if Some(pid) == cur {
            still_zombie.push_back(pid);
            continue;
        }
        let mut table = PROC_TABLE.lock();
        if let Some(pcb) = table.get(pid) {
            if pcb.state != ProcState::Terminated {
                continue;
            }
            let kstack = pcb.kstack_base;
            let ustack = pcb.ustack_base;
            table.remove(pid);
            drop(table);
            crate::pmm::free(kstack);
            // `ustack_base` is 0 for processes that never got their own user
            // stack frame (e.g. a forked child, which shares the parent's
            // trapframe/stack and so doesn't own one to free).
            if ustack != 0 {
                crate::pmm::free(ustack);
            }
        }
    }

    *zombies = still_zombie;
}

/// Allocates a child PCB, copies the parent's trapframe, arranges `a0 = 0`
/// in the child and `return_pc` as its resume point, and enqueues it ready.
/// Returns the child pid.
pub fn proc_fork() -> crate::error::KernelResult<ProcId> {
    let parent_pid = current().expect("fork with no current process");

    let child_pid = {
        let mut table = PROC_TABLE.lock();
        let (name, entry_pc, priority, trapframe, brk_base, brk_size) = {
            let parent = table.get(parent_pid).expect("parent must exist");
            (
                parent.name.clone(),
                parent.entry_pc,
                parent.priority,
                parent.trapframe,
                parent.brk_base,
                parent.brk_size,
            )
        };
        let child_pid = table.create(&name, entry_pc, priority)?;
        let child = table.get_mut(child_pid).unwrap();
        child.trapframe = trapframe;
        child.trapframe.a0 = 0;
        child.brk_base = brk_base;
        child.brk_size = brk_size;
        child.parent_pid = Some(parent_pid);
        child.context.ra = forkret as u64;
        child.context.sp = child.kstack_top() as u64;
        child_pid
    };

    enqueue_ready(child_pid);
    Ok(child_pid)
}

/// Scans the zombie list for a child of `parent_pid`; if found, the caller
/// is responsible for noting the pid before the reaper (`zombies_free`)
/// frees the PCB on a later scheduling pass.
pub fn proc_wait(parent_pid: ProcId) -> i64 {
    let zombies = ZOMBIES.lock();
    for &pid in zombies.iter() {
        let table = PROC_TABLE.lock();
        if let Some(pcb) = table.get(pid) {
            if pcb.parent_pid == Some(parent_pid) {
                return pid as i64;
            }
        }
    }
    -1
}

/// Moves `current` onto the blocked list and reschedules.
pub fn sys_suspend() {
    crate::trap::intr_off();
    let pid = current().expect("suspend with no current process");
    {
        let mut table = PROC_TABLE.lock();
        table.get_mut(pid).unwrap().state = ProcState::Blocked;
    }
    BLOCKED.lock().push_back(pid);
    schedule();
}

/// Locates `pid` in any queue and forces it into the zombie pipeline.
pub fn sys_kill(pid: ProcId) -> i64 {
    let mut table = PROC_TABLE.lock();
    let Some(pcb) = table.get_mut(pid) else {
        return -1;
    };
    if pcb.state == ProcState::Terminated {
        return -1;
    }
    pcb.state = ProcState::Terminated;
    drop(table);

    let mut blocked = BLOCKED.lock();
    blocked.retain(|&p| p != pid);
    drop(blocked);
    let mut ready = READY.lock();
    ready.retain(|&p| p != pid);
    drop(ready);

    ZOMBIES.lock().push_back(pid);
    0
}

pub fn wake_blocked(pid: ProcId) {
    let mut blocked = BLOCKED.lock();
    if let Some(pos) = blocked.iter().position(|&p| p == pid) {
        blocked.remove(pos);
        drop(blocked);
        PROC_TABLE.lock().get_mut(pid).unwrap().state = ProcState::Ready;
        enqueue_ready(pid);
    }
}

/// Creates a process whose first resume lands at `entry` (§4.4 creation,
/// §4.7 `exec`'s "rewrite saved state to resemble program entry" — this is
/// the same arrangement, just for a brand-new PCB rather than an existing
/// one). Allocates one frame as the initial user stack, recorded in the PCB
/// so `zombies_free` can reclaim it; the kernel's page table already covers
/// all of physical RAM, so no separate mapping step is needed (§9: no
/// protection between processes beyond the per-pid heap window).
///
/// The trapframe's `sstatus` keeps `SPP=1`: `sret` resumes in supervisor
/// mode, not user mode. This kernel has exactly one identity-mapped address
/// space with no per-process page tables, and the demo programs this spawns
/// are linked into the same kernel text they `ecall` out of — there is no
/// way to give that text `U=1` for a demo's fetch without also giving it
/// `U=1` for the kernel's own fetch, which supervisor mode can never
/// tolerate. A real U=0/U=1 split would need demo code relinked into its own
/// page-aligned, separately-mapped region; nothing in this kernel's loader
/// does that (`exec` just resolves a name to an `fn()` pointer, see
/// `user.rs`), so "user" here is a scheduling and accounting distinction,
/// not a hardware privilege one, matching §9's ruling out of cross-process
/// memory protection.
pub fn spawn_user(name: &str, entry: usize, priority: u8) -> KernelResult<ProcId> {
    let stack_frame = pmm::alloc()?;

    let pid = {
        let mut table = PROC_TABLE.lock();
        let pid = match table.create(name, entry, priority) {
            Ok(pid) => pid,
            Err(e) => {
                pmm::free(stack_frame);
                return Err(e);
            }
        };
        let pcb = table.get_mut(pid).expect("just created");
        pcb.context.ra = forkret as u64;
        pcb.context.sp = pcb.kstack_top() as u64;
        pcb.brk_base = HEAP_USER_BASE + pid * PER_PROC_HEAP;
        pcb.ustack_base = stack_frame;
        pcb.trapframe.sepc = entry as u64;
        pcb.trapframe.sp = (stack_frame + PAGE_SIZE) as u64;
        pcb.trapframe.sstatus = (1 << 5) | (1 << 8); // SPIE set, SPP=1 (stay in S-mode) for sret
        pid
    };

    enqueue_ready(pid);
    Ok(pid)
}

/// Parks `current` on the sleep list until `ticks` timer interrupts have
/// elapsed, then reschedules. Uninterruptible (§5): nothing wakes it early.
pub fn sys_sleep(ticks: u64) {
    if ticks == 0 {
        return;
    }
    crate::trap::intr_off();
    let pid = current().expect("sleep with no current process");
    let wake_at = TICKS.load(Ordering::Relaxed) + ticks;
    {
        let mut table = PROC_TABLE.lock();
        table.get_mut(pid).unwrap().state = ProcState::Blocked;
    }
    SLEEPING.lock().push((pid, wake_at));
    schedule();
}

fn wake_sleepers(now: u64) {
    let mut sleeping = SLEEPING.lock();
    let mut still_asleep = Vec::new();
    for (pid, wake_at) in sleeping.drain(..) {
        if now >= wake_at {
            let mut table = PROC_TABLE.lock();
            if let Some(pcb) = table.get_mut(pid) {
                if pcb.state == ProcState::Blocked {
                    pcb.state = ProcState::Ready;
                    drop(table);
                    enqueue_ready(pid);
                    continue;
                }
            }
        } else {
            still_asleep.push((pid, wake_at));
        }
    }
    *sleeping = still_asleep;
}

/// Tick handler invoked from the timer trap path: accounts CPU time,
/// advances the tick counter, wakes any `sys_sleep`ers whose deadline has
/// passed, and reschedules unconditionally (§4.3: every timer interrupt
/// reprograms the comparator and invokes the scheduler).
pub fn on_timer_tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if let Some(pid) = current() {
        let mut table = PROC_TABLE.lock();
        if let Some(pcb) = table.get_mut(pid) {
            pcb.cpu_time += 1;
        }
    }
    wake_sleepers(now);
    schedule();
}

const _: () = assert!(PAGE_SIZE > 0);
