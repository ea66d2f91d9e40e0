//! System-call dispatcher (§4.7): a stable syscall-number table, a flat
//! `dispatch` switch, and the one special case (`exec`) that needs to
//! rewrite the caller's saved trap state instead of just returning a value.

use crate::config::{FS_FD_BASE, FS_MAX_FILES, HEAP_USER_BASE, PAGE_SIZE, PER_PROC_HEAP};
use crate::error::KernelError;
use crate::proc::{ProcId, TrapFrame, PROC_TABLE};
use crate::{clint, fs, kernel_log_line, pmm, scheduler, uart, user, vmm};
use alloc::string::String;
use alloc::vec;

pub const SYS_EXIT: u64 = 1;
pub const SYS_GETPID: u64 = 2;
pub const SYS_FORK: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_SBRK: u64 = 5;
pub const SYS_SLEEP: u64 = 6;
pub const SYS_KILL: u64 = 7;
pub const SYS_UPTIME: u64 = 8;
pub const SYS_WRITE: u64 = 9;
pub const SYS_OPEN: u64 = 10;
pub const SYS_READ: u64 = 11;
pub const SYS_CLOSE: u64 = 12;
pub const SYS_LS: u64 = 13;
pub const SYS_GETC: u64 = 14;
pub const SYS_UNLINK: u64 = 15;
pub const SYS_EXEC: u64 = 16;
pub const SYS_TRUNC: u64 = 17;
pub const SYS_PS: u64 = 18;

const MAX_NAME_LEN: usize = 64;

/// Reads a NUL-terminated string out of a raw user pointer. There is no
/// separate user address space to fault against here (§9: no inter-process
/// protection beyond the per-pid heap window), so the only real bound is
/// the NUL terminator or `MAX_NAME_LEN`.
fn read_cstr(ptr: u64) -> Result<String, KernelError> {
    if ptr == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut bytes = vec::Vec::with_capacity(MAX_NAME_LEN);
    for i in 0..MAX_NAME_LEN {
        let byte = unsafe { core::ptr::read((ptr as *const u8).add(i)) };
        if byte == 0 {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.push(byte);
    }
    Err(KernelError::InvalidArgument)
}

fn user_slice_mut(ptr: u64, len: u64) -> &'static mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) }
}

fn user_slice(ptr: u64, len: u64) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) }
}

fn current_pid() -> Option<ProcId> {
    scheduler::current()
}

fn sys_sbrk(incr: i64) -> i64 {
    let Some(pid) = current_pid() else { return -1 };
    let mut table = PROC_TABLE.lock();
    let Some(pcb) = table.get_mut(pid) else { return -1 };

    if pcb.brk_base == 0 {
        pcb.brk_base = HEAP_USER_BASE + pid * PER_PROC_HEAP;
    }
    let old_break = pcb.brk_base + pcb.brk_size;

    if incr <= 0 {
        return old_break as i64;
    }

    let npages = (incr as usize).div_ceil(PAGE_SIZE);
    let Some(vmm_lock) = vmm::VMM.get() else { return -1 };
    let mut v = vmm_lock.lock();
    for i in 0..npages {
        let page = old_break + i * PAGE_SIZE;
        if v.map_page(page, vmm::RW).is_err() {
            return -1;
        }
    }
    drop(v);

    pcb.brk_size += npages * PAGE_SIZE;
    old_break as i64
}

fn sys_write(fd: u64, buf: u64, len: u64) -> i64 {
    let fd = fd as usize;
    if fd == 1 || fd == 2 {
        uart::SERIAL.lock().write_bytes(user_slice(buf, len));
        return len as i64;
    }
    if (FS_FD_BASE..FS_FD_BASE + FS_MAX_FILES).contains(&fd) {
        return match fs::fs_write(fd, user_slice(buf, len)) {
            Ok(n) => n as i64,
            Err(_) => -1,
        };
    }
    -1
}

fn sys_read(fd: u64, buf: u64, len: u64) -> i64 {
    let fd = fd as usize;
    if fd == 0 {
        let dst = user_slice_mut(buf, len);
        for slot in dst.iter_mut() {
            *slot = uart::SERIAL.lock().getc();
        }
        return dst.len() as i64;
    }
    if (FS_FD_BASE..FS_FD_BASE + FS_MAX_FILES).contains(&fd) {
        return match fs::fs_read(fd, user_slice_mut(buf, len)) {
            Ok(n) => n as i64,
            Err(_) => -1,
        };
    }
    -1
}

fn sys_open(name_ptr: u64, create: u64) -> i64 {
    let Ok(name) = read_cstr(name_ptr) else { return -1 };
    let result = if create != 0 {
        fs::fs_create(&name)
    } else {
        fs::fs_open(&name)
    };
    match result {
        Ok(fd) => fd as i64,
        Err(_) => -1,
    }
}

fn sys_ls(buf: u64, max: u64) -> i64 {
    let dst = user_slice_mut(buf, max * 16);
    match fs::fs_list_root(dst, max as usize) {
        Ok(n) => n as i64,
        Err(_) => -1,
    }
}

fn sys_ps() -> i64 {
    let table = PROC_TABLE.lock();
    for pid in 0..crate::config::MAX_PROCS {
        if let Some(pcb) = table.get(pid) {
            kernel_log_line!(
                "{:>4} {:?} {:<20} prio={} cpu={}",
                pcb.pid,
                pcb.state,
                pcb.name,
                pcb.priority,
                pcb.cpu_time
            );
        }
    }
    0
}

/// Flat switch over the syscall number, per §4.7. `SYS_EXEC` never reaches
/// here — `trap_handler` special-cases it into `exec_rewrite` before
/// calling `dispatch` at all, since it needs to rewrite the trap frame
/// rather than just return a value in `a0`.
pub fn dispatch(num: u64, args: [u64; 6], _pc: u64) -> i64 {
    match num {
        SYS_EXIT => scheduler::proc_exit(args[0] as i64),
        SYS_GETPID => current_pid().map(|p| p as i64).unwrap_or(-1),
        SYS_FORK => match scheduler::proc_fork() {
            Ok(pid) => pid as i64,
            Err(_) => -1,
        },
        SYS_WAIT => current_pid()
            .map(scheduler::proc_wait)
            .unwrap_or(-1),
        SYS_SBRK => sys_sbrk(args[0] as i64),
        SYS_SLEEP => {
            scheduler::sys_sleep(args[0]);
            0
        }
        SYS_KILL => scheduler::sys_kill(args[0] as ProcId),
        SYS_UPTIME => clint::now() as i64,
        SYS_WRITE => sys_write(args[0], args[1], args[2]),
        SYS_OPEN => sys_open(args[0], args[1]),
        SYS_READ => sys_read(args[0], args[1], args[2]),
        SYS_CLOSE => match fs::fs_close(args[0] as usize) {
            Ok(()) => 0,
            Err(_) => -1,
        },
        SYS_LS => sys_ls(args[0], args[1]),
        SYS_GETC => uart::SERIAL.lock().getc() as i64,
        SYS_UNLINK => {
            let Ok(name) = read_cstr(args[0]) else { return -1 };
            match fs::fs_unlink(&name) {
                Ok(()) => 0,
                Err(_) => -1,
            }
        }
        SYS_TRUNC => {
            let Ok(name) = read_cstr(args[0]) else { return -1 };
            match fs::fs_trunc(&name) {
                Ok(()) => 0,
                Err(_) => -1,
            }
        }
        SYS_PS => sys_ps(),
        _ => -1,
    }
}

/// `SYS_EXEC`'s handler: looks the program up by name in the static
/// link-time table and, on success, rewrites the caller's trap frame to
/// resume at the new program's entry on a fresh stack (§4.3 step 3). On
/// failure the trap frame is left alone except for `a0 = -1`, so the
/// `ecall` just returns normally.
///
/// `exec` replaces the calling process's image in place, so the stack frame
/// it is replacing — the old `ustack_base` — is freed here rather than left
/// for `zombies_free`, which never sees this PCB again under its old stack.
pub fn exec_rewrite(frame: &mut TrapFrame, name_ptr: usize) {
    let fail = |frame: &mut TrapFrame| frame.a0 = (-1i64) as u64;

    let Ok(name) = read_cstr(name_ptr as u64) else {
        fail(frame);
        return;
    };
    let Some(entry) = user::lookup(&name) else {
        fail(frame);
        return;
    };
    let Ok(stack_frame) = pmm::alloc() else {
        fail(frame);
        return;
    };

    if let Some(pid) = current_pid() {
        let mut table = PROC_TABLE.lock();
        if let Some(pcb) = table.get_mut(pid) {
            let old_ustack = pcb.ustack_base;
            pcb.ustack_base = stack_frame;
            drop(table);
            if old_ustack != 0 {
                pmm::free(old_ustack);
            }
        }
    }

    frame.sepc = entry as u64;
    frame.sp = (stack_frame + PAGE_SIZE) as u64;
    frame.sstatus = (1 << 5) | (1 << 8); // SPIE set, SPP=1 (stay in S-mode)
}
