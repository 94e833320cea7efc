//! Low-level ptrace/wait/signal wrappers (`spec.md` §6).
//!
//! Most of these map directly onto a `nix::sys::ptrace` function, the same
//! way `examples/other_examples/...headcrab.../linux.rs` calls
//! `ptrace::getregs`/`setregs`/`step`/`cont`/`setoptions`. The two
//! generic `peekuser`/`pokeuser` entry points have no `nix` wrapper on
//! either architecture (x86_64's is simply unimplemented upstream; AArch64
//! has no such kernel request at all) and are grounded directly on
//! `ptrace_cffi_source.c`'s two `#ifdef`-guarded implementations.

use std::io;

use libc::{c_void, pid_t};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid as NixPid;

use crate::arch::{ArchOps, NativeArch};
use crate::error::{Pid, Result, Tid, TracerError};
use crate::thread_table::ThreadTable;

fn to_nix(pid: Tid) -> NixPid {
    NixPid::from_raw(pid)
}

fn kernel<T>(r: std::result::Result<T, nix::Error>) -> Result<T> {
    r.map_err(|e| TracerError::Kernel(io::Error::new(io::ErrorKind::Other, e.to_string())))
}

pub fn trace_me() -> Result<()> {
    kernel(ptrace::traceme())
}

pub fn attach(pid: Pid) -> Result<()> {
    kernel(ptrace::attach(to_nix(pid)))
}

/// `PTRACE_SETOPTIONS` with fork/vfork/clone/exec/exit tracing and
/// syscall-stop marking, matching `ptrace_set_options`'s fixed option mask.
pub fn set_options(pid: Pid) -> Result<()> {
    let options = ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEEXEC
        | ptrace::Options::PTRACE_O_TRACEEXIT;
    kernel(ptrace::setoptions(to_nix(pid), options))
}

/// One machine-word memory read. Clears `errno` first so a legitimate `-1`
/// word can be told apart from a failed peek (`spec.md` §6).
pub fn peekdata(pid: Pid, addr: u64) -> Result<u64> {
    nix::errno::Errno::clear();
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKDATA,
            pid as pid_t,
            addr as *mut c_void,
            std::ptr::null_mut::<c_void>(),
        )
    };
    if ret == -1 && nix::errno::errno() != 0 {
        return Err(TracerError::Kernel(io::Error::last_os_error()));
    }
    Ok(ret as u64)
}

pub fn pokedata(pid: Pid, addr: u64, data: u64) -> Result<()> {
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEDATA,
            pid as pid_t,
            addr as *mut c_void,
            data as *mut c_void,
        )
    };
    if ret == -1 {
        return Err(TracerError::Kernel(io::Error::last_os_error()));
    }
    Ok(())
}

pub fn geteventmsg(pid: Pid) -> Result<u64> {
    kernel(ptrace::getevent(to_nix(pid))).map(|v| v as u64)
}

#[cfg(target_arch = "x86_64")]
mod user_area {
    use super::*;

    /// Direct `PTRACE_PEEKUSER`/`POKEUSER` on the `struct user` offset
    /// `addr`, exactly as `ptrace_cffi_source.c`'s AMD64 `ptrace_peekuser`.
    pub fn peekuser(pid: Pid, addr: u64) -> Result<u64> {
        nix::errno::Errno::clear();
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                pid as pid_t,
                addr as *mut c_void,
                std::ptr::null_mut::<c_void>(),
            )
        };
        if ret == -1 && nix::errno::errno() != 0 {
            return Err(TracerError::Kernel(io::Error::last_os_error()));
        }
        Ok(ret as u64)
    }

    pub fn pokeuser(pid: Pid, addr: u64, data: u64) -> Result<()> {
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                pid as pid_t,
                addr as *mut c_void,
                data as *mut c_void,
            )
        };
        if ret == -1 {
            return Err(TracerError::Kernel(io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(target_arch = "aarch64")]
mod user_area {
    use super::*;

    const NT_ARM_HW_BREAK: u64 = 0x402;
    const NT_ARM_HW_WATCH: u64 = 0x403;
    /// `sizeof(struct user_hwdebug_state)`: an 8-byte header plus 16 slots
    /// of 16 bytes each.
    const HWDEBUG_STATE_SIZE: usize = 8 + 16 * 16;

    /// There is no per-register `PTRACE_PEEKUSER` on AArch64.
    /// `ptrace_cffi_source.c` emulates one by reading the whole
    /// hw-breakpoint-or-watchpoint regset into a scratch buffer and
    /// indexing into it at a byte offset. Bit `0x1000` of `addr` selects
    /// which regset (watch vs. break); the remaining bits are the byte
    /// offset. This addressing scheme is this crate's own internal
    /// convention, not a kernel ABI (`DESIGN.md` Open Question #3).
    pub fn peekuser(pid: Pid, addr: u64) -> Result<u64> {
        let command = if addr & 0x1000 != 0 {
            NT_ARM_HW_WATCH
        } else {
            NT_ARM_HW_BREAK
        };
        let offset = (addr & !0x1000) as usize;

        let mut buf = [0u8; HWDEBUG_STATE_SIZE];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                pid as pid_t,
                command as *mut c_void,
                &mut iov as *mut _ as *mut c_void,
            )
        };
        if ret == -1 {
            return Err(TracerError::Kernel(io::Error::last_os_error()));
        }

        let bytes: [u8; 8] = buf[offset..offset + 8].try_into().expect("8-byte slice");
        Ok(u64::from_ne_bytes(bytes))
    }

    pub fn pokeuser(pid: Pid, addr: u64, data: u64) -> Result<()> {
        let command = if addr & 0x1000 != 0 {
            NT_ARM_HW_WATCH
        } else {
            NT_ARM_HW_BREAK
        };
        let offset = (addr & !0x1000) as usize;

        let mut buf = [0u8; HWDEBUG_STATE_SIZE];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                pid as pid_t,
                command as *mut c_void,
                &mut iov as *mut _ as *mut c_void,
            )
        };
        if ret == -1 {
            return Err(TracerError::Kernel(io::Error::last_os_error()));
        }

        buf[offset..offset + 8].copy_from_slice(&data.to_ne_bytes());

        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                pid as pid_t,
                command as *mut c_void,
                &mut iov as *mut _ as *mut c_void,
            )
        };
        if ret == -1 {
            return Err(TracerError::Kernel(io::Error::last_os_error()));
        }
        Ok(())
    }
}

pub use user_area::{peekuser, pokeuser};

/// `tgkill(2)` has no `nix` wrapper; `original_source` relies on it rather
/// than `kill(2)` because `kill` can't target a single non-leader thread.
fn tgkill(pid: Pid, tid: Tid, signal: Signal) -> Result<()> {
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signal as libc::c_int) };
    if ret == -1 {
        return Err(TracerError::Kernel(io::Error::last_os_error()));
    }
    Ok(())
}

/// Detach every registered thread, killing each as it goes. Callers must
/// pass `threads` ordered with the thread-group leader last, matching
/// `original_source`'s comment "the main thread must be detached last"
/// (see `ThreadTable::live_tids_detach_order`). Best-effort throughout:
/// failures are logged, not propagated, matching the source's
/// `fprintf(stderr, ...)` sites that never abort the loop
/// (`ptrace_detach_for_kill`).
pub fn detach_for_kill(pid: Pid, threads: &mut ThreadTable) {
    for tid in threads.live_tids_detach_order() {
        let entry = match threads.get_thread_mut(tid) {
            Some(e) => e,
            None => continue,
        };
        if NativeArch::get_gpr(tid, &mut entry.regs).is_err() {
            let _ = tgkill(pid, tid, Signal::SIGSTOP);
            let _ = nix::sys::wait::waitpid(to_nix(tid), None);
        }
        if let Err(err) = ptrace::detach(to_nix(tid), None) {
            log::warn!("ptrace_detach failed for thread {}: {}", tid, err);
        }
        let _ = tgkill(pid, tid, Signal::SIGKILL);
    }
    let _ = nix::sys::wait::waitpid(to_nix(pid), None);
}

/// Detach every registered thread in preparation for another tracer (e.g.
/// a debugger UI) taking over. Flushes each thread's cached registers
/// first (the caller may have modified them); if the flush fails the
/// thread is presumed still running, so it's stopped and the flush
/// retried. Each thread is then stopped once more so it can't run free
/// before the external tracer attaches, matching
/// `ptrace_detach_for_migration`.
pub fn detach_for_migration(pid: Pid, threads: &mut ThreadTable) {
    for tid in threads.live_tids_detach_order() {
        let entry = match threads.get_thread_mut(tid) {
            Some(e) => e,
            None => continue,
        };
        if NativeArch::set_gpr(tid, &mut entry.regs).is_err() {
            let _ = tgkill(pid, tid, Signal::SIGSTOP);
            let _ = nix::sys::wait::waitpid(to_nix(tid), None);
            let _ = NativeArch::set_gpr(tid, &mut entry.regs);
        }

        let _ = tgkill(pid, tid, Signal::SIGSTOP);

        if let Err(err) = ptrace::detach(to_nix(tid), None) {
            log::warn!("ptrace_detach failed for thread {}: {}", tid, err);
        }
    }
}

/// Re-attach to every thread after an external tracer (e.g. gdb) releases
/// it, refreshing cached registers as each reattaches
/// (`ptrace_reattach_from_gdb`).
pub fn reattach_from_gdb(threads: &mut ThreadTable) {
    for tid in threads.live_tids_detach_order() {
        if let Err(err) = ptrace::attach(to_nix(tid)) {
            log::warn!("ptrace_attach failed for thread {}: {}", tid, err);
        }
        if let Some(entry) = threads.get_thread_mut(tid) {
            if let Err(err) = NativeArch::get_gpr(tid, &mut entry.regs) {
                log::warn!("ptrace_getregs failed for thread {}: {}", tid, err);
            }
        }
    }
}

/// `detach_for_migration` followed by `SIGCONT` on the tracee, letting it
/// run free (`ptrace_detach_and_cont`).
pub fn detach_and_cont(pid: Pid, threads: &mut ThreadTable) {
    detach_for_migration(pid, threads);
    let _ = nix::sys::signal::kill(to_nix(pid), Signal::SIGCONT);
}
