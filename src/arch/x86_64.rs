//! x86_64 `ArchOps` implementation (`spec.md` §4.1).
//!
//! General registers go through `nix::sys::ptrace::getregs`/`setregs`
//! (`PTRACE_GETREGS`/`SETREGS`), same as
//! `examples/other_examples/...headcrab.../linux.rs`. Debug registers and
//! extended FP state have no safe `nix` 0.17 wrapper, so those call sites
//! fall back to the raw `libc::ptrace` the headcrab adapter uses for
//! `PTRACE_POKEUSER`, clearing `errno` first exactly as that file's
//! `ptrace_peekuser` does.

use std::io;

use libc::{c_void, pid_t};
use nix::sys::ptrace;
use nix::unistd::Pid;

use super::{ArchOps, BreakpointKind, HwBreakpointSpec};
use crate::error::{Result, Tid, TracerError};
use crate::registers::{FpRegsBlock, FpRegsKind, GprBlock};
use crate::thread_table::ThreadEntry;

const DR_BASE: u64 = 0x350;
const DR_SIZE: u64 = 8;
const DR_COUNT: u64 = 4;

const NT_X86_XSTATE: u64 = 0x202;

fn ctrl_local(slot: u64) -> u64 {
    1 << (2 * slot)
}

fn ctrl_cond_shift(slot: u64) -> u64 {
    16 + 4 * slot
}

fn ctrl_len_shift(slot: u64) -> u64 {
    18 + 4 * slot
}

fn ctrl_cond_val(kind: BreakpointKind) -> u64 {
    match kind {
        BreakpointKind::Execute => 0,
        BreakpointKind::Write => 1,
        BreakpointKind::ReadWrite => 3,
        BreakpointKind::Read => 3,
    }
}

fn ctrl_len_val(length: u8) -> u64 {
    match length {
        1 => 0,
        2 => 1,
        8 => 2,
        _ => 3,
    }
}

/// Raw `PTRACE_PEEKUSER`. `nix` 0.17 has no safe wrapper for this request,
/// and the value returned by a successful peek may legitimately be `-1`, so
/// `errno` is cleared first (`spec.md` §6).
fn peekuser(tid: Tid, addr: u64) -> io::Result<u64> {
    nix::errno::Errno::clear();
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            tid as pid_t,
            addr as *mut c_void,
            std::ptr::null_mut::<c_void>(),
        )
    };
    if ret == -1 && nix::errno::errno() != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u64)
}

fn pokeuser(tid: Tid, addr: u64, data: u64) -> io::Result<()> {
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            tid as pid_t,
            addr as *mut c_void,
            data as *mut c_void,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn getregset_xstate(tid: Tid, buf: &mut [u8]) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid as pid_t,
            NT_X86_XSTATE as *mut c_void,
            &mut iov as *mut _ as *mut c_void,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setregset_xstate(tid: Tid, buf: &mut [u8]) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            tid as pid_t,
            NT_X86_XSTATE as *mut c_void,
            &mut iov as *mut _ as *mut c_void,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub struct X86_64;

impl ArchOps for X86_64 {
    fn get_gpr(tid: Tid, out: &mut GprBlock) -> Result<()> {
        *out = ptrace::getregs(Pid::from_raw(tid)).map_err(io_err)?;
        Ok(())
    }

    fn set_gpr(tid: Tid, input: &mut GprBlock) -> Result<()> {
        ptrace::setregs(Pid::from_raw(tid), *input).map_err(io_err)?;
        Ok(())
    }

    /// A no-op for legacy FXSAVE threads, per `spec.md` §4.1.
    fn get_fpr(tid: Tid, thread: &mut ThreadEntry) -> Result<()> {
        if thread.fpregs.kind() == FpRegsKind::Fxsave {
            return Ok(());
        }
        getregset_xstate(tid, thread.fpregs.payload_mut())?;
        Ok(())
    }

    fn set_fpr(tid: Tid, thread: &mut ThreadEntry) -> Result<()> {
        if thread.fpregs.kind() == FpRegsKind::Fxsave {
            return Ok(());
        }
        setregset_xstate(tid, thread.fpregs.payload_mut())?;
        Ok(())
    }

    fn default_fpregs_kind() -> FpRegsKind {
        FpRegsKind::XsaveAvx512
    }

    fn install_hw_bp(bp: &HwBreakpointSpec) -> Result<()> {
        let mut slot = DR_COUNT;
        for i in 0..DR_COUNT {
            if peekuser(bp.tid, DR_BASE + i * DR_SIZE).map_err(TracerError::Kernel)? == 0 {
                slot = i;
                break;
            }
        }
        if slot == DR_COUNT {
            return Err(TracerError::NoFreeDebugRegisterSlot { tid: bp.tid });
        }

        let ctrl = ctrl_local(slot)
            | (ctrl_cond_val(bp.kind) << ctrl_cond_shift(slot))
            | (ctrl_len_val(bp.length) << ctrl_len_shift(slot));

        let mut state =
            peekuser(bp.tid, DR_BASE + 7 * DR_SIZE).map_err(TracerError::Kernel)?;
        state &= !(3 << ctrl_cond_shift(slot));
        state &= !(3 << ctrl_len_shift(slot));
        state |= ctrl;

        pokeuser(bp.tid, DR_BASE + slot * DR_SIZE, bp.addr).map_err(TracerError::Kernel)?;
        pokeuser(bp.tid, DR_BASE + 7 * DR_SIZE, state).map_err(TracerError::Kernel)?;
        Ok(())
    }

    fn remove_hw_bp(bp: &HwBreakpointSpec) -> Result<()> {
        let mut slot = DR_COUNT;
        for i in 0..DR_COUNT {
            if peekuser(bp.tid, DR_BASE + i * DR_SIZE).map_err(TracerError::Kernel)? == bp.addr {
                slot = i;
                break;
            }
        }
        if slot == DR_COUNT {
            return Err(TracerError::HardwareBreakpointNotFound {
                tid: bp.tid,
                addr: bp.addr,
            });
        }

        let mut state =
            peekuser(bp.tid, DR_BASE + 7 * DR_SIZE).map_err(TracerError::Kernel)?;
        state &= !(3 << ctrl_cond_shift(slot));
        state &= !(3 << ctrl_len_shift(slot));
        pokeuser(bp.tid, DR_BASE + 7 * DR_SIZE, state).map_err(TracerError::Kernel)?;
        pokeuser(bp.tid, DR_BASE + slot * DR_SIZE, 0).map_err(TracerError::Kernel)?;
        Ok(())
    }

    fn is_hw_bp_hit(bp: &HwBreakpointSpec) -> bool {
        let status = match peekuser(bp.tid, DR_BASE + 6 * DR_SIZE) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let index = if status & 0x1 != 0 {
            0
        } else if status & 0x2 != 0 {
            1
        } else if status & 0x4 != 0 {
            2
        } else if status & 0x8 != 0 {
            3
        } else {
            return false;
        };

        match peekuser(bp.tid, DR_BASE + index * DR_SIZE) {
            Ok(addr) => addr == bp.addr,
            Err(_) => false,
        }
    }

    fn remaining_hw_bp(tid: Tid) -> Result<u32> {
        let mut used = 0;
        for i in 0..DR_COUNT {
            if peekuser(tid, DR_BASE + i * DR_SIZE).map_err(TracerError::Kernel)? == 0 {
                break;
            }
            used += 1;
        }
        Ok((DR_COUNT - used) as u32)
    }

    /// Shares the same four debug registers as breakpoints (`spec.md` §9,
    /// Open Question: "x86_64 presents one shared pool").
    fn remaining_hw_wp(tid: Tid) -> Result<u32> {
        Self::remaining_hw_bp(tid)
    }

    fn is_sw_breakpoint_opcode(byte: u8) -> bool {
        byte == 0xCC
    }

    fn is_call_insn(word: u64) -> bool {
        let bytes = word.to_le_bytes();
        // near relative call (E8) and near indirect call via ModRM /2 (FF /2).
        bytes[0] == 0xE8 || (bytes[0] == 0xFF && (bytes[1] >> 3) & 0b111 == 2)
    }

    fn is_ret_insn(byte: u8) -> bool {
        byte == 0xC3 || byte == 0xC2
    }

    fn install_breakpoint(word: u64) -> u64 {
        (word & !0xFF) | 0xCC
    }

    fn instruction_pointer(regs: &GprBlock) -> u64 {
        regs.rip
    }

    fn set_instruction_pointer(regs: &mut GprBlock, addr: u64) {
        regs.rip = addr;
    }

    fn execute_breakpoint_length() -> u8 {
        1
    }
}

fn io_err(err: nix::Error) -> TracerError {
    TracerError::Kernel(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_breakpoint_preserves_high_bytes_and_is_idempotent() {
        let original = 0x1122_3344_5566_7788u64;
        let patched = X86_64::install_breakpoint(original);
        assert_eq!(patched & !0xFF, original & !0xFF);
        assert_eq!(patched & 0xFF, 0xCC);
        assert_eq!(X86_64::install_breakpoint(patched), patched);
    }

    #[test]
    fn recognizes_ret_and_sw_breakpoint_opcode() {
        assert!(X86_64::is_sw_breakpoint_opcode(0xCC));
        assert!(!X86_64::is_sw_breakpoint_opcode(0x90));
        assert!(X86_64::is_ret_insn(0xC3));
        assert!(!X86_64::is_ret_insn(0x90));
    }

    #[test]
    fn recognizes_near_relative_call() {
        let word = 0x0000_0000_1234_56E8u64;
        assert!(X86_64::is_call_insn(word));
        assert!(!X86_64::is_call_insn(0x90));
    }
}
