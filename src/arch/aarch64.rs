//! AArch64 `ArchOps` implementation (`spec.md` §4.1).
//!
//! This architecture has no `PTRACE_GETREGS`/`SETREGS` and no per-register
//! `PTRACE_PEEKUSER`; every register bank travels through
//! `PTRACE_GETREGSET`/`SETREGSET` addressed by an ELF core-note type
//! (`NT_PRSTATUS`, `NT_ARM_SYSTEM_CALL`, `NT_ARM_HW_BREAK`,
//! `NT_ARM_HW_WATCH`, `NT_FPREGSET`). None of these have safe wrappers in
//! `nix` 0.17, so every request here goes through raw `libc::ptrace` with an
//! `iovec`, the same fallback the x86_64 adapter uses for `PTRACE_POKEUSER`.

use std::io;

use libc::{c_void, pid_t};

use super::{ArchOps, BreakpointKind, HwBreakpointSpec};
use crate::error::{Result, Tid, TracerError};
use crate::registers::{FpRegsBlock, FpRegsKind, GprBlock};
use crate::thread_table::ThreadEntry;

const NT_PRSTATUS: u64 = 1;
const NT_FPREGSET: u64 = 2;
const NT_ARM_HW_BREAK: u64 = 0x402;
const NT_ARM_HW_WATCH: u64 = 0x403;
const NT_ARM_SYSTEM_CALL: u64 = 0x404;

const HW_SLOT_COUNT: usize = 16;

/// Mirrors the kernel's `struct user_hwdebug_state` (`sys/ptrace.h` on
/// aarch64): a capability word followed by 16 `(addr, ctrl)` slots.
#[repr(C)]
#[derive(Copy, Clone)]
struct UserHwdebugState {
    dbg_info: u32,
    pad: u32,
    dbg_regs: [HwdebugSlot; HW_SLOT_COUNT],
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct HwdebugSlot {
    addr: u64,
    ctrl: u32,
    pad: u32,
}

impl Default for UserHwdebugState {
    fn default() -> Self {
        UserHwdebugState {
            dbg_info: 0,
            pad: 0,
            dbg_regs: [HwdebugSlot::default(); HW_SLOT_COUNT],
        }
    }
}

fn getregset<T>(tid: Tid, command: u64, value: &mut T) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: value as *mut T as *mut c_void,
        iov_len: std::mem::size_of::<T>(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid as pid_t,
            command as *mut c_void,
            &mut iov as *mut _ as *mut c_void,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setregset<T>(tid: Tid, command: u64, value: &mut T) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: value as *mut T as *mut c_void,
        iov_len: std::mem::size_of::<T>(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            tid as pid_t,
            command as *mut c_void,
            &mut iov as *mut _ as *mut c_void,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn hw_command(kind: BreakpointKind) -> u64 {
    match kind {
        BreakpointKind::Execute => NT_ARM_HW_BREAK,
        BreakpointKind::Write | BreakpointKind::ReadWrite | BreakpointKind::Read => NT_ARM_HW_WATCH,
    }
}

fn hw_condition(kind: BreakpointKind) -> u32 {
    match kind {
        BreakpointKind::Execute => 0,
        BreakpointKind::Write => 2,
        BreakpointKind::ReadWrite => 3,
        BreakpointKind::Read => 1,
    }
}

pub struct AArch64;

impl ArchOps for AArch64 {
    fn get_gpr(tid: Tid, out: &mut GprBlock) -> Result<()> {
        out.override_syscall_number = false;
        let mut raw = RawGpr::from(*out);
        getregset(tid, NT_PRSTATUS, &mut raw).map_err(TracerError::Kernel)?;
        *out = raw.into_gpr(out.override_syscall_number);
        Ok(())
    }

    fn set_gpr(tid: Tid, input: &mut GprBlock) -> Result<()> {
        if input.override_syscall_number {
            let mut x8 = input.x8();
            setregset(tid, NT_ARM_SYSTEM_CALL, &mut x8).map_err(TracerError::Kernel)?;
            input.override_syscall_number = false;
        }
        let mut raw = RawGpr::from(*input);
        setregset(tid, NT_PRSTATUS, &mut raw).map_err(TracerError::Kernel)?;
        Ok(())
    }

    fn get_fpr(tid: Tid, thread: &mut ThreadEntry) -> Result<()> {
        getregset(tid, NT_FPREGSET, &mut thread.fpregs).map_err(TracerError::Kernel)
    }

    fn set_fpr(tid: Tid, thread: &mut ThreadEntry) -> Result<()> {
        setregset(tid, NT_FPREGSET, &mut thread.fpregs).map_err(TracerError::Kernel)
    }

    /// Meaningless on AArch64: there's a single fixed FP/vector layout.
    fn default_fpregs_kind() -> FpRegsKind {
        FpRegsKind::default()
    }

    fn install_hw_bp(bp: &HwBreakpointSpec) -> Result<()> {
        let command = hw_command(bp.kind);
        let mut state = UserHwdebugState::default();
        getregset(bp.tid, command, &mut state).map_err(TracerError::Kernel)?;

        let slot = state
            .dbg_regs
            .iter()
            .position(|s| s.addr == 0)
            .ok_or(TracerError::NoFreeDebugRegisterSlot { tid: bp.tid })?;

        let length = if bp.kind == BreakpointKind::Execute {
            4
        } else {
            bp.length
        };
        let length_mask: u32 = (1u32 << length) - 1;
        let condition = hw_condition(bp.kind);
        let ctrl = (length_mask << 5) | (condition << 3) | (2 << 1) | 1;

        state.dbg_regs[slot].addr = bp.addr;
        state.dbg_regs[slot].ctrl = ctrl;

        setregset(bp.tid, command, &mut state).map_err(TracerError::Kernel)
    }

    fn remove_hw_bp(bp: &HwBreakpointSpec) -> Result<()> {
        let command = hw_command(bp.kind);
        let mut state = UserHwdebugState::default();
        getregset(bp.tid, command, &mut state).map_err(TracerError::Kernel)?;

        let slot = state
            .dbg_regs
            .iter()
            .position(|s| s.addr == bp.addr)
            .ok_or(TracerError::HardwareBreakpointNotFound {
                tid: bp.tid,
                addr: bp.addr,
            })?;

        state.dbg_regs[slot].addr = 0;
        state.dbg_regs[slot].ctrl = 0;

        setregset(bp.tid, command, &mut state).map_err(TracerError::Kernel)
    }

    /// A trap with trace-hw-breakpoint `si_code` (`TRAP_HWBKPT` = 4) and a
    /// matching `si_addr` is a hit (`spec.md` §4.1).
    fn is_hw_bp_hit(bp: &HwBreakpointSpec) -> bool {
        let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETSIGINFO,
                bp.tid as pid_t,
                std::ptr::null_mut::<c_void>(),
                &mut siginfo as *mut _ as *mut c_void,
            )
        };
        if ret == -1 {
            return false;
        }
        if siginfo.si_signo != libc::SIGTRAP || siginfo.si_code != 0x4 {
            return false;
        }
        let addr = unsafe { siginfo.si_addr() as u64 };
        addr == bp.addr
    }

    fn remaining_hw_bp(tid: Tid) -> Result<u32> {
        let mut state = UserHwdebugState::default();
        getregset(tid, NT_ARM_HW_BREAK, &mut state).map_err(TracerError::Kernel)?;
        Ok(state.dbg_info & 0xff)
    }

    fn remaining_hw_wp(tid: Tid) -> Result<u32> {
        let mut state = UserHwdebugState::default();
        getregset(tid, NT_ARM_HW_WATCH, &mut state).map_err(TracerError::Kernel)?;
        Ok(state.dbg_info & 0xff)
    }

    /// Low byte of `brk #0` (`0xd4200000`, little-endian: `00 00 20 d4`).
    fn is_sw_breakpoint_opcode(byte: u8) -> bool {
        byte == 0x00
    }

    fn is_call_insn(word: u64) -> bool {
        let instr = word as u32;
        instr & 0xFC00_0000 == 0x9400_0000
    }

    fn is_ret_insn(byte: u8) -> bool {
        byte == 0xC0
    }

    fn install_breakpoint(word: u64) -> u64 {
        (word & !0xFFFF_FFFF) | 0xD420_0000
    }

    fn instruction_pointer(regs: &GprBlock) -> u64 {
        regs.pc
    }

    fn set_instruction_pointer(regs: &mut GprBlock, addr: u64) {
        regs.pc = addr;
    }

    fn execute_breakpoint_length() -> u8 {
        4
    }
}

/// `NT_PRSTATUS`-sized payload, i.e. `GprBlock` minus the trailing
/// `override_syscall_number` scratch flag that never goes to the kernel.
#[repr(C)]
#[derive(Copy, Clone)]
struct RawGpr {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

impl From<GprBlock> for RawGpr {
    fn from(gpr: GprBlock) -> Self {
        RawGpr {
            regs: gpr.regs,
            sp: gpr.sp,
            pc: gpr.pc,
            pstate: gpr.pstate,
        }
    }
}

impl RawGpr {
    fn into_gpr(self, override_syscall_number: bool) -> GprBlock {
        GprBlock {
            regs: self.regs,
            sp: self.sp,
            pc: self.pc,
            pstate: self.pstate,
            override_syscall_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_breakpoint_overlays_brk_opcode() {
        let original = 0x1122_3344_d65f_03c0u64;
        let patched = AArch64::install_breakpoint(original);
        assert_eq!(patched & 0xFFFF_FFFF, 0xD420_0000);
        assert_eq!(patched & !0xFFFF_FFFF, original & !0xFFFF_FFFF);
        assert_eq!(AArch64::install_breakpoint(patched), patched);
    }

    #[test]
    fn recognizes_bl_and_ret() {
        // bl #0x1000 -> opcode bits 100101xx at the top byte.
        assert!(AArch64::is_call_insn(0x9400_0400));
        assert!(!AArch64::is_call_insn(0xD503_201F)); // nop
        assert!(AArch64::is_ret_insn(0xC0));
    }

    #[test]
    fn raw_gpr_round_trips_through_gpr_block() {
        let mut gpr = GprBlock::default();
        gpr.regs[8] = 42;
        gpr.pc = 0x4000;
        gpr.override_syscall_number = true;

        let raw = RawGpr::from(gpr);
        let restored = raw.into_gpr(false);

        assert_eq!(restored.regs[8], 42);
        assert_eq!(restored.pc, 0x4000);
        assert!(!restored.override_syscall_number);
    }
}
