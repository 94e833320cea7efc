//! Architecture adapter (`spec.md` §4.1).
//!
//! The x86_64 and AArch64 backends never coexist in one build, so per the
//! Design Note in `spec.md` §9 this crate resolves the choice at compile
//! time (`#[cfg(target_arch = ...)]`) rather than with a runtime `dyn`
//! dispatch: `NativeArch` names whichever implementation the current build
//! target selects, and everything above this module (thread table,
//! breakpoint tables, coordinator) is written against the `ArchOps` trait
//! so that logic is never duplicated per architecture.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::X86_64 as NativeArch;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::AArch64 as NativeArch;

use crate::error::{Result, Tid};
use crate::registers::{FpRegsBlock, FpRegsKind, GprBlock};
use crate::thread_table::ThreadEntry;

/// What kind of access a hardware breakpoint traps on.
///
/// `Execute` is length-fixed by the architecture (1 byte on x86_64, 4 bytes
/// on AArch64); the others accept `1`, `2`, `4`, or `8` bytes (`spec.md`
/// §3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    Execute,
    Write,
    ReadWrite,
    Read,
}

/// A hardware breakpoint/watchpoint request, independent of which
/// architecture's debug registers end up programmed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HwBreakpointSpec {
    pub tid: Tid,
    pub addr: u64,
    pub kind: BreakpointKind,
    pub length: u8,
}

/// The per-architecture operations named in `spec.md` §4.1.
///
/// Implementations are zero-sized types; all state lives in the caller's
/// `GlobalState`/`ThreadTable`/breakpoint tables, never in the `ArchOps`
/// impl itself, since the whole core is single-threaded and stateless with
/// respect to which architecture it's built for.
pub trait ArchOps {
    /// Copy the general register block from the kernel into `out`.
    fn get_gpr(tid: Tid, out: &mut GprBlock) -> Result<()>;
    /// Copy the general register block from `input` to the kernel.
    fn set_gpr(tid: Tid, input: &mut GprBlock) -> Result<()>;

    /// Copy extended FP/vector state from the kernel into `thread`'s cache.
    /// A no-op on x86_64 when the thread is configured for legacy FXSAVE
    /// state (`spec.md` §4.1).
    fn get_fpr(tid: Tid, thread: &mut ThreadEntry) -> Result<()>;
    fn set_fpr(tid: Tid, thread: &mut ThreadEntry) -> Result<()>;

    /// The extended-state kind newly registered threads are tagged with.
    /// Meaningless on AArch64, which has one fixed FP layout.
    fn default_fpregs_kind() -> FpRegsKind;

    fn install_hw_bp(bp: &HwBreakpointSpec) -> Result<()>;
    fn remove_hw_bp(bp: &HwBreakpointSpec) -> Result<()>;
    fn is_hw_bp_hit(bp: &HwBreakpointSpec) -> bool;
    fn remaining_hw_bp(tid: Tid) -> Result<u32>;
    fn remaining_hw_wp(tid: Tid) -> Result<u32>;

    /// True when `byte` is the low byte of this architecture's software
    /// breakpoint trap opcode (`int3` on x86_64, the low byte of `brk #0`
    /// on AArch64).
    fn is_sw_breakpoint_opcode(byte: u8) -> bool;
    /// True when the machine word at an instruction boundary decodes as a
    /// call instruction (used by `stepping_finish`'s nested-call counter).
    fn is_call_insn(word: u64) -> bool;
    /// True when `byte` (the low byte of the word at the instruction
    /// boundary) decodes as a return instruction.
    fn is_ret_insn(byte: u8) -> bool;

    /// Overlay this architecture's trap encoding onto the low byte(s) of a
    /// machine word, preserving the remaining bytes.
    fn install_breakpoint(word: u64) -> u64;

    /// The instruction pointer recorded in `regs`.
    fn instruction_pointer(regs: &GprBlock) -> u64;
    fn set_instruction_pointer(regs: &mut GprBlock, addr: u64);

    /// Fixed length of an execute-kind hardware breakpoint for this
    /// architecture (1 on x86_64, 4 on AArch64).
    fn execute_breakpoint_length() -> u8;
}
