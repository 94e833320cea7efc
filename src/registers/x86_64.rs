//! x86_64 register block layout.
//!
//! `GprBlock` is the kernel's `struct user_regs_struct` verbatim (matches
//! `libc::user_regs_struct`) so `PTRACE_GETREGS`/`PTRACE_SETREGS` can copy
//! straight into/out of it (`spec.md` §4.1: "a single direct operation").
//!
//! `FpRegsBlock` generalizes `original_source`'s `struct fp_regs_struct`:
//! the source picks exactly one of three compile-time sizes (520/904/2704
//! bytes, each an 8-byte type-tag header plus the kernel's FXSAVE/XSAVE
//! payload). Here the block always reserves the largest (AVX-512) payload
//! and `kind` says how many leading bytes of it the kernel will actually
//! read/write for a given thread, selected once at `register_thread` time
//! from the configured `FpRegsKind` (`spec.md` §4.2).

use static_assertions::const_assert_eq;

pub type GprBlock = libc::user_regs_struct;

/// `libc::user_regs_struct` has no `Default` impl, so a fresh cache entry
/// is zero-initialized directly, the same way `original_source` allocates
/// a `struct thread` with `malloc` and fills it from the first `getregs`.
pub fn gpr_block_default() -> GprBlock {
    unsafe { std::mem::zeroed() }
}

/// Byte length of the kernel's legacy FXSAVE area (no AVX state).
pub const FXSAVE_SIZE: usize = 512;
/// Byte length of the kernel's XSAVE area with AVX state.
pub const XSAVE_AVX_SIZE: usize = 896;
/// Byte length of the kernel's XSAVE area with AVX-512 state.
pub const XSAVE_AVX512_SIZE: usize = 2696;

const TAG_HEADER_SIZE: usize = 8;

/// Which of the three supported extended-state sizes a thread's
/// `FpRegsBlock` was configured for.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FpRegsKind {
    /// Legacy 512-byte FXSAVE state. `get_fpr`/`set_fpr` are no-ops for this
    /// kind by design (`spec.md` §4.1) — callers read/write the block
    /// directly via `PTRACE_GETFPREGS`/`PTRACE_SETFPREGS` semantics instead.
    Fxsave = 0,
    /// 896-byte AVX XSAVE state.
    XsaveAvx = 1,
    /// 2696-byte AVX-512 XSAVE state.
    XsaveAvx512 = 2,
}

impl FpRegsKind {
    pub fn payload_len(self) -> usize {
        match self {
            FpRegsKind::Fxsave => FXSAVE_SIZE,
            FpRegsKind::XsaveAvx => XSAVE_AVX_SIZE,
            FpRegsKind::XsaveAvx512 => XSAVE_AVX512_SIZE,
        }
    }
}

/// Extended FP/vector register state, tagged with which of the three
/// layouts is actually in use for this thread.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct FpRegsBlock {
    kind: FpRegsKind,
    _pad: [u8; TAG_HEADER_SIZE - 1],
    payload: [u8; XSAVE_AVX512_SIZE],
}

const_assert_eq!(FXSAVE_SIZE, 512);
const_assert_eq!(XSAVE_AVX_SIZE, 896);
const_assert_eq!(XSAVE_AVX512_SIZE, 2696);
const_assert_eq!(
    std::mem::size_of::<FpRegsBlock>(),
    TAG_HEADER_SIZE + XSAVE_AVX512_SIZE
);

impl FpRegsBlock {
    pub fn new(kind: FpRegsKind) -> Self {
        FpRegsBlock {
            kind,
            _pad: [0; TAG_HEADER_SIZE - 1],
            payload: [0; XSAVE_AVX512_SIZE],
        }
    }

    pub fn kind(&self) -> FpRegsKind {
        self.kind
    }

    /// The kernel-visible payload: the leading bytes of the reserved buffer
    /// that actually belong to `kind`'s layout.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.kind.payload_len()]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.kind.payload_len();
        &mut self.payload[..len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_len_matches_kind() {
        assert_eq!(FpRegsBlock::new(FpRegsKind::Fxsave).payload().len(), 512);
        assert_eq!(FpRegsBlock::new(FpRegsKind::XsaveAvx).payload().len(), 896);
        assert_eq!(
            FpRegsBlock::new(FpRegsKind::XsaveAvx512).payload().len(),
            2696
        );
    }
}
