//! Per-architecture register blocks.
//!
//! `spec.md` §3 requires a cached general-register block and a cached
//! floating-point/vector block per thread, with the floating-point block
//! additionally tagged with its extended-state size on x86_64. This mirrors
//! `examples/isgasho-rd/src/registers.rs`'s arch-tagged register wrapper,
//! but tags the two architectures this spec actually supports (x86_64,
//! AArch64) instead of rd's x86-vs-x64 32/64-bit split.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{gpr_block_default, FpRegsBlock, FpRegsKind, GprBlock};
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{gpr_block_default, FpRegsBlock, GprBlock};

/// On AArch64 there's only one FP/vector layout, so there's nothing to tag.
#[cfg(target_arch = "aarch64")]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FpRegsKind;

#[cfg(target_arch = "aarch64")]
impl Default for FpRegsKind {
    fn default() -> Self {
        FpRegsKind
    }
}
