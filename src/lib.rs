//! Ptrace-driven register, breakpoint, and run/stop core for a userspace
//! process debugger (`spec.md` §1).
//!
//! This crate is the ptrace(2)-facing half of a debugger: register access,
//! software/hardware breakpoint bookkeeping, and the run/stop protocol
//! that keeps every thread of a traced process in a known state between
//! resumes. Symbol resolution, disassembly, scripting front-ends, process
//! launch, and wire serialization are the caller's job; this crate only
//! ever sees thread ids, addresses, and raw register buffers.
//!
//! Everything here is reached through one [`GlobalState`] handle per
//! tracee, passed explicitly into each entry point — there is no internal
//! task scheduler and no hidden global state (`spec.md` §5).

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("tracer_core supports only x86_64 and aarch64 targets");

pub mod arch;
pub mod breakpoints;
pub mod coordinator;
pub mod error;
pub mod global_state;
pub mod ptrace_sys;
pub mod registers;
pub mod thread_table;
pub mod wait_status;

pub use arch::{ArchOps, BreakpointKind, HwBreakpointSpec, NativeArch};
pub use breakpoints::{HardwareBreakpoint, HardwareBreakpointTable, SoftwareBreakpoint, SoftwareBreakpointTable};
pub use error::{Pid, Result, Tid, TracerError};
pub use global_state::GlobalState;
pub use registers::{FpRegsBlock, FpRegsKind, GprBlock};
pub use thread_table::{ThreadEntry, ThreadTable};
pub use wait_status::{ThreadStatus, WaitStatus};
