use libc::pid_t;
use thiserror::Error;

/// Tid is always the kernel task id (equal to the pid for a thread group
/// leader). We reuse `pid_t` rather than inventing a newtype so call sites
/// can pass raw values straight out of `libc`/`nix`.
pub type Tid = pid_t;
pub type Pid = pid_t;

/// Errors surfaced at the core's entry points.
///
/// Per `spec.md` §7, not every kernel-call failure is reported through
/// this enum: `prepare_for_run`, `wait_all_and_update_regs` and the detach
/// family log degraded-but-not-fatal failures (via the `log` crate) and
/// keep going, matching the source's `perror`/`fprintf(stderr, ...)` call
/// sites that never early-return. This type exists for the failures that
/// *do* abort the operation in the source (returning `-1` or skipping the
/// rest of the work).
#[derive(Debug, Error)]
pub enum TracerError {
    #[error("ptrace/wait/kill syscall failed: {0}")]
    Kernel(#[from] std::io::Error),

    #[error("thread {0} is not registered")]
    ThreadNotFound(Tid),

    #[error("no free debug register slot on thread {tid}")]
    NoFreeDebugRegisterSlot { tid: Tid },

    #[error("hardware breakpoint already registered for thread {tid} at {addr:#x}")]
    HardwareBreakpointAlreadyRegistered { tid: Tid, addr: u64 },

    #[error("no hardware breakpoint registered for thread {tid} at {addr:#x}")]
    HardwareBreakpointNotFound { tid: Tid, addr: u64 },
}

pub type Result<T> = std::result::Result<T, TracerError>;
