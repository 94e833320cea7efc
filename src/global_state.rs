//! The one handle the caller owns and passes into every entry point
//! (`spec.md` §5, `original_source`'s `struct global_state`).

use crate::breakpoints::{HardwareBreakpointTable, SoftwareBreakpointTable};
use crate::thread_table::ThreadTable;

/// Owns every piece of mutable state the core tracks for one tracee:
/// the thread table and the two breakpoint tables. There is exactly one of
/// these per traced process; the core has no other shared mutable state
/// (`spec.md` §5).
#[derive(Default)]
pub struct GlobalState {
    pub threads: ThreadTable,
    pub software_breakpoints: SoftwareBreakpointTable,
    pub hardware_breakpoints: HardwareBreakpointTable,
    /// When set, resumes use `PTRACE_SYSCALL` instead of `PTRACE_CONT`, so
    /// syscall-entry/exit stops are reported too (`spec.md` §6).
    pub handle_syscall_enabled: bool,
}

impl GlobalState {
    pub fn new() -> Self {
        GlobalState {
            threads: ThreadTable::new(),
            software_breakpoints: SoftwareBreakpointTable::new(),
            hardware_breakpoints: HardwareBreakpointTable::new(),
            handle_syscall_enabled: false,
        }
    }

    pub fn set_handle_syscall(&mut self, enabled: bool) {
        self.handle_syscall_enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_empty() {
        let state = GlobalState::new();
        assert!(state.threads.is_empty());
        assert!(state.software_breakpoints.is_empty());
        assert!(state.hardware_breakpoints.is_empty());
        assert!(!state.handle_syscall_enabled);
    }
}
