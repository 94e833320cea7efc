//! Software breakpoint table (`spec.md` §4.3).
//!
//! `original_source`'s `sw_b_HEAD` is a singly linked list kept sorted by
//! ascending address "because we don't want a breakpoint patching another".
//! A `BTreeMap<u64, SoftwareBreakpoint>` gives the same ordering for free
//! and turns the insert/lookup loops into map operations, per the Design
//! Note in `spec.md` §9.

use std::collections::BTreeMap;

use crate::arch::{ArchOps, NativeArch};
use crate::error::{Pid, Result};
use crate::ptrace_sys;

/// One patched address. `instruction` is the original word; `patched_instruction`
/// is `instruction` with the trap opcode overlaid (`spec.md` §4.3).
#[derive(Copy, Clone, Debug)]
pub struct SoftwareBreakpoint {
    pub addr: u64,
    pub instruction: u64,
    pub patched_instruction: u64,
    pub enabled: bool,
}

#[derive(Default)]
pub struct SoftwareBreakpointTable {
    entries: BTreeMap<u64, SoftwareBreakpoint>,
}

impl SoftwareBreakpointTable {
    pub fn new() -> Self {
        SoftwareBreakpointTable {
            entries: BTreeMap::new(),
        }
    }

    /// Read the original word at `addr`, overlay the trap opcode, write the
    /// patched word back, and record the breakpoint. Re-registering an
    /// already-known address just re-enables it without touching memory
    /// again (`spec.md` §4.3 step 4).
    pub fn register_breakpoint(&mut self, pid: Pid, addr: u64) -> Result<()> {
        if let Some(existing) = self.entries.get_mut(&addr) {
            existing.enabled = true;
            return Ok(());
        }

        let instruction = ptrace_sys::peekdata(pid, addr)?;
        let patched_instruction = NativeArch::install_breakpoint(instruction);
        ptrace_sys::pokedata(pid, addr, patched_instruction)?;

        self.entries.insert(
            addr,
            SoftwareBreakpoint {
                addr,
                instruction,
                patched_instruction,
                enabled: true,
            },
        );
        Ok(())
    }

    /// Drops the table entry. Deliberately does **not** restore the
    /// original word in memory — see the Open Question decision in
    /// `DESIGN.md`. If the patch is still live in the tracee, it's the
    /// caller's responsibility to `disable_breakpoint` first.
    pub fn unregister_breakpoint(&mut self, addr: u64) {
        self.entries.remove(&addr);
    }

    pub fn enable_breakpoint(&mut self, addr: u64) {
        if let Some(bp) = self.entries.get_mut(&addr) {
            bp.enabled = true;
        }
    }

    pub fn disable_breakpoint(&mut self, addr: u64) {
        if let Some(bp) = self.entries.get_mut(&addr) {
            bp.enabled = false;
        }
    }

    pub fn free_breakpoints(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, addr: u64) -> Option<&SoftwareBreakpoint> {
        self.entries.get(&addr)
    }

    /// Ascending-by-address iteration, matching the sorted-insert invariant
    /// the source's linked list maintained by hand.
    pub fn iter_enabled(&self) -> impl Iterator<Item = &SoftwareBreakpoint> {
        self.entries.values().filter(|bp| bp.enabled)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SoftwareBreakpoint> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bp(addr: u64) -> SoftwareBreakpoint {
        SoftwareBreakpoint {
            addr,
            instruction: 0x1122_3344_5566_7788,
            patched_instruction: NativeArch::install_breakpoint(0x1122_3344_5566_7788),
            enabled: true,
        }
    }

    #[test]
    fn iter_enabled_skips_disabled_and_stays_address_ordered() {
        let mut table = SoftwareBreakpointTable::new();
        table.entries.insert(0x2000, bp(0x2000));
        table.entries.insert(0x1000, bp(0x1000));
        table.entries.insert(0x3000, SoftwareBreakpoint {
            enabled: false,
            ..bp(0x3000)
        });

        let addrs: Vec<u64> = table.iter_enabled().map(|bp| bp.addr).collect();
        assert_eq!(addrs, vec![0x1000, 0x2000]);
    }

    #[test]
    fn unregister_does_not_touch_instruction_fields_it_removes() {
        let mut table = SoftwareBreakpointTable::new();
        table.entries.insert(0x1000, bp(0x1000));

        table.unregister_breakpoint(0x1000);

        assert!(table.get(0x1000).is_none());
    }

    #[test]
    fn disable_then_enable_round_trips_flag() {
        let mut table = SoftwareBreakpointTable::new();
        table.entries.insert(0x1000, bp(0x1000));

        table.disable_breakpoint(0x1000);
        assert!(!table.get(0x1000).unwrap().enabled);

        table.enable_breakpoint(0x1000);
        assert!(table.get(0x1000).unwrap().enabled);
    }
}
