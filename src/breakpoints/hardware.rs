//! Hardware breakpoint/watchpoint table (`spec.md` §4.3).
//!
//! `original_source`'s `hw_b_HEAD` is small (bounded by the number of debug
//! register slots per thread — 4 on x86_64, 16 on AArch64), so a linear-scan
//! `Vec` mirrors it directly rather than introducing a map, per the Design
//! Note in `spec.md` §9.

use crate::arch::{ArchOps, BreakpointKind, HwBreakpointSpec, NativeArch};
use crate::error::{Result, Tid, TracerError};

#[derive(Copy, Clone, Debug)]
pub struct HardwareBreakpoint {
    pub addr: u64,
    pub tid: Tid,
    pub enabled: bool,
    pub kind: BreakpointKind,
    pub length: u8,
}

impl HardwareBreakpoint {
    pub(crate) fn spec(&self) -> HwBreakpointSpec {
        HwBreakpointSpec {
            tid: self.tid,
            addr: self.addr,
            kind: self.kind,
            length: self.length,
        }
    }
}

#[derive(Default)]
pub struct HardwareBreakpointTable {
    entries: Vec<HardwareBreakpoint>,
}

impl HardwareBreakpointTable {
    pub fn new() -> Self {
        HardwareBreakpointTable {
            entries: Vec::new(),
        }
    }

    /// Rejects a duplicate `(addr, tid)` pair rather than silently
    /// re-enabling it, matching the source's `perror("Breakpoint already
    /// registered")` early return.
    pub fn register_hw_breakpoint(
        &mut self,
        tid: Tid,
        addr: u64,
        kind: BreakpointKind,
        length: u8,
    ) -> Result<()> {
        if self.entries.iter().any(|b| b.addr == addr && b.tid == tid) {
            return Err(TracerError::HardwareBreakpointAlreadyRegistered { tid, addr });
        }

        let bp = HardwareBreakpoint {
            addr,
            tid,
            enabled: true,
            kind,
            length,
        };
        NativeArch::install_hw_bp(&bp.spec())?;
        self.entries.push(bp);
        Ok(())
    }

    pub fn unregister_hw_breakpoint(&mut self, tid: Tid, addr: u64) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|b| b.addr == addr && b.tid == tid)
            .ok_or(TracerError::HardwareBreakpointNotFound { tid, addr })?;

        let bp = self.entries.remove(idx);
        if bp.enabled {
            NativeArch::remove_hw_bp(&bp.spec())?;
        }
        Ok(())
    }

    pub fn enable_hw_breakpoint(&mut self, tid: Tid, addr: u64) -> Result<()> {
        if let Some(bp) = self
            .entries
            .iter_mut()
            .find(|b| b.addr == addr && b.tid == tid)
        {
            if !bp.enabled {
                NativeArch::install_hw_bp(&bp.spec())?;
            }
            bp.enabled = true;
        }
        Ok(())
    }

    pub fn disable_hw_breakpoint(&mut self, tid: Tid, addr: u64) -> Result<()> {
        if let Some(bp) = self
            .entries
            .iter_mut()
            .find(|b| b.addr == addr && b.tid == tid)
        {
            if bp.enabled {
                NativeArch::remove_hw_bp(&bp.spec())?;
            }
            bp.enabled = false;
        }
        Ok(())
    }

    /// Returns the address of the first entry for `tid` that's currently
    /// hit, or `None` if none is (`spec.md` §4.3 returns zero; the core's
    /// Rust surface uses `Option` instead of overloading `0` as "no hit").
    pub fn get_hit_hw_breakpoint(&self, tid: Tid) -> Option<u64> {
        self.entries
            .iter()
            .find(|b| b.tid == tid && NativeArch::is_hw_bp_hit(&b.spec()))
            .map(|b| b.addr)
    }

    pub fn iter_for_thread(&self, tid: Tid) -> impl Iterator<Item = &HardwareBreakpoint> {
        self.entries.iter().filter(move |b| b.tid == tid)
    }

    pub fn free_breakpoints(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_hit_hw_breakpoint_returns_none_for_unknown_thread() {
        let table = HardwareBreakpointTable::new();
        assert_eq!(table.get_hit_hw_breakpoint(123), None);
    }

    #[test]
    fn iter_for_thread_filters_by_tid() {
        let mut table = HardwareBreakpointTable::new();
        table.entries.push(HardwareBreakpoint {
            addr: 0x1000,
            tid: 1,
            enabled: true,
            kind: BreakpointKind::Execute,
            length: 4,
        });
        table.entries.push(HardwareBreakpoint {
            addr: 0x2000,
            tid: 2,
            enabled: true,
            kind: BreakpointKind::Write,
            length: 4,
        });

        let addrs: Vec<u64> = table.iter_for_thread(1).map(|b| b.addr).collect();
        assert_eq!(addrs, vec![0x1000]);
    }
}
