//! Thread table (`spec.md` §4.2).
//!
//! `original_source`'s `register_thread`/`unregister_thread`/
//! `free_thread_list` keep two singly linked lists (`t_HEAD`, `dead_t_HEAD`)
//! and move a node from the live list to the dead list on unregister rather
//! than freeing it, so a thread's last known registers stay readable after
//! it exits. `ThreadTable` keeps that two-list shape with `Vec`s instead of
//! hand-rolled linked lists, matching how `examples/isgasho-rd` favors
//! standard collections over manual list management.

use log::warn;

use crate::arch::{ArchOps, NativeArch};
use crate::error::{Result, Tid, TracerError};
use crate::registers::{gpr_block_default, FpRegsBlock, FpRegsKind, GprBlock};

/// A traced thread's cached kernel state.
///
/// `signal_to_forward` mirrors `original_source`'s `thread::signal_to_forward`:
/// a non-fatal signal intercepted on this thread's last stop, to be
/// redelivered the next time it's resumed.
#[derive(Clone)]
pub struct ThreadEntry {
    pub tid: Tid,
    pub regs: GprBlock,
    pub fpregs: FpRegsBlock,
    pub signal_to_forward: i32,
}

#[cfg(target_arch = "x86_64")]
impl ThreadEntry {
    fn new(tid: Tid, fpregs_kind: FpRegsKind) -> Self {
        ThreadEntry {
            tid,
            regs: gpr_block_default(),
            fpregs: FpRegsBlock::new(fpregs_kind),
            signal_to_forward: 0,
        }
    }
}

#[cfg(target_arch = "aarch64")]
impl ThreadEntry {
    fn new_aarch64(tid: Tid) -> Self {
        ThreadEntry {
            tid,
            regs: gpr_block_default(),
            fpregs: FpRegsBlock::default(),
            signal_to_forward: 0,
        }
    }
}

/// The live/dead thread lists described in `spec.md` §4.2.
#[derive(Default)]
pub struct ThreadTable {
    live: Vec<ThreadEntry>,
    dead: Vec<ThreadEntry>,
}

impl ThreadTable {
    pub fn new() -> Self {
        ThreadTable {
            live: Vec::new(),
            dead: Vec::new(),
        }
    }

    /// Register `tid`, populating its register cache with a fresh
    /// `PTRACE_GETREGS`/`GETREGSET` read. Idempotent: registering an
    /// already-live thread just returns it, exactly like the source's
    /// early-return when it finds `tid` already on `t_HEAD`.
    pub fn register_thread(&mut self, tid: Tid) -> Result<&mut ThreadEntry> {
        if let Some(idx) = self.live.iter().position(|t| t.tid == tid) {
            return Ok(&mut self.live[idx]);
        }

        #[cfg(target_arch = "x86_64")]
        let mut entry = ThreadEntry::new(tid, NativeArch::default_fpregs_kind());
        #[cfg(target_arch = "aarch64")]
        let mut entry = ThreadEntry::new_aarch64(tid);

        NativeArch::get_gpr(tid, &mut entry.regs)?;

        self.live.push(entry);
        Ok(self.live.last_mut().expect("just pushed"))
    }

    /// Move `tid` from the live list to the dead list, preserving its last
    /// known registers. A no-op if `tid` isn't currently live, matching the
    /// source's silent fall-through when the loop runs off the end of the
    /// list without finding it.
    pub fn unregister_thread(&mut self, tid: Tid) {
        if let Some(idx) = self.live.iter().position(|t| t.tid == tid) {
            let entry = self.live.remove(idx);
            self.dead.push(entry);
        }
    }

    pub fn get_thread(&self, tid: Tid) -> Option<&ThreadEntry> {
        self.live.iter().find(|t| t.tid == tid)
    }

    pub fn get_thread_mut(&mut self, tid: Tid) -> Option<&mut ThreadEntry> {
        self.live.iter_mut().find(|t| t.tid == tid)
    }

    pub fn get_thread_checked(&self, tid: Tid) -> Result<&ThreadEntry> {
        self.get_thread(tid).ok_or(TracerError::ThreadNotFound(tid))
    }

    pub fn get_thread_mut_checked(&mut self, tid: Tid) -> Result<&mut ThreadEntry> {
        self.get_thread_mut(tid)
            .ok_or(TracerError::ThreadNotFound(tid))
    }

    pub fn get_thread_fpregs(&self, tid: Tid) -> Option<&FpRegsBlock> {
        self.get_thread(tid).map(|t| &t.fpregs)
    }

    pub fn iter_live(&self) -> impl Iterator<Item = &ThreadEntry> {
        self.live.iter()
    }

    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut ThreadEntry> {
        self.live.iter_mut()
    }

    pub fn live_tids(&self) -> Vec<Tid> {
        self.live.iter().map(|t| t.tid).collect()
    }

    /// Live tids in the order `detach_for_kill`/`detach_for_migration` must
    /// process them: thread-group leader last. `register_thread` appends to
    /// `live`, so the leader (registered first, in practice) sits at index
    /// 0; the detach order is the reverse of registration order, matching
    /// `original_source`'s head-prepended list traversal.
    pub fn live_tids_detach_order(&self) -> Vec<Tid> {
        self.live.iter().rev().map(|t| t.tid).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Drop every entry from both lists. `original_source`'s
    /// `free_thread_list` just frees each node; there's nothing to flush
    /// back to the kernel first.
    pub fn free_thread_list(&mut self) {
        if !self.live.is_empty() {
            warn!(
                "clearing thread table with {} thread(s) still live",
                self.live.len()
            );
        }
        self.live.clear();
        self.dead.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tid: Tid) -> ThreadEntry {
        #[cfg(target_arch = "x86_64")]
        return ThreadEntry::new(tid, FpRegsKind::Fxsave);
        #[cfg(target_arch = "aarch64")]
        return ThreadEntry::new_aarch64(tid);
    }

    #[test]
    fn unregister_moves_to_dead_list_not_deleted() {
        let mut table = ThreadTable::new();
        table.live.push(entry(100));
        table.live.push(entry(101));

        table.unregister_thread(100);

        assert!(table.get_thread(100).is_none());
        assert_eq!(table.dead.len(), 1);
        assert_eq!(table.dead[0].tid, 100);
        assert_eq!(table.live_tids(), vec![101]);
    }

    #[test]
    fn unregister_unknown_tid_is_a_no_op() {
        let mut table = ThreadTable::new();
        table.live.push(entry(5));

        table.unregister_thread(999);

        assert_eq!(table.live.len(), 1);
        assert!(table.dead.is_empty());
    }

    #[test]
    fn free_thread_list_clears_both_lists() {
        let mut table = ThreadTable::new();
        table.live.push(entry(1));
        table.dead.push(entry(2));

        table.free_thread_list();

        assert!(table.live.is_empty());
        assert!(table.dead.is_empty());
    }

    #[test]
    fn get_thread_checked_reports_missing_tid() {
        let table = ThreadTable::new();
        match table.get_thread_checked(42) {
            Err(TracerError::ThreadNotFound(tid)) => assert_eq!(tid, 42),
            other => panic!("expected ThreadNotFound, got {:?}", other.err()),
        }
    }
}
