//! The parent/child exit-data arena.
//!
//! Grounded on `spec.md` §4.I: "model exit data as an arena owned by a
//! process-table map keyed by tid, with non-owning handles into it" (the
//! REDESIGN FLAGS section's answer to the source's cyclic
//! thread/exit-data/child pointer graph). One [`ExitRecord`] is allocated by
//! [`ExitTable::spawn_child`] at `exec` time and removed either by the
//! child's own [`ExitTable::wait`] or by the parent's
//! [`ExitTable::reap_children_of`] on the parent's own exit — whichever
//! happens first, per the resolved Open Question on termination order
//! (`spec.md` §9 / REDESIGN FLAGS: a parent's exit silently orphans its
//! still-running children, discarding their exit records; the child keeps
//! running but nothing will ever observe its exit status).

use crate::sync::semaphore::Semaphore;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use keos::KernelError;
use keos::sync::SpinLock;
use keos::sync::atomic::AtomicBool;

/// One child's exit bookkeeping, alive from `exec` until reaped or waited.
struct ExitRecord {
    parent_tid: u64,
    code: SpinLock<Option<i32>>,
    waited: AtomicBool,
    death: Semaphore,
}

/// The kernel-wide map from child tid to its exit record.
pub struct ExitTable {
    records: SpinLock<BTreeMap<u64, Arc<ExitRecord>>>,
}

impl Default for ExitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitTable {
    pub fn new() -> Self {
        Self {
            records: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Allocates a fresh exit record for `child_tid`, owned by `parent_tid`.
    /// Called once, by the parent, at the moment it spawns the child.
    pub fn spawn_child(&self, parent_tid: u64, child_tid: u64) {
        let record = Arc::new(ExitRecord {
            parent_tid,
            code: SpinLock::new(None),
            waited: AtomicBool::new(false),
            death: Semaphore::new(0),
        });
        let mut records = self.records.lock();
        records.insert(child_tid, record);
        records.unlock();
    }

    /// Posts `code` to `tid`'s own exit record (if it still has one — a
    /// parent that already exited will have reaped it away) and wakes
    /// anyone blocked in [`Self::wait`] on it. Step 3 of `process_exit`.
    pub fn post_exit(&self, tid: u64, code: i32) {
        let records = self.records.lock();
        let record = records.get(&tid).cloned();
        records.unlock();
        if let Some(record) = record {
            let mut guard = record.code.lock();
            *guard = Some(code);
            guard.unlock();
            record.death.up();
        }
    }

    /// Blocks on `child_tid`'s death semaphore and returns its exit code.
    /// Fails if `child_tid` has no live record owned by `parent_tid`, or if
    /// it has already been waited on — both map to the syscall's `-1`
    /// return, per `spec.md` §4.I.
    pub fn wait(&self, parent_tid: u64, child_tid: u64) -> Result<i32, KernelError> {
        let record = {
            let records = self.records.lock();
            let record = records.get(&child_tid).cloned();
            records.unlock();
            record
        };
        let record = record.ok_or(KernelError::NoSuchEntry)?;
        if record.parent_tid != parent_tid {
            return Err(KernelError::NoSuchEntry);
        }
        if record.waited.load() {
            return Err(KernelError::NoSuchEntry);
        }
        record.waited.store(true);

        record.death.down();

        let mut records = self.records.lock();
        records.remove(&child_tid);
        records.unlock();

        let guard = record.code.lock();
        let code = guard.expect("death semaphore up implies code is posted");
        guard.unlock();
        Ok(code)
    }

    /// Discards every exit record whose parent is `parent_tid` — called as
    /// step 4 of `process_exit`. A still-running child is left running;
    /// its next `post_exit`/death has nothing left to post to.
    pub fn reap_children_of(&self, parent_tid: u64) {
        let mut records = self.records.lock();
        records.retain(|_, record| record.parent_tid != parent_tid);
        records.unlock();
    }
}
