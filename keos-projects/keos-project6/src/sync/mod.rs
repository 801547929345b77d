//! Blocking synchronization primitives for user-process state.
//!
//! These primitives extend the bare [`keos::sync::SpinLock`] the core kernel
//! ships with towards the primitives a process subsystem needs: a mutex that
//! donates priority to whoever blocks it, a counting semaphore, a
//! writer-preferring reader/writer lock, and a Mesa-style condition variable.
//! All four share the same shape: a [`keos::sync::SpinLock`]-protected state
//! machine plus a deque of [`keos::thread::ParkHandle`] for whoever is
//! sleeping on the primitive, the same idiom `keos-project4`'s `Mutex`
//! skeleton uses.

pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod scheduler;
pub mod semaphore;

pub use condvar::CondVar;
pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use scheduler::PriorityScheduler;
pub use semaphore::Semaphore;

/// Priority of a thread, higher value preempts lower.
pub type Priority = u8;

/// Default priority assigned to a thread that never called
/// [`PriorityTable::set_priority`].
pub const DEFAULT_PRIORITY: Priority = 31;

/// Maximum chain length a single donation will walk before giving up.
///
/// Donation chains form when thread A waits on a lock held by B, who waits on
/// a lock held by C, and so on. Capping the walk bounds the work a single
/// `lock()` call can do under pathological nesting.
pub const MAX_DONATION_DEPTH: usize = 8;

/// Picks the index of the waiter with the greatest effective priority in
/// `queue`, ties broken in favor of the earliest (FIFO) entry. Shared by
/// [`semaphore::Semaphore::up`], [`mutex::MutexGuard::unlock`], and
/// [`condvar::CondVar::signal`] so the three primitives agree on what
/// "highest-priority waiter" means, per `spec.md` §4.A.
pub(crate) fn pick_highest_priority<T>(
    queue: &alloc::collections::VecDeque<T>,
    tid_of: impl Fn(&T) -> u64,
) -> Option<usize> {
    let mut best: Option<(usize, Priority)> = None;
    for (i, w) in queue.iter().enumerate() {
        let p = priority_table::effective(tid_of(w));
        if best.is_none_or(|(_, bp)| p > bp) {
            best = Some((i, p));
        }
    }
    best.map(|(i, _)| i)
}

pub(crate) mod priority_table {
    //! tid-keyed base/effective priority arena.
    //!
    //! [`keos::thread::Thread`] carries no priority field (see
    //! `keos::thread::Thread`), so priority and donation state are tracked
    //! out-of-line, keyed by `tid`, exactly the arena-by-id rewrite
    //! `spec.md`'s own Design Note 9 prescribes for cyclic owner/waiter
    //! graphs: a donor's `tid` is looked up again on every walk instead of
    //! holding a pointer to the donor thread.
    use super::{DEFAULT_PRIORITY, Priority};
    use alloc::collections::BTreeMap;
    use keos::sync::SpinLock;

    struct Entry {
        base: Priority,
        /// Stack of priorities donated to this thread, most recent last.
        /// The effective priority is `max(base, donations.last())`.
        donations: alloc::vec::Vec<Priority>,
    }

    static TABLE: SpinLock<BTreeMap<u64, Entry>> = SpinLock::new(BTreeMap::new());

    fn with_entry<R>(tid: u64, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut guard = TABLE.lock();
        let entry = guard.entry(tid).or_insert_with(|| Entry {
            base: DEFAULT_PRIORITY,
            donations: alloc::vec::Vec::new(),
        });
        let r = f(entry);
        guard.unlock();
        r
    }

    /// Effective priority of `tid`: the highest of its base priority and any
    /// priority donated to it.
    pub fn effective(tid: u64) -> Priority {
        with_entry(tid, |e| {
            e.base.max(e.donations.last().copied().unwrap_or(0))
        })
    }

    /// Sets the base priority of `tid`, returning its old effective priority.
    pub fn set_base(tid: u64, base: Priority) -> Priority {
        with_entry(tid, |e| {
            let old = e.base.max(e.donations.last().copied().unwrap_or(0));
            e.base = base;
            old
        })
    }

    /// Donates `priority` to `tid` if it is higher than what it currently has.
    pub fn donate(tid: u64, priority: Priority) {
        with_entry(tid, |e| {
            e.donations.push(priority);
            e.donations.sort_unstable();
        })
    }

    /// Withdraws a single donation of `priority` previously given to `tid`.
    pub fn withdraw(tid: u64, priority: Priority) {
        with_entry(tid, |e| {
            if let Some(pos) = e.donations.iter().rposition(|&p| p == priority) {
                e.donations.remove(pos);
            }
        })
    }

    /// Drops every donation once a lock holder releases everything it held,
    /// restoring its own base priority.
    pub fn clear_donations(tid: u64) {
        with_entry(tid, |e| e.donations.clear())
    }

    /// Removes bookkeeping for a thread that has exited.
    pub fn forget(tid: u64) {
        let mut guard = TABLE.lock();
        guard.remove(&tid);
        guard.unlock();
    }
}
