//! A Mesa-semantics condition variable.
//!
//! Layered on top of [`super::mutex::Mutex`] the same way the original
//! Pintos-lineage design builds a condition variable out of a private
//! semaphore per waiter: `wait` atomically releases the caller's mutex,
//! blocks on a fresh single-permit semaphore pushed onto this condvar's
//! waiter deque, and reacquires the mutex once woken. `signal` pops the
//! waiter with the greatest effective priority (not strict FIFO), matching
//! `spec.md`'s `4.A` description and the tie-break the donating mutex already
//! uses in [`super::semaphore::Semaphore::up`].

use super::{mutex::Mutex, semaphore::Semaphore};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use keos::thread::Current;

struct Waiter {
    tid: u64,
    sema: Arc<Semaphore>,
}

/// A Mesa-semantics condition variable, always used together with a
/// [`Mutex`] guarding the condition it waits on.
pub struct CondVar {
    waiters: keos::sync::SpinLock<VecDeque<Waiter>>,
}

unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    /// Creates a new, empty condition variable.
    pub const fn new() -> Self {
        Self {
            waiters: keos::sync::SpinLock::new(VecDeque::new()),
        }
    }

    /// Atomically releases `mutex`, blocks until signaled, then reacquires
    /// `mutex` before returning.
    pub fn wait<'a, T>(&self, guard: super::mutex::MutexGuard<'a, T>, mutex: &'a Mutex<T>) -> super::mutex::MutexGuard<'a, T> {
        let sema = Arc::new(Semaphore::new(0));
        let tid = Current::get_tid();
        let mut waiters = self.waiters.lock();
        waiters.push_back(Waiter {
            tid,
            sema: sema.clone(),
        });
        waiters.unlock();

        guard.unlock();
        sema.down();
        mutex.lock()
    }

    /// Wakes the waiter with the greatest effective priority, if any.
    pub fn signal(&self) {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            waiters.unlock();
            return;
        }
        let idx = super::pick_highest_priority(&waiters, |w| w.tid).unwrap();
        let w = waiters.remove(idx).unwrap();
        waiters.unlock();
        w.sema.up();
    }

    /// Wakes every waiter currently queued.
    pub fn broadcast(&self) {
        loop {
            let mut waiters = self.waiters.lock();
            let w = waiters.pop_front();
            waiters.unlock();
            match w {
                Some(w) => w.sema.up(),
                None => break,
            }
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
