//! A counting semaphore with priority-ordered wakeup.
//!
//! Built the same way [`super::mutex::Mutex`] is: a [`keos::sync::SpinLock`]
//! around a plain counter, plus a deque of parked waiters. Unlike the mutex,
//! a semaphore wakeup does not imply a handoff of ownership, so there is
//! nothing to donate to — but when multiple threads are waiting, the highest
//! *effective* priority waiter (consulting the same table
//! [`super::mutex::Mutex`] writes into) is the one woken first, so a
//! donation a waiter received elsewhere is still honored here.

use alloc::collections::VecDeque;
use keos::thread::{Current, ParkHandle};

struct Waiter {
    tid: u64,
    park: ParkHandle,
}

/// A counting semaphore.
pub struct Semaphore {
    state: keos::sync::SpinLock<(usize, VecDeque<Waiter>)>,
}

impl Semaphore {
    /// Creates a semaphore with `value` initial permits.
    pub const fn new(value: usize) -> Self {
        Self {
            state: keos::sync::SpinLock::new((value, VecDeque::new())),
        }
    }

    /// Acquires one permit, blocking until one is available.
    ///
    /// The check above is only a fast path; the authoritative check is the
    /// one inside the `park_with` closure, under the same lock `up` takes to
    /// hand a permit off, so a permit freed between the two is never missed
    /// (`spec.md` §4.A: list and counter updates are atomic with the block).
    pub fn down(&self) {
        let mut guard = self.state.lock();
        if guard.0 > 0 {
            guard.0 -= 1;
            guard.unlock();
            return;
        }
        guard.unlock();

        let tid = Current::get_tid();
        Current::park_with(|park| {
            let mut guard = self.state.lock();
            if guard.0 > 0 {
                // A permit was freed in the gap above; claim it ourselves
                // and cancel the park instead of sleeping past an `up` that
                // already happened.
                guard.0 -= 1;
                guard.unlock();
                park.unpark();
            } else {
                guard.1.push_back(Waiter { tid, park });
                guard.unlock();
            }
        });
    }

    /// Releases one permit, waking the highest-effective-priority waiter.
    pub fn up(&self) {
        let mut guard = self.state.lock();
        if guard.1.is_empty() {
            guard.0 += 1;
            guard.unlock();
            return;
        }
        let idx = super::pick_highest_priority(&guard.1, |w| w.tid).unwrap();
        let waiter = guard.1.remove(idx).unwrap();
        guard.unlock();
        waiter.park.unpark();
    }

    /// Attempts to acquire a permit without blocking.
    pub fn try_down(&self) -> bool {
        let mut guard = self.state.lock();
        let ok = guard.0 > 0;
        if ok {
            guard.0 -= 1;
        }
        guard.unlock();
        ok
    }

    /// Current number of available permits. Racy by nature; useful only for
    /// diagnostics and tests.
    pub fn value(&self) -> usize {
        let guard = self.state.lock();
        let v = guard.0;
        guard.unlock();
        v
    }
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}
