//! A writer-preferring, FIFO-fair reader/writer lock.
//!
//! [`keos::sync::RwLock`] is a spin-based lock: it never parks a blocked
//! thread and makes no fairness guarantee between readers and writers. That
//! is fine for the short critical sections the core kernel protects with it,
//! but the per-inode lock this crate needs can be held across a cache I/O, so
//! blocking on it must actually park the caller, and a writer that has been
//! waiting must not be starved by a stream of new readers. This module is a
//! fresh implementation, shaped like [`super::mutex::Mutex`]: a
//! [`keos::sync::SpinLock`]-protected state machine plus a deque of parked
//! waiters, generalized to two waiter classes instead of one.

use alloc::collections::VecDeque;
use core::ops::{Deref, DerefMut};
use core::cell::UnsafeCell;
use keos::thread::{Current, ParkHandle};

enum Kind {
    Reader,
    Writer,
}

struct Waiter {
    kind: Kind,
    park: ParkHandle,
}

struct State {
    active_readers: usize,
    active_writers: usize,
    queue: VecDeque<Waiter>,
}

/// A reader/writer lock protecting `T`.
///
/// Writer-preferring: a reader only jumps the queue when the queue is empty
/// and no writer is active, so a writer already waiting is never passed over
/// by a newly arriving reader.
pub struct RwLock<T> {
    state: keos::sync::SpinLock<State>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new reader/writer lock in an unlocked state.
    pub const fn new(t: T) -> Self {
        Self {
            state: keos::sync::SpinLock::new(State {
                active_readers: 0,
                active_writers: 0,
                queue: VecDeque::new(),
            }),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires the lock for reading, blocking until available.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let mut guard = self.state.lock();
            if guard.queue.is_empty() && guard.active_writers == 0 {
                guard.active_readers += 1;
                guard.unlock();
                return RwLockReadGuard { lock: self };
            }
            guard.unlock();
            Current::park_with(|park| {
                let mut guard = self.state.lock();
                // Re-check under the same lock `unlock_read`/`unlock_write`
                // drain the queue under: a release in the gap between the
                // check above and here must not be missed.
                if guard.queue.is_empty() && guard.active_writers == 0 {
                    guard.active_readers += 1;
                    guard.unlock();
                    park.unpark();
                } else {
                    guard.queue.push_back(Waiter {
                        kind: Kind::Reader,
                        park,
                    });
                    guard.unlock();
                }
            });
            // Either the self-cancel arm above or `drain_queue` already
            // bumped `active_readers` before unparking us.
            return RwLockReadGuard { lock: self };
        }
    }

    /// Acquires the lock for writing, blocking until available.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            let mut guard = self.state.lock();
            if guard.queue.is_empty() && guard.active_writers == 0 && guard.active_readers == 0 {
                guard.active_writers += 1;
                guard.unlock();
                return RwLockWriteGuard { lock: self };
            }
            guard.unlock();
            Current::park_with(|park| {
                let mut guard = self.state.lock();
                if guard.queue.is_empty() && guard.active_writers == 0 && guard.active_readers == 0 {
                    guard.active_writers += 1;
                    guard.unlock();
                    park.unpark();
                } else {
                    guard.queue.push_back(Waiter {
                        kind: Kind::Writer,
                        park,
                    });
                    guard.unlock();
                }
            });
            return RwLockWriteGuard { lock: self };
        }
    }

    /// Drains the queue from the front, granting readers until a writer is
    /// hit, or granting a single writer. Called with no active holders.
    fn drain_queue(guard: &mut keos::sync::SpinLockGuard<'_, State>) -> alloc::vec::Vec<ParkHandle> {
        let mut woken = alloc::vec::Vec::new();
        loop {
            match guard.queue.front() {
                Some(Waiter {
                    kind: Kind::Reader, ..
                }) => {
                    let w = guard.queue.pop_front().unwrap();
                    guard.active_readers += 1;
                    woken.push(w.park);
                }
                Some(Waiter {
                    kind: Kind::Writer, ..
                }) => {
                    if guard.active_readers == 0 {
                        let w = guard.queue.pop_front().unwrap();
                        guard.active_writers += 1;
                        woken.push(w.park);
                    }
                    break;
                }
                None => break,
            }
        }
        woken
    }

    fn unlock_read(&self) {
        let mut guard = self.state.lock();
        guard.active_readers -= 1;
        let woken = if guard.active_readers == 0 {
            Self::drain_queue(&mut guard)
        } else {
            alloc::vec::Vec::new()
        };
        guard.unlock();
        for w in woken {
            w.unpark();
        }
    }

    fn unlock_write(&self) {
        let mut guard = self.state.lock();
        guard.active_writers -= 1;
        let woken = Self::drain_queue(&mut guard);
        guard.unlock();
        for w in woken {
            w.unpark();
        }
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

/// A scoped read guard of an [`RwLock`].
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

unsafe impl<T: Sync> Sync for RwLockReadGuard<'_, T> {}

/// A scoped write guard of an [`RwLock`].
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

unsafe impl<T: Sync> Sync for RwLockWriteGuard<'_, T> {}
