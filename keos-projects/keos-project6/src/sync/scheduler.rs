//! A priority-ordered multicore scheduler.
//!
//! Shaped exactly like `keos-project4`'s `RoundRobin`: one [`PerCore`] ready
//! queue per CPU, installed with [`keos::SystemConfigurationBuilder::set_scheduler`].
//! The difference is ordering: [`RoundRobin`] always pops the front of its
//! queue, so a thread that received a priority donation through
//! [`super::mutex::Mutex`] has no way to actually run sooner. `next_to_run`
//! here instead pulls the runnable thread with the greatest
//! [`priority_table::effective`] priority on this core, so donation is
//! observable end-to-end rather than bookkeeping nothing reads.
//!
//! [`RoundRobin`]: https://doc.rust-lang.org/stable/alloc/boxed/struct.Box.html

use super::priority_table;
use alloc::{boxed::Box, collections::VecDeque};
use keos::{
    MAX_CPU,
    intrinsics::cpuid,
    sync::SpinLock,
    sync::atomic::{AtomicIsize, AtomicU64},
    thread::{Thread, scheduler::Scheduler},
};

/// Global count of timer ticks observed since boot.
///
/// `keos` has no standalone `sleep_ticks` primitive of its own (it is named
/// only as an external collaborator by `spec.md` §1); [`fs::cache`]'s
/// background flusher approximates it by polling this counter instead.
///
/// [`fs::cache`]: crate::fs::cache
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks observed since boot.
pub fn ticks() -> u64 {
    TICKS.load()
}

/// Default time slice, in ticks (1 tick == 1ms), granted to a thread before
/// it is preempted in favor of the next-highest-priority runnable thread.
pub const QUANTUM_TICKS: isize = 5;

/// Per-core scheduler state: a priority-ordered ready queue and the
/// current thread's remaining quantum.
pub struct PerCore {
    run_queue: SpinLock<VecDeque<Box<Thread>>>,
    remain: AtomicIsize,
}

/// A priority-aware, work-stealing multicore scheduler.
pub struct PriorityScheduler {
    percores: [PerCore; MAX_CPU],
}

unsafe impl Send for PriorityScheduler {}
unsafe impl Sync for PriorityScheduler {}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityScheduler {
    /// Creates a scheduler with an empty ready queue on every core.
    pub fn new() -> Self {
        Self {
            percores: [0; MAX_CPU].map(|_| PerCore {
                run_queue: SpinLock::new(VecDeque::new()),
                remain: AtomicIsize::new(QUANTUM_TICKS as isize),
            }),
        }
    }

    /// Picks the index of the highest-effective-priority thread in `queue`,
    /// breaking ties by queue position (earliest wins).
    fn pick_highest(queue: &VecDeque<Box<Thread>>) -> Option<usize> {
        queue
            .iter()
            .enumerate()
            .max_by_key(|(i, th)| (priority_table::effective(th.tid), core::cmp::Reverse(*i)))
            .map(|(i, _)| i)
    }
}

impl Scheduler for PriorityScheduler {
    fn next_to_run(&self) -> Option<Box<Thread>> {
        let coreid = cpuid();
        let percore = &self.percores[coreid];
        let mut guard = percore.run_queue.lock();
        let picked = match Self::pick_highest(&guard) {
            Some(idx) => guard.remove(idx),
            None => None,
        };
        guard.unlock();

        let picked = picked.or_else(|| {
            // Work-steal: take the highest-priority thread from the
            // busiest other core's queue.
            (0..MAX_CPU).filter(|&c| c != coreid).find_map(|c| {
                let mut guard = self.percores[c].run_queue.lock();
                let stolen = match Self::pick_highest(&guard) {
                    Some(idx) => guard.remove(idx),
                    None => None,
                };
                guard.unlock();
                stolen
            })
        });

        if picked.is_some() {
            percore.remain.store(QUANTUM_TICKS as isize);
        }
        picked
    }

    fn push_to_queue(&self, th: Box<Thread>) {
        let coreid = cpuid();
        let mut guard = self.percores[coreid].run_queue.lock();
        guard.push_back(th);
        guard.unlock();
    }

    fn timer_tick(&self) {
        TICKS.fetch_add(1);
        let coreid = cpuid();
        let percore = &self.percores[coreid];
        let remain = percore.remain.fetch_sub(1) - 1;
        if remain <= 0 {
            percore.remain.store(QUANTUM_TICKS as isize);
            keos::thread::scheduler::scheduler().reschedule();
        }
    }
}
