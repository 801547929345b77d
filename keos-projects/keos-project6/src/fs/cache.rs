//! A bounded, write-back sector cache with clock-sweep eviction.
//!
//! Shaped on `keos::fs::{Disk, Sector}` the way every `keos-projectN` file
//! system reads/writes its device, with the two-tier locking `spec.md` §4.B
//! requires: a table-level lock guards a lightweight metadata array used for
//! hit search and victim selection, while each slot's 512-byte buffer lives
//! behind its own lock, held across the I/O and the memcpy, so a slow write
//! of one sector never blocks a hit on another. Eviction briefly holds both
//! locks (table, then the victim's slot) to install the new metadata before
//! releasing the table lock and performing I/O under the slot lock alone —
//! this ordering is what lets a concurrent hit search on the same slot block
//! on the slot lock (waiting for the fill to finish) instead of observing a
//! half-written buffer.
//!
//! Only a single `Disk` is cached per [`Cache`] instance (multi-disk volumes
//! are a non-goal per `spec.md` §1), so the device never needs to be part of
//! the lookup key, unlike the `(device, sector)` pair `spec.md` §3 names.

use super::{CACHE_SIZE, FLUSH_PERIOD, SECTOR_SIZE};
use alloc::sync::Arc;
use keos::fs::{Disk, Sector};
use keos::sync::SpinLock;

#[derive(Clone, Copy, Default)]
struct SlotMeta {
    sector: Option<Sector>,
    accessed: bool,
}

struct Table {
    meta: [SlotMeta; CACHE_SIZE],
    hand: usize,
}

struct SlotBuf {
    sector: Option<Sector>,
    data: [u8; SECTOR_SIZE],
    dirty: bool,
}

/// A fixed `N`-slot sector cache over a single block device.
pub struct Cache {
    disk: Disk,
    table: SpinLock<Table>,
    slots: alloc::vec::Vec<SpinLock<SlotBuf>>,
    terminated: keos::sync::atomic::AtomicBool,
}

unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

impl Cache {
    /// Creates an empty cache over `disk`.
    pub fn new(disk: Disk) -> Self {
        Self {
            disk,
            table: SpinLock::new(Table {
                meta: [SlotMeta::default(); CACHE_SIZE],
                hand: 0,
            }),
            slots: (0..CACHE_SIZE)
                .map(|_| {
                    SpinLock::new(SlotBuf {
                        sector: None,
                        data: [0u8; SECTOR_SIZE],
                        dirty: false,
                    })
                })
                .collect(),
            terminated: keos::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Advances the clock hand to find an eviction victim. Caller already
    /// holds `table`.
    fn clock_victim(table: &mut Table) -> usize {
        loop {
            let idx = table.hand;
            table.hand = (table.hand + 1) % CACHE_SIZE;
            if table.meta[idx].sector.is_none() || !table.meta[idx].accessed {
                return idx;
            }
            table.meta[idx].accessed = false;
        }
    }

    /// Locates (loading on miss) the slot caching `sector`, returning its
    /// index and a locked guard over its buffer.
    fn locate(&self, sector: Sector) -> (usize, keos::sync::SpinLockGuard<'_, SlotBuf>) {
        loop {
            let mut table = self.table.lock();
            if let Some(idx) = table.meta.iter().position(|m| m.sector == Some(sector)) {
                table.meta[idx].accessed = true;
                table.unlock();
                let slot = self.slots[idx].lock();
                if slot.sector != Some(sector) {
                    // Evicted and repurposed between releasing the table
                    // lock and taking the slot lock; retry from the top.
                    slot.unlock();
                    continue;
                }
                return (idx, slot);
            }

            let idx = Self::clock_victim(&mut table);
            let mut slot = self.slots[idx].lock();
            table.meta[idx] = SlotMeta {
                sector: Some(sector),
                accessed: false,
            };
            table.unlock();

            if let Some(old_sector) = slot.sector {
                if slot.dirty {
                    let _ = self.disk.write(old_sector, &slot.data);
                }
            }
            let _ = self.disk.read(sector, &mut slot.data);
            slot.sector = Some(sector);
            slot.dirty = false;
            return (idx, slot);
        }
    }

    /// Copies `size` bytes at `offset` within `sector` into `dst`.
    pub fn read(&self, sector: Sector, dst: &mut [u8], size: usize, offset: usize) {
        assert!(offset + size <= SECTOR_SIZE);
        let (_, slot) = self.locate(sector);
        dst[..size].copy_from_slice(&slot.data[offset..offset + size]);
        slot.unlock();
    }

    /// Copies `size` bytes from `src` into `offset` within `sector`, marking
    /// the slot dirty.
    pub fn write(&self, sector: Sector, src: &[u8], size: usize, offset: usize) {
        assert!(offset + size <= SECTOR_SIZE);
        let (_, mut slot) = self.locate(sector);
        slot.data[offset..offset + size].copy_from_slice(&src[..size]);
        slot.dirty = true;
        slot.unlock();
    }

    /// Invalidates the slot caching `sector`, if present. Used after the
    /// sector is returned to the free map so a later reuse does not read
    /// stale contents from an un-flushed dirty slot.
    pub fn free(&self, sector: Sector) {
        let mut table = self.table.lock();
        if let Some(idx) = table.meta.iter().position(|m| m.sector == Some(sector)) {
            table.meta[idx] = SlotMeta::default();
            table.unlock();
            let mut slot = self.slots[idx].lock();
            slot.sector = None;
            slot.dirty = false;
            slot.unlock();
        } else {
            table.unlock();
        }
    }

    /// Writes back every dirty slot. If `terminate`, the background flusher
    /// observes this and stops at its next wakeup.
    pub fn flush(&self, terminate: bool) {
        for slot in &self.slots {
            let mut slot = slot.lock();
            if slot.dirty {
                if let Some(sector) = slot.sector {
                    let _ = self.disk.write(sector, &slot.data);
                }
                slot.dirty = false;
            }
            slot.unlock();
        }
        if terminate {
            self.terminated.store(true);
        }
    }

    /// Spawns the background flusher thread, which wakes every
    /// [`FLUSH_PERIOD`] ticks and flushes all dirty slots, exiting once
    /// [`Cache::flush`]`(true)` has been observed.
    pub fn spawn_flusher(cache: Arc<Cache>) {
        keos::thread::ThreadBuilder::new("fs-cache-flusher").spawn(move || {
            let mut last = crate::sync::scheduler::ticks();
            loop {
                if cache.terminated.load() {
                    return;
                }
                let now = crate::sync::scheduler::ticks();
                if now.wrapping_sub(last) >= FLUSH_PERIOD {
                    last = now;
                    cache.flush(false);
                } else {
                    core::hint::spin_loop();
                }
            }
        });
    }
}
