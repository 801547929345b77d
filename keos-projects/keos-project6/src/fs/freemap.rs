//! The free-sector bitmap, persisted in a reserved region of the disk
//! starting at [`FREEMAP_SECTOR`].
//!
//! Grounded on the same bit-twiddling idiom [`super::swap::Swap`] uses
//! (itself grounded on `keos-project5::ffs::disk_layout::BlockBitmap`), but
//! read and written through the sector cache rather than with raw disk I/O —
//! per `spec.md` §4.E the bitmap's persistent copy is only written at
//! `close`/`format` time, because all interim updates flow through the
//! cache like any other device content.

use super::{FREEMAP_SECTOR, ROOT_SECTOR, SECTOR_SIZE, cache::Cache};
use alloc::vec::Vec;
use keos::KernelError;
use keos::fs::Sector;
use keos::sync::SpinLock;

fn reserved_sectors(bytes_needed: usize) -> usize {
    bytes_needed.div_ceil(SECTOR_SIZE)
}

struct Bitmap {
    bits: Vec<u64>,
    sector_count: usize,
}

impl Bitmap {
    fn is_set(&self, i: usize) -> bool {
        self.bits[i / 64] & (1 << (i % 64)) != 0
    }
    fn set(&mut self, i: usize) {
        self.bits[i / 64] |= 1 << (i % 64);
    }
    fn clear(&mut self, i: usize) {
        self.bits[i / 64] &= !(1 << (i % 64));
    }
}

/// Marks the sectors the bitmap region itself occupies (starting at
/// [`FREEMAP_SECTOR`]) and the root directory's sector as permanently used.
fn reserve_fixed_sectors(bitmap: &mut Bitmap, bitmap_bytes: usize) {
    for i in 0..reserved_sectors(bitmap_bytes) {
        bitmap.set(FREEMAP_SECTOR.0 + i);
    }
    bitmap.set(ROOT_SECTOR.0);
}

/// The persistent free-sector bitmap.
pub struct FreeMap {
    bitmap: SpinLock<Bitmap>,
}

unsafe impl Send for FreeMap {}
unsafe impl Sync for FreeMap {}

impl FreeMap {
    /// Loads the bitmap from its reserved sector region (starting at
    /// [`FREEMAP_SECTOR`]), sized for `sector_count` sectors on the backing
    /// disk. Spans as many consecutive sectors as the bitmap needs.
    pub fn load(cache: &Cache, sector_count: usize) -> Self {
        let words = sector_count.div_ceil(64);
        let bytes_needed = words * 8;
        let mut bits = alloc::vec![0u64; words];
        let mut done = 0;
        let mut raw = alloc::vec![0u8; bytes_needed];
        while done < bytes_needed {
            let sector = Sector(FREEMAP_SECTOR.0 + done / SECTOR_SIZE);
            let in_sector = done % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - in_sector).min(bytes_needed - done);
            cache.read(sector, &mut raw[done..done + chunk], chunk, in_sector);
            done += chunk;
        }
        for (i, word) in bits.iter_mut().enumerate() {
            let off = i * 8;
            if off + 8 <= raw.len() {
                *word = u64::from_le_bytes(raw[off..off + 8].try_into().unwrap());
            }
        }
        let mut bitmap = Bitmap { bits, sector_count };
        reserve_fixed_sectors(&mut bitmap, bytes_needed);
        Self {
            bitmap: SpinLock::new(bitmap),
        }
    }

    /// Creates a fresh, empty bitmap (used by `format`), reserving the
    /// sectors the bitmap itself occupies plus the root directory's sector.
    pub fn format(sector_count: usize) -> Self {
        let words = sector_count.div_ceil(64);
        let bits = alloc::vec![0u64; words];
        let mut bitmap = Bitmap { bits, sector_count };
        reserve_fixed_sectors(&mut bitmap, words * 8);
        Self {
            bitmap: SpinLock::new(bitmap),
        }
    }

    /// Finds `n` consecutive free sectors, marks them used, and returns the
    /// first.
    pub fn allocate(&self, n: usize) -> Result<Sector, KernelError> {
        let mut bitmap = self.bitmap.lock();
        let mut run_start = None;
        let mut run_len = 0;
        let mut found = None;
        for i in 0..bitmap.sector_count {
            if !bitmap.is_set(i) {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == n {
                    found = run_start;
                    break;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        let start = match found {
            Some(s) => s,
            None => {
                bitmap.unlock();
                return Err(KernelError::NoSpace);
            }
        };
        for i in start..start + n {
            bitmap.set(i);
        }
        bitmap.unlock();
        Ok(Sector(start))
    }

    /// Clears `n` consecutive bits starting at `sector`.
    pub fn release(&self, sector: Sector, n: usize) {
        let mut bitmap = self.bitmap.lock();
        for i in sector.0..sector.0 + n {
            bitmap.clear(i);
        }
        bitmap.unlock();
    }

    /// Persists the bitmap to its reserved sector region, via the cache.
    /// Called at `close` and after `format`.
    pub fn flush(&self, cache: &Cache) {
        let bitmap = self.bitmap.lock();
        let mut raw = alloc::vec![0u8; bitmap.bits.len() * 8];
        for (i, word) in bitmap.bits.iter().enumerate() {
            raw[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        bitmap.unlock();

        let mut done = 0;
        while done < raw.len() {
            let sector = Sector(FREEMAP_SECTOR.0 + done / SECTOR_SIZE);
            let in_sector = done % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - in_sector).min(raw.len() - done);
            cache.write(sector, &raw[done..done + chunk], chunk, in_sector);
            done += chunk;
        }
    }
}
