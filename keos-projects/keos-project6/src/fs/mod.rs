//! A buffered, indexed file system over a single block device.
//!
//! Built from the leaves up, matching `spec.md`'s dependency order
//! `{B,C,E} ← F`: [`cache`] is the write-back sector cache every other
//! module reads and writes through, [`swap`] is an independent slot
//! allocator over a second device, [`inode`] is the on-disk/in-memory inode
//! store layered on the cache, [`freemap`] is the free-sector bitmap (itself
//! stored in a reserved sector region at the front of the device), and
//! [`dir`] is the hierarchical directory layer built on top of `inode`.
//!
//! Grounded on `keos::fs` for the primitives every `keos-projectN` file
//! system reuses (`Disk`, `Sector`), and on `keos-project5`'s `ffs` module
//! for the on-disk layout idioms (`#[repr(C)]` fixed records, bitmaps) —
//! though, unlike `ffs`, there is no journal and no page-cache layer: a
//! single sector cache plays both roles, per `spec.md` §2.

pub mod cache;
pub mod dir;
pub mod freemap;
pub mod inode;
pub mod swap;

/// Bytes in one sector; matches `keos::fs::Sector`'s fixed unit.
pub const SECTOR_SIZE: usize = 512;

/// Bytes in one user page; one page is eight sectors.
pub const PAGE_SIZE: usize = 4096;

/// Sectors per page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Fixed number of slots in the sector cache.
pub const CACHE_SIZE: usize = 64;

/// Ticks between background flusher sweeps.
pub const FLUSH_PERIOD: u64 = 1000;

/// Sentinel sector value meaning "not allocated". Re-uses `Sector(0)`,
/// which is safe because sector 0 is reserved for the free-map inode and is
/// never a valid extent target for any other inode. See `SPEC_FULL.md`
/// §4.D/§4.F.
pub const NO_SECTOR: keos::fs::Sector = keos::fs::Sector(0);

/// The reserved sector of the free-map inode.
pub const FREEMAP_SECTOR: keos::fs::Sector = keos::fs::Sector(0);

/// The reserved sector of the root directory inode.
pub const ROOT_SECTOR: keos::fs::Sector = keos::fs::Sector(1);

/// Maximum length of a single path component, in bytes, not counting the
/// NUL terminator.
pub const NAME_MAX: usize = 30;
