//! The kernel-wide file-descriptor table.
//!
//! Grounded on `keos-project1::file_struct::FileStruct` for the fd-indexed
//! open-file abstraction, reworked per `spec.md` §4.I into a single
//! fixed-size, process-wide table (`OPEN_FILE_MAX` = 1024) rather than one
//! `BTreeMap` per process: every entry remembers the tid that installed it,
//! so a thread handing a foreign fd number to `read`/`write`/`close` gets
//! `KernelError::BadFileDescriptor` instead of touching another process's
//! open file.
//!
//! fds 0 and 1 are never allocated out of this table — they name
//! stdin/stdout unconditionally and are special-cased by the dispatcher
//! before it ever calls here (`spec.md` §4.I).

use crate::fs::cache::Cache;
use crate::fs::dir::ReadDirCursor;
use crate::fs::freemap::FreeMap;
use crate::fs::inode::Inode;
use alloc::sync::Arc;
use alloc::vec::Vec;
use keos::KernelError;
use keos::sync::SpinLock;

/// Total descriptor slots, including the two reserved for stdio.
pub const OPEN_FILE_MAX: usize = 1024;
/// Lowest fd this table will ever hand out; 0 and 1 are stdio.
const FIRST_ALLOCATABLE_FD: usize = 2;

/// What an open descriptor refers to.
pub enum Kind {
    /// A byte-addressable regular file, with its own read/write cursor.
    File { inode: Arc<Inode>, pos: usize },
    /// A directory, with its own readdir iteration cursor.
    Dir {
        inode: Arc<Inode>,
        cursor: ReadDirCursor,
    },
}

struct Entry {
    owner_tid: u64,
    kind: Kind,
}

struct Table {
    slots: Vec<Option<Entry>>,
}

/// The process-wide table of open file descriptors.
pub struct FdTable {
    inner: SpinLock<Table>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    /// Builds an empty table with every slot free.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(OPEN_FILE_MAX);
        slots.resize_with(OPEN_FILE_MAX, || None);
        Self {
            inner: SpinLock::new(Table { slots }),
        }
    }

    /// Installs `kind` at the lowest free fd at or above
    /// [`FIRST_ALLOCATABLE_FD`], recording `owner_tid` as its owner.
    pub fn install(&self, owner_tid: u64, kind: Kind) -> Result<i32, KernelError> {
        let mut table = self.inner.lock();
        let slot = table.slots[FIRST_ALLOCATABLE_FD..]
            .iter()
            .position(Option::is_none)
            .map(|i| i + FIRST_ALLOCATABLE_FD);
        let result = match slot {
            Some(idx) => {
                table.slots[idx] = Some(Entry { owner_tid, kind });
                Ok(idx as i32)
            }
            None => Err(KernelError::TooManyOpenFile),
        };
        table.unlock();
        result
    }

    /// Runs `f` against the entry at `fd`, failing with
    /// `KernelError::BadFileDescriptor` if `fd` is out of range, unused, or
    /// owned by a tid other than `owner_tid`.
    fn with_entry<R>(
        &self,
        owner_tid: u64,
        fd: i32,
        f: impl FnOnce(&mut Kind) -> Result<R, KernelError>,
    ) -> Result<R, KernelError> {
        if fd < FIRST_ALLOCATABLE_FD as i32 {
            return Err(KernelError::BadFileDescriptor);
        }
        let mut table = self.inner.lock();
        let result = match table.slots.get_mut(fd as usize) {
            Some(Some(entry)) if entry.owner_tid == owner_tid => f(&mut entry.kind),
            _ => Err(KernelError::BadFileDescriptor),
        };
        table.unlock();
        result
    }

    /// Reads up to `buf.len()` bytes from `fd`'s current position,
    /// advancing it by the amount read.
    pub fn read(
        &self,
        cache: &Cache,
        owner_tid: u64,
        fd: i32,
        buf: &mut [u8],
    ) -> Result<usize, KernelError> {
        self.with_entry(owner_tid, fd, |kind| match kind {
            Kind::File { inode, pos } => {
                let n = inode.read_at(cache, buf, buf.len(), *pos);
                *pos += n;
                Ok(n)
            }
            Kind::Dir { .. } => Err(KernelError::IsDirectory),
        })
    }

    /// Writes `buf` at `fd`'s current position, advancing it by the amount
    /// written.
    pub fn write(
        &self,
        cache: &Cache,
        freemap: &FreeMap,
        owner_tid: u64,
        fd: i32,
        buf: &[u8],
    ) -> Result<usize, KernelError> {
        self.with_entry(owner_tid, fd, |kind| match kind {
            Kind::File { inode, pos } => {
                let n = inode.write_at(cache, freemap, buf, buf.len(), *pos);
                *pos += n;
                Ok(n)
            }
            Kind::Dir { .. } => Err(KernelError::IsDirectory),
        })
    }

    /// Moves `fd`'s cursor to an absolute byte offset.
    pub fn seek(&self, owner_tid: u64, fd: i32, offset: usize) -> Result<(), KernelError> {
        self.with_entry(owner_tid, fd, |kind| {
            match kind {
                Kind::File { pos, .. } => *pos = offset,
                Kind::Dir { .. } => return Err(KernelError::IsDirectory),
            }
            Ok(())
        })
    }

    /// Returns `fd`'s current cursor position.
    pub fn tell(&self, owner_tid: u64, fd: i32) -> Result<usize, KernelError> {
        self.with_entry(owner_tid, fd, |kind| match kind {
            Kind::File { pos, .. } => Ok(*pos),
            Kind::Dir { .. } => Err(KernelError::IsDirectory),
        })
    }

    /// Returns the length in bytes of the file backing `fd`.
    pub fn filesize(&self, owner_tid: u64, fd: i32) -> Result<usize, KernelError> {
        self.with_entry(owner_tid, fd, |kind| match kind {
            Kind::File { inode, .. } => Ok(inode.length()),
            Kind::Dir { .. } => Err(KernelError::IsDirectory),
        })
    }

    /// Whether `fd` names a directory.
    pub fn is_dir(&self, owner_tid: u64, fd: i32) -> Result<bool, KernelError> {
        self.with_entry(owner_tid, fd, |kind| {
            Ok(matches!(kind, Kind::Dir { .. }))
        })
    }

    /// Returns the inode-sector-derived inumber for `fd`.
    pub fn inumber(&self, owner_tid: u64, fd: i32) -> Result<usize, KernelError> {
        self.with_entry(owner_tid, fd, |kind| {
            let inode = match kind {
                Kind::File { inode, .. } => inode,
                Kind::Dir { inode, .. } => inode,
            };
            Ok(inode.sector().0)
        })
    }

    /// Advances `fd`'s directory cursor, writing the next entry name (if
    /// any) into `name` and returning whether an entry was produced.
    pub fn readdir(
        &self,
        cache: &Cache,
        owner_tid: u64,
        fd: i32,
        name: &mut Vec<u8>,
    ) -> Result<bool, KernelError> {
        self.with_entry(owner_tid, fd, |kind| match kind {
            Kind::Dir { inode, cursor } => match cursor.next(inode, cache) {
                Some((entry_name, _sector)) => {
                    name.clear();
                    name.extend_from_slice(entry_name.as_bytes());
                    Ok(true)
                }
                None => Ok(false),
            },
            Kind::File { .. } => Err(KernelError::NotDirectory),
        })
    }

    /// Returns the inode backing `fd`, without disturbing its cursor — used
    /// by `mmap` to register a [`crate::vm::supplemental::BackingFile`] over
    /// the same underlying file.
    pub fn inode_of(&self, owner_tid: u64, fd: i32) -> Result<Arc<Inode>, KernelError> {
        self.with_entry(owner_tid, fd, |kind| {
            let inode = match kind {
                Kind::File { inode, .. } => inode,
                Kind::Dir { inode, .. } => inode,
            };
            Ok(inode.clone())
        })
    }

    /// Removes `fd` from the table, returning its entry for the caller to
    /// close against the open-inode table. `KernelError::BadFileDescriptor`
    /// if `fd` is unused or foreign.
    pub fn close(&self, owner_tid: u64, fd: i32) -> Result<Arc<Inode>, KernelError> {
        if fd < FIRST_ALLOCATABLE_FD as i32 {
            return Err(KernelError::BadFileDescriptor);
        }
        let mut table = self.inner.lock();
        let owns = matches!(table.slots.get(fd as usize), Some(Some(e)) if e.owner_tid == owner_tid);
        let result = if owns {
            let entry = table.slots[fd as usize].take().unwrap();
            Ok(match entry.kind {
                Kind::File { inode, .. } => inode,
                Kind::Dir { inode, .. } => inode,
            })
        } else {
            Err(KernelError::BadFileDescriptor)
        };
        table.unlock();
        result
    }

    /// Closes every fd owned by `owner_tid`, returning their inodes for the
    /// caller to release — used by whole-process teardown.
    pub fn close_all_owned_by(&self, owner_tid: u64) -> Vec<Arc<Inode>> {
        let mut table = self.inner.lock();
        let mut closed = Vec::new();
        for slot in table.slots[FIRST_ALLOCATABLE_FD..].iter_mut() {
            if matches!(slot, Some(e) if e.owner_tid == owner_tid) {
                let entry = slot.take().unwrap();
                closed.push(match entry.kind {
                    Kind::File { inode, .. } => inode,
                    Kind::Dir { inode, .. } => inode,
                });
            }
        }
        table.unlock();
        closed
    }
}
