//! The hierarchical directory layer: entries packed into a directory
//! inode's byte stream, path resolution, and per-process cwd.
//!
//! Grounded on `keos-project5::ffs::disk_layout`'s `DirectoryBlockEntry`/
//! `DirectoryBlock` fixed-record idiom for the entry layout, and on
//! `keos-project1::file_struct`'s `cwd: Directory` field convention for
//! carrying a process's working directory alongside its open files.

use super::{NAME_MAX, ROOT_SECTOR, cache::Cache, freemap::FreeMap, inode::OpenInodes};
use alloc::string::String;
use alloc::sync::Arc;
use keos::KernelError;
use keos::fs::Sector;

const NAME_BUF: usize = NAME_MAX + 1;
/// Size in bytes of one packed directory entry record.
pub const ENTRY_SIZE: usize = 4 + NAME_BUF + 4;

struct RawEntry {
    in_use: bool,
    name: String,
    sector: Sector,
}

fn encode(e: &RawEntry) -> [u8; ENTRY_SIZE] {
    let mut buf = [0u8; ENTRY_SIZE];
    buf[0..4].copy_from_slice(&(e.in_use as u32).to_le_bytes());
    let name_bytes = e.name.as_bytes();
    buf[4..4 + name_bytes.len()].copy_from_slice(name_bytes);
    buf[4 + NAME_BUF..4 + NAME_BUF + 4].copy_from_slice(&(e.sector.0 as u32).to_le_bytes());
    buf
}

fn decode(buf: &[u8; ENTRY_SIZE]) -> RawEntry {
    let in_use = u32::from_le_bytes(buf[0..4].try_into().unwrap()) != 0;
    let name_raw = &buf[4..4 + NAME_BUF];
    let len = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
    let name = String::from_utf8_lossy(&name_raw[..len]).into_owned();
    let sector = u32::from_le_bytes(
        buf[4 + NAME_BUF..4 + NAME_BUF + 4].try_into().unwrap(),
    );
    RawEntry {
        in_use,
        name,
        sector: Sector(sector as usize),
    }
}

fn slot_count(inode: &super::inode::Inode) -> usize {
    inode.length() / ENTRY_SIZE
}

fn read_slot(inode: &super::inode::Inode, cache: &Cache, idx: usize) -> Option<RawEntry> {
    let mut buf = [0u8; ENTRY_SIZE];
    let n = inode.read_at(cache, &mut buf, ENTRY_SIZE, idx * ENTRY_SIZE);
    if n < ENTRY_SIZE {
        return None;
    }
    Some(decode(&buf))
}

fn write_slot(inode: &super::inode::Inode, cache: &Cache, freemap: &FreeMap, idx: usize, e: &RawEntry) {
    let buf = encode(e);
    inode.write_at(cache, freemap, &buf, ENTRY_SIZE, idx * ENTRY_SIZE);
}

/// Linear-scans `dir` for `name`. `"."` and `".."` are synthesized from the
/// inode itself and never materialized on disk.
pub fn lookup(dir: &super::inode::Inode, cache: &Cache, name: &str) -> Option<Sector> {
    if name == "." {
        return Some(dir.sector());
    }
    if name == ".." {
        return Some(dir.parent());
    }
    for idx in 0..slot_count(dir) {
        if let Some(e) = read_slot(dir, cache, idx) {
            if e.in_use && e.name == name {
                return Some(e.sector);
            }
        }
    }
    None
}

/// Adds `name -> sector` to `dir`. Rejects empty/overlong names, `.`/`..`,
/// and duplicates. Writes into the first free slot, or appends.
pub fn add(
    dir: &super::inode::Inode,
    cache: &Cache,
    freemap: &FreeMap,
    name: &str,
    sector: Sector,
) -> Result<(), KernelError> {
    if name.is_empty() || name.len() > NAME_MAX || name == "." || name == ".." {
        return Err(KernelError::InvalidArgument);
    }
    if lookup(dir, cache, name).is_some() {
        return Err(KernelError::FileExist);
    }
    let count = slot_count(dir);
    let free_idx = (0..count).find(|&idx| {
        read_slot(dir, cache, idx)
            .map(|e| !e.in_use)
            .unwrap_or(false)
    });
    let idx = free_idx.unwrap_or(count);
    write_slot(
        dir,
        cache,
        freemap,
        idx,
        &RawEntry {
            in_use: true,
            name: String::from(name),
            sector,
        },
    );
    dir.update_file_count(cache, 1);
    Ok(())
}

/// Removes `name` from `dir`. Refuses to remove root or any process's cwd
/// (checked via `is_cwd`), and refuses a non-empty directory target.
pub fn remove(
    dir: &super::inode::Inode,
    cache: &Cache,
    freemap: &FreeMap,
    open_inodes: &OpenInodes,
    name: &str,
    is_cwd: impl Fn(Sector) -> bool,
) -> Result<(), KernelError> {
    if name == "." || name == ".." {
        return Err(KernelError::InvalidArgument);
    }
    let target = lookup(dir, cache, name).ok_or(KernelError::NoSuchEntry)?;
    if target == ROOT_SECTOR {
        return Err(KernelError::OperationNotPermitted);
    }
    if is_cwd(target) {
        return Err(KernelError::Busy);
    }

    let target_inode = open_inodes.open(cache, target);
    let target_is_dir = target_inode.is_dir();
    let target_file_count = target_inode.file_count();
    if target_is_dir && target_file_count != 0 {
        open_inodes.close(cache, freemap, target_inode);
        return Err(KernelError::DirectoryNotEmpty);
    }

    for idx in 0..slot_count(dir) {
        if let Some(mut e) = read_slot(dir, cache, idx) {
            if e.in_use && e.name == name {
                e.in_use = false;
                write_slot(dir, cache, freemap, idx, &e);
                break;
            }
        }
    }
    dir.update_file_count(cache, -1);
    open_inodes.remove(&target_inode);
    open_inodes.close(cache, freemap, target_inode);
    Ok(())
}

/// A stateful directory-read cursor, skipping free slots and `.`/`..`.
pub struct ReadDirCursor {
    idx: usize,
}

impl Default for ReadDirCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadDirCursor {
    /// Creates a cursor positioned at the start of the entry stream.
    pub fn new() -> Self {
        Self { idx: 0 }
    }

    /// Advances to the next in-use entry, if any.
    pub fn next(&mut self, dir: &super::inode::Inode, cache: &Cache) -> Option<(String, Sector)> {
        let count = slot_count(dir);
        while self.idx < count {
            let idx = self.idx;
            self.idx += 1;
            if let Some(e) = read_slot(dir, cache, idx) {
                if e.in_use {
                    return Some((e.name, e.sector));
                }
            }
        }
        None
    }
}

/// Splits `path` into `(dir_path, last_component)`, matching `spec.md`
/// §4.F's rule: no `/` present means `dir_path = "."`; `path == "/"` is the
/// special "open root" case and rejects being split at all.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some(("/", &trimmed[1..])),
        Some(i) => Some((&trimmed[..i], &trimmed[i + 1..])),
        None => Some((".", trimmed)),
    }
}

/// Resolves `path` to the directory inode it names, starting from `root` if
/// the path is absolute, or `cwd` otherwise. Walks `.`/`..` and interior
/// components; every component but the last must be a directory.
pub fn resolve_dir(
    cache: &Cache,
    freemap: &FreeMap,
    open_inodes: &OpenInodes,
    root: Sector,
    cwd: Sector,
    path: &str,
) -> Result<Arc<super::inode::Inode>, KernelError> {
    let mut cur = if path.starts_with('/') { root } else { cwd };
    let mut cur_inode = open_inodes.open(cache, cur);
    for token in path.split('/').filter(|t| !t.is_empty()) {
        if token == "." {
            continue;
        }
        let next = if token == ".." {
            cur_inode.parent()
        } else {
            let found = lookup(&cur_inode, cache, token).ok_or(KernelError::NoSuchEntry)?;
            found
        };
        let next_inode = open_inodes.open(cache, next);
        if !next_inode.is_dir() {
            open_inodes.close(cache, freemap, next_inode);
            return Err(KernelError::NotDirectory);
        }
        open_inodes.close(cache, freemap, cur_inode);
        cur = next;
        cur_inode = next_inode;
    }
    Ok(cur_inode)
}

/// Resolves `path` (relative to `root`/`cwd`) to the sector it names,
/// without requiring the final component to be a directory. Used by
/// `open`/`create`/`unlink`.
pub fn resolve(
    cache: &Cache,
    freemap: &FreeMap,
    open_inodes: &OpenInodes,
    root: Sector,
    cwd: Sector,
    path: &str,
) -> Result<Sector, KernelError> {
    if path == "/" {
        return Ok(root);
    }
    let (dir_path, last) = split_path(path).ok_or(KernelError::InvalidArgument)?;
    let dir_inode = resolve_dir(cache, freemap, open_inodes, root, cwd, dir_path)?;
    let result = lookup(&dir_inode, cache, last).ok_or(KernelError::NoSuchEntry);
    open_inodes.close(cache, freemap, dir_inode);
    result
}
