//! On-disk inode records and the in-memory, reference-counted inode store.
//!
//! The on-disk record's field layout is spec-defined (`spec.md` §3), but the
//! `#[repr(C)]` fixed-size-record style and the `Option<Sector>` boundary
//! over a `NO_SECTOR`-sentinel on-disk field is grounded on
//! `keos-project5::ffs::disk_layout`'s `SuperBlock`/`Inode` records and its
//! `Option<LogicalBlockAddress>` API surface (`SPEC_FULL.md` §4.D/§4.F).

use super::{NO_SECTOR, SECTOR_SIZE, cache::Cache, freemap::FreeMap};
use crate::sync::rwlock::RwLock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use keos::KernelError;
use keos::fs::Sector;
use keos::sync::SpinLock;

/// Direct extent pointers held inline in the inode record.
pub const DIRECT_COUNT: usize = 10;
/// Sector numbers packed into one indirect block.
pub const PTRS_PER_INDIRECT: usize = SECTOR_SIZE / 4;
/// Magic tag identifying a valid inode record.
pub const INODE_MAGIC: u32 = 0x4b65_4f53;

/// The fixed-size, one-sector on-disk inode record.
///
/// `length` is listed first so it lands at offset 0: `repr(C)` would
/// otherwise insert four bytes of alignment padding in front of it (to
/// satisfy the `u64`'s 8-byte alignment) that the hand-sized `_pad` tail
/// does not account for, overflowing the record past one sector.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OnDiskInode {
    length: u64,
    magic: u32,
    is_dir: u32,
    file_count: u32,
    parent: u32,
    direct: [u32; DIRECT_COUNT],
    indirect: u32,
    doubly_indirect: u32,
    _pad: [u8; SECTOR_SIZE
        - 8 - 4 - 4 - 4 - 4 - DIRECT_COUNT * 4 - 4 - 4],
}

const _: () = assert!(core::mem::size_of::<OnDiskInode>() == SECTOR_SIZE);

fn decode_sector(v: u32) -> Option<Sector> {
    if v == NO_SECTOR.0 as u32 { None } else { Some(Sector(v as usize)) }
}

impl OnDiskInode {
    fn new(length: usize, is_dir: bool, parent: Sector) -> Self {
        Self {
            length: length as u64,
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
            file_count: 0,
            parent: parent.0 as u32,
            direct: [NO_SECTOR.0 as u32; DIRECT_COUNT],
            indirect: NO_SECTOR.0 as u32,
            doubly_indirect: NO_SECTOR.0 as u32,
            _pad: [0; SECTOR_SIZE - 8 - 4 - 4 - 4 - 4 - DIRECT_COUNT * 4 - 4 - 4],
        }
    }

    fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        unsafe { &*(self as *const Self as *const [u8; SECTOR_SIZE]) }
    }

    fn from_bytes(buf: &[u8; SECTOR_SIZE]) -> Self {
        unsafe { *(buf as *const [u8; SECTOR_SIZE] as *const Self) }
    }
}

fn read_inode(cache: &Cache, sector: Sector) -> OnDiskInode {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, &mut buf, SECTOR_SIZE, 0);
    let inode = OnDiskInode::from_bytes(&buf);
    assert_eq!(inode.magic, INODE_MAGIC, "corrupted inode at {:?}", sector);
    inode
}

fn write_inode(cache: &Cache, sector: Sector, inode: &OnDiskInode) {
    cache.write(sector, inode.as_bytes(), SECTOR_SIZE, 0);
}

fn read_indirect(cache: &Cache, sector: Sector) -> [u32; PTRS_PER_INDIRECT] {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, &mut buf, SECTOR_SIZE, 0);
    let mut out = [0u32; PTRS_PER_INDIRECT];
    for (i, chunk) in buf.chunks_exact(4).enumerate() {
        out[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    out
}

fn write_indirect(cache: &Cache, sector: Sector, ptrs: &[u32; PTRS_PER_INDIRECT]) {
    let mut buf = [0u8; SECTOR_SIZE];
    for (i, p) in ptrs.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
    }
    cache.write(sector, &buf, SECTOR_SIZE, 0);
}

/// Grows or shrinks the set of data sectors, allocating through `freemap`.
/// Unwinds every allocation it performed (including intermediate indirect
/// blocks) in reverse order on failure, per `spec.md` §4.D's testable
/// property #3.
fn grow(
    cache: &Cache,
    freemap: &FreeMap,
    inode: &mut OnDiskInode,
    new_sector_count: usize,
) -> Result<(), KernelError> {
    let old_count = sector_count(inode);
    if new_sector_count <= old_count {
        return Ok(());
    }

    let mut allocated: Vec<Sector> = Vec::new();
    let result = (|| -> Result<(), KernelError> {
        for idx in old_count..new_sector_count {
            let sector = freemap.allocate(1)?;
            allocated.push(sector);
            place_extent(cache, freemap, inode, idx, sector, &mut allocated)?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        // Unwind: release every sector (data and any newly created indirect
        // blocks) back to the free map, in reverse order.
        for s in allocated.into_iter().rev() {
            freemap.release(s, 1);
            cache.free(s);
        }
        clear_unused_extents(inode, old_count);
        return Err(e);
    }
    Ok(())
}

/// Number of data sectors currently backed by allocated extents (not
/// counting indirect index blocks themselves).
///
/// Derived from `length` rather than by counting non-zero direct pointers:
/// `grow`'s caller always passes the pre-growth `inode` (length not yet
/// bumped), so this gives the correct "already allocated" count across all
/// three extent tiers, not just the first `DIRECT_COUNT` entries.
fn sector_count(inode: &OnDiskInode) -> usize {
    (inode.length as usize).div_ceil(SECTOR_SIZE)
}

/// Clears any direct/indirect/doubly-indirect pointer at index `>= from`
/// back to `NO_SECTOR`, used after an unwind.
fn clear_unused_extents(inode: &mut OnDiskInode, from: usize) {
    for i in from..DIRECT_COUNT.min(inode.direct.len()) {
        inode.direct[i] = NO_SECTOR.0 as u32;
    }
    if from <= DIRECT_COUNT {
        inode.indirect = NO_SECTOR.0 as u32;
    }
    if from <= DIRECT_COUNT + PTRS_PER_INDIRECT {
        inode.doubly_indirect = NO_SECTOR.0 as u32;
    }
}

/// Places a newly allocated `sector` at extent index `idx`, allocating any
/// intermediate indirect blocks needed along the way (tracked in
/// `allocated` so a later failure can unwind them too).
fn place_extent(
    cache: &Cache,
    freemap: &FreeMap,
    inode: &mut OnDiskInode,
    idx: usize,
    sector: Sector,
    allocated: &mut Vec<Sector>,
) -> Result<(), KernelError> {
    // Zero the data sector itself, not just the index blocks below: a hole
    // read back before anything is written there must read as zeros, not
    // whatever a previous owner left on disk.
    cache.write(sector, &[0u8; SECTOR_SIZE], SECTOR_SIZE, 0);

    if idx < DIRECT_COUNT {
        inode.direct[idx] = sector.0 as u32;
        return Ok(());
    }
    let idx = idx - DIRECT_COUNT;
    let no_sector = NO_SECTOR.0 as u32;
    if idx < PTRS_PER_INDIRECT {
        if inode.indirect == no_sector {
            let ib = freemap.allocate(1)?;
            allocated.push(ib);
            write_indirect(cache, ib, &[no_sector; PTRS_PER_INDIRECT]);
            inode.indirect = ib.0 as u32;
        }
        let ib = Sector(inode.indirect as usize);
        let mut ptrs = read_indirect(cache, ib);
        ptrs[idx] = sector.0 as u32;
        write_indirect(cache, ib, &ptrs);
        return Ok(());
    }
    let idx = idx - PTRS_PER_INDIRECT;
    let (dib_idx, ib_idx) = (idx / PTRS_PER_INDIRECT, idx % PTRS_PER_INDIRECT);
    if inode.doubly_indirect == no_sector {
        let dib = freemap.allocate(1)?;
        allocated.push(dib);
        write_indirect(cache, dib, &[no_sector; PTRS_PER_INDIRECT]);
        inode.doubly_indirect = dib.0 as u32;
    }
    let dib = Sector(inode.doubly_indirect as usize);
    let mut dib_ptrs = read_indirect(cache, dib);
    if dib_ptrs[dib_idx] == no_sector {
        let ib = freemap.allocate(1)?;
        allocated.push(ib);
        write_indirect(cache, ib, &[no_sector; PTRS_PER_INDIRECT]);
        dib_ptrs[dib_idx] = ib.0 as u32;
        write_indirect(cache, dib, &dib_ptrs);
    }
    let ib = Sector(dib_ptrs[dib_idx] as usize);
    let mut ib_ptrs = read_indirect(cache, ib);
    ib_ptrs[ib_idx] = sector.0 as u32;
    write_indirect(cache, ib, &ib_ptrs);
    Ok(())
}

/// Maps a byte offset to the sector backing it, or `None` if that offset is
/// beyond any allocated extent.
pub fn byte_to_sector(cache: &Cache, inode: &OnDiskInode, pos: usize) -> Option<Sector> {
    let idx = pos / SECTOR_SIZE;
    if idx < DIRECT_COUNT {
        return decode_sector(inode.direct[idx]);
    }
    let idx = idx - DIRECT_COUNT;
    if idx < PTRS_PER_INDIRECT {
        let ib = decode_sector(inode.indirect)?;
        let ptrs = read_indirect(cache, ib);
        return decode_sector(ptrs[idx]);
    }
    let idx = idx - PTRS_PER_INDIRECT;
    let (dib_idx, ib_idx) = (idx / PTRS_PER_INDIRECT, idx % PTRS_PER_INDIRECT);
    let dib = decode_sector(inode.doubly_indirect)?;
    let dib_ptrs = read_indirect(cache, dib);
    let ib = decode_sector(dib_ptrs[dib_idx])?;
    let ib_ptrs = read_indirect(cache, ib);
    decode_sector(ib_ptrs[ib_idx])
}

/// A reference-counted, in-memory inode. Shared by sector number via
/// [`OpenInodes`]: concurrent `open(sector)` calls return the same instance
/// with the open count incremented, per `spec.md` §3's uniqueness
/// invariant.
pub struct Inode {
    sector: Sector,
    open_count: SpinLock<usize>,
    removed: keos::sync::atomic::AtomicBool,
    deny_write_count: SpinLock<usize>,
    record: RwLock<OnDiskInode>,
}

unsafe impl Send for Inode {}
unsafe impl Sync for Inode {}

impl Inode {
    /// Sector this inode's on-disk record lives at; also its identity.
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Current length in bytes.
    pub fn length(&self) -> usize {
        self.record.read().length as usize
    }

    /// Whether this inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.record.read().is_dir != 0
    }

    /// The sector of the directory entry that contains this inode (for
    /// `".."` resolution).
    pub fn parent(&self) -> Sector {
        Sector(self.record.read().parent as usize)
    }

    /// Entries currently tracked for a directory inode (excludes `.`/`..`).
    pub fn file_count(&self) -> u32 {
        self.record.read().file_count
    }

    /// Read-modify-write `file_count` by `delta` under the writer lock.
    pub fn update_file_count(&self, cache: &Cache, delta: i32) {
        let mut record = self.record.write();
        record.file_count = (record.file_count as i32 + delta) as u32;
        write_inode(cache, self.sector, &record);
    }

    /// Reads up to `min(size, length - offset)` bytes into `buf`, stopping
    /// short on a hole or end-of-file. Never grows the file.
    pub fn read_at(&self, cache: &Cache, buf: &mut [u8], size: usize, offset: usize) -> usize {
        let record = self.record.read();
        let length = record.length as usize;
        if offset >= length {
            return 0;
        }
        let want = size.min(length - offset);
        let mut done = 0;
        while done < want {
            let pos = offset + done;
            let sector = match byte_to_sector(cache, &record, pos) {
                Some(s) => s,
                None => break,
            };
            let in_sector = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - in_sector).min(want - done);
            cache.read(sector, &mut buf[done..done + chunk], chunk, in_sector);
            done += chunk;
        }
        done
    }

    /// Writes `size` bytes from `buf` at `offset`, growing the file (and
    /// zero-filling any implicit hole) if `offset + size > length`. Fails
    /// (writes nothing) while `deny_write_count` is positive.
    pub fn write_at(
        &self,
        cache: &Cache,
        freemap: &FreeMap,
        buf: &[u8],
        size: usize,
        offset: usize,
    ) -> usize {
        let denied = {
            let guard = self.deny_write_count.lock();
            let denied = *guard > 0;
            guard.unlock();
            denied
        };
        if denied {
            return 0;
        }

        let needs_growth = {
            let record = self.record.read();
            offset + size > record.length as usize
        };

        if !needs_growth {
            let record = self.record.read();
            let mut done = 0;
            while done < size {
                let pos = offset + done;
                let sector = match byte_to_sector(cache, &record, pos) {
                    Some(s) => s,
                    None => break,
                };
                let in_sector = pos % SECTOR_SIZE;
                let chunk = (SECTOR_SIZE - in_sector).min(size - done);
                cache.write(sector, &buf[done..done + chunk], chunk, in_sector);
                done += chunk;
            }
            done
        } else {
            let mut record = self.record.write();
            let needed_sectors = (offset + size).div_ceil(SECTOR_SIZE);
            if grow(cache, freemap, &mut record, needed_sectors).is_err() {
                return 0;
            }
            record.length = (offset + size) as u64;
            write_inode(cache, self.sector, &record);

            let mut done = 0;
            while done < size {
                let pos = offset + done;
                let sector = byte_to_sector(cache, &record, pos).expect("just grown");
                let in_sector = pos % SECTOR_SIZE;
                let chunk = (SECTOR_SIZE - in_sector).min(size - done);
                cache.write(sector, &buf[done..done + chunk], chunk, in_sector);
                done += chunk;
            }
            done
        }
    }

    /// Increments `deny_write_count`, bounded above by the open count.
    pub fn deny_write(&self) {
        let open_count = {
            let guard = self.open_count.lock();
            let v = *guard;
            guard.unlock();
            v
        };
        let mut d = self.deny_write_count.lock();
        if *d < open_count {
            *d += 1;
        }
        d.unlock();
    }

    /// Decrements `deny_write_count`.
    pub fn allow_write(&self) {
        let mut d = self.deny_write_count.lock();
        if *d > 0 {
            *d -= 1;
        }
        d.unlock();
    }
}

/// Process-wide open-inode list, keyed by sector. Grounded on `spec.md`
/// §3's "at most one in-memory inode per sector" invariant and §4.D's
/// `close`/`reopen` handshake.
pub struct OpenInodes {
    table: SpinLock<BTreeMap<usize, Arc<Inode>>>,
}

impl Default for OpenInodes {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenInodes {
    /// Creates an empty open-inode table.
    pub fn new() -> Self {
        Self {
            table: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Initializes a fresh on-disk inode at `sector`, then grows it to
    /// back `length` bytes. Writes the inode record only once all
    /// allocations have succeeded.
    pub fn create(
        &self,
        cache: &Cache,
        freemap: &FreeMap,
        sector: Sector,
        length: usize,
        is_dir: bool,
        parent: Sector,
    ) -> Result<(), KernelError> {
        let mut record = OnDiskInode::new(0, is_dir, parent);
        let needed_sectors = length.div_ceil(SECTOR_SIZE);
        grow(cache, freemap, &mut record, needed_sectors)?;
        record.length = length as u64;
        write_inode(cache, sector, &record);
        Ok(())
    }

    /// Opens (or reopens) the inode at `sector`, returning the shared
    /// in-memory instance with its open count incremented.
    pub fn open(&self, cache: &Cache, sector: Sector) -> Arc<Inode> {
        let mut table = self.table.lock();
        if let Some(inode) = table.get(&sector.0) {
            let inode = inode.clone();
            let mut count = inode.open_count.lock();
            *count += 1;
            count.unlock();
            table.unlock();
            return inode;
        }
        let record = read_inode(cache, sector);
        let inode = Arc::new(Inode {
            sector,
            open_count: SpinLock::new(1),
            removed: keos::sync::atomic::AtomicBool::new(false),
            deny_write_count: SpinLock::new(0),
            record: RwLock::new(record),
        });
        table.insert(sector.0, inode.clone());
        table.unlock();
        inode
    }

    /// Marks `inode` for deletion on last close.
    pub fn remove(&self, inode: &Arc<Inode>) {
        inode.removed.store(true);
    }

    /// Closes `inode`, freeing all of its allocated sectors if it was
    /// marked removed and this was the last reference.
    pub fn close(&self, cache: &Cache, freemap: &FreeMap, inode: Arc<Inode>) {
        let mut table = self.table.lock();
        let should_destroy = {
            let mut count = inode.open_count.lock();
            *count -= 1;
            let zero = *count == 0;
            count.unlock();
            zero
        };
        if should_destroy {
            table.remove(&inode.sector.0);
        }
        table.unlock();

        if should_destroy && inode.removed.load() {
            cache.flush(false);
            let record = inode.record.read();
            free_all_extents(cache, freemap, &record);
            freemap.release(inode.sector, 1);
            cache.free(inode.sector);
        }
    }
}

/// Frees every allocated data sector, then each indirect block, then the
/// doubly-indirect block, matching `spec.md` §4.D's `close` order.
fn free_all_extents(cache: &Cache, freemap: &FreeMap, record: &OnDiskInode) {
    let count = sector_count(record);
    for i in 0..count.min(DIRECT_COUNT) {
        if let Some(s) = decode_sector(record.direct[i]) {
            cache.free(s);
            freemap.release(s, 1);
        }
    }
    if let Some(ib) = decode_sector(record.indirect) {
        let ptrs = read_indirect(cache, ib);
        for p in ptrs {
            if let Some(s) = decode_sector(p) {
                cache.free(s);
                freemap.release(s, 1);
            }
        }
        cache.free(ib);
        freemap.release(ib, 1);
    }
    if let Some(dib) = decode_sector(record.doubly_indirect) {
        let dib_ptrs = read_indirect(cache, dib);
        for p in dib_ptrs {
            if let Some(ib) = decode_sector(p) {
                let ptrs = read_indirect(cache, ib);
                for pp in ptrs {
                    if let Some(s) = decode_sector(pp) {
                        cache.free(s);
                        freemap.release(s, 1);
                    }
                }
                cache.free(ib);
                freemap.release(ib, 1);
            }
        }
        cache.free(dib);
        freemap.release(dib, 1);
    }
}
