//! Per-process supplemental page table: lazy/anonymous/file-backed pages,
//! fault-in, and swap integration.
//!
//! Grounded on `keos-project3/src/lazy_pager.rs`'s `MmLoader`/
//! `VmAreaStruct`/`PageFaultReason` shape (the file-backed-vs-anonymous
//! split, and decoding a page fault's error code into a reason), reworked
//! against `spec.md` §4.H: a page here is one of three states (`UNALLOC`,
//! `ALLOC`, `FILE`) rather than a loader trait object, because eviction
//! needs to rewrite a page's state in place (ALLOC -> swapped-out ALLOC,
//! FILE -> unmapped FILE) in a way a one-shot `load()` callback can't
//! express.

use crate::fs::swap::{SlotId, Swap};
use crate::vm::frame::{FrameTable, Owner};
use crate::vm::mmu::AddressSpace;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use keos::KernelError;
use keos::addressing::{Kva, Va};
use keos::sync::SpinLock;

const PAGE_SIZE: usize = 0x1000;

/// A source of bytes for a file-backed page: the executable being run, or
/// a file `mmap`'d into the address space. Implemented by whatever concrete
/// file object `process::external::Loader`/the `mmap` syscall hand in —
/// this module never names `fs::inode::Inode` directly so that a mapped
/// file and an mmap'd file can share the exact same plumbing.
pub trait BackingFile: Send + Sync {
    /// A value distinguishing this file from every other one backing a
    /// page, used as the first half of the (identity, offset) sharing key
    /// for read-only executable pages.
    fn identity(&self) -> u64;
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read (short on a hole or EOF).
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;
    /// Writes `buf` at `offset`, growing the file if needed.
    fn write_at(&self, buf: &[u8], offset: usize) -> usize;
}

/// How a page's contents are supplied the first time it's faulted in.
pub enum Backing {
    /// Zero-filled, never backed by a file (stack pages, `sbrk`-style heap).
    Anon,
    /// A segment of the process's own executable: read-only once loaded
    /// unless `writable`, and eligible for cross-process frame sharing
    /// when it is not.
    Executable {
        file: Arc<dyn BackingFile>,
        identity: u64,
        offset: usize,
        read_bytes: usize,
        writable: bool,
    },
    /// An `mmap`'d file region.
    Mapped {
        file: Arc<dyn BackingFile>,
        identity: u64,
        offset: usize,
        writable: bool,
    },
}

/// Current residency of a supplemental page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    /// Never allocated, or evicted back to its original zero/file state.
    Unalloc,
    /// Resident in a frame, or swapped out to a slot awaiting fault-in.
    Alloc,
    /// A `Mapped` page that is either resident or not yet read in.
    File,
}

/// One process's metadata for one user page: how to populate it, and
/// where its contents currently live (nowhere, a frame, or a swap slot).
pub struct Page {
    process: u64,
    user_base: Va,
    kind: SpinLock<Kind>,
    backing: Backing,
    frame: SpinLock<Option<(super::frame::FrameId, Kva)>>,
    slot: SpinLock<Option<SlotId>>,
}

impl Page {
    /// Whether this page is a resident, read-only, file-backed page
    /// matching `(identity, offset)` — the only case `vm::frame` is
    /// allowed to let a new owner share without re-reading the file.
    pub(super) fn is_shareable_readonly(&self, identity: u64, offset: usize) -> bool {
        let writable = match &self.backing {
            Backing::Executable { writable, .. } => *writable,
            Backing::Mapped { writable, .. } => *writable,
            Backing::Anon => return false,
        };
        if writable {
            return false;
        }
        let (id, off) = match &self.backing {
            Backing::Executable { identity, offset, .. } => (*identity, *offset),
            Backing::Mapped { identity, offset, .. } => (*identity, *offset),
            Backing::Anon => unreachable!(),
        };
        let guard = self.frame.lock();
        let resident = guard.is_some();
        guard.unlock();
        id == identity && off == offset && resident
    }

    pub(super) fn clear_frame(&self) {
        let mut guard = self.frame.lock();
        *guard = None;
        guard.unlock();
    }

    fn set_frame(&self, frame: Option<(super::frame::FrameId, Kva)>) {
        let mut guard = self.frame.lock();
        *guard = frame;
        guard.unlock();
    }

    fn set_kind(&self, kind: Kind) {
        let mut guard = self.kind.lock();
        *guard = kind;
        guard.unlock();
    }

    fn take_slot(&self) -> Option<SlotId> {
        let mut guard = self.slot.lock();
        let slot = guard.take();
        guard.unlock();
        slot
    }

    fn set_slot(&self, slot: Option<SlotId>) {
        let mut guard = self.slot.lock();
        *guard = slot;
        guard.unlock();
    }

    fn user_page(&self) -> Va {
        self.user_base
    }

    /// Whether a write to this page is permitted once it's resident —
    /// used by [`keos::task::Task::access_ok`] to reject a write through a
    /// read-only executable mapping.
    pub(crate) fn is_writable(&self) -> bool {
        match &self.backing {
            Backing::Anon => true,
            Backing::Executable { writable, .. } => *writable,
            Backing::Mapped { writable, .. } => *writable,
        }
    }
}

/// The process-wide supplemental page table. Kept behind a single lock:
/// cross-process frame sharing requires searching every process's entries,
/// not just the faulting one's (`spec.md` §5).
pub struct SupplementalTable {
    pages: SpinLock<BTreeMap<(u64, usize), Arc<Page>>>,
}

impl Default for SupplementalTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SupplementalTable {
    pub fn new() -> Self {
        Self {
            pages: SpinLock::new(BTreeMap::new()),
        }
    }

    fn key(process: u64, va: Va) -> (u64, usize) {
        (process, va.page_down().into_usize())
    }

    /// Registers `user_page` for `process` with the given backing, without
    /// populating a frame. The page becomes `Unalloc` (anonymous/executable)
    /// or `File` (mmap'd) until the first fault.
    pub fn lazy_load(&self, process: u64, user_page: Va, backing: Backing) -> Arc<Page> {
        let kind = match backing {
            Backing::Mapped { .. } => Kind::File,
            _ => Kind::Unalloc,
        };
        let page = Arc::new(Page {
            process,
            user_base: user_page.page_down(),
            kind: SpinLock::new(kind),
            backing,
            frame: SpinLock::new(None),
            slot: SpinLock::new(None),
        });
        let mut pages = self.pages.lock();
        pages.insert(Self::key(process, user_page), page.clone());
        pages.unlock();
        page
    }

    /// Registers and immediately resolves a fresh, zero-filled anonymous
    /// page — the user-stack growth path (`spec.md` §4.H's `STACK_MAX`
    /// rule lives in `process::lifecycle`, which decides whether to call
    /// this at all).
    pub fn full_load_stack(
        &self,
        frames: &FrameTable,
        swap: &Swap,
        addr_space: Arc<dyn AddressSpace>,
        process: u64,
        user_page: Va,
    ) -> Result<(), KernelError> {
        self.lazy_load(process, user_page, Backing::Anon);
        self.full_load(frames, swap, addr_space, process, user_page)
    }

    /// Looks up the supplemental page covering `addr`, if any is
    /// registered for `process`.
    pub fn lookup(&self, process: u64, addr: Va) -> Option<Arc<Page>> {
        let pages = self.pages.lock();
        let found = pages.get(&Self::key(process, addr)).cloned();
        pages.unlock();
        found
    }

    /// Kernel-virtual address of `addr`'s backing frame, if `process` has
    /// one registered and it is currently resident. Used to populate a
    /// freshly loaded page (e.g. the initial user stack) directly, before
    /// the owning thread exists to route the write through its own
    /// [`keos::task::Task::access_ok`].
    pub fn kva_of(&self, process: u64, addr: Va) -> Option<Kva> {
        let page = self.lookup(process, addr)?;
        let guard = page.frame.lock();
        let kva = guard.map(|(_, kva)| kva);
        guard.unlock();
        kva
    }

    /// Fault-in: resolves `addr`'s page fault by allocating (or sharing,
    /// or swapping back in) a frame and installing it in `addr_space`.
    /// Returns `KernelError::BadAddress` if no supplemental page is
    /// registered for `addr` — the caller kills the faulting thread, per
    /// `keos::task::Task::page_fault`'s default behavior for user faults.
    pub fn full_load(
        &self,
        frames: &FrameTable,
        swap: &Swap,
        addr_space: Arc<dyn AddressSpace>,
        process: u64,
        addr: Va,
    ) -> Result<(), KernelError> {
        let page = self.lookup(process, addr).ok_or(KernelError::BadAddress)?;
        let upage = page.user_page();
        let guard = page.kind.lock();
        let kind = *guard;
        guard.unlock();
        match kind {
            Kind::Unalloc => self.resolve_unalloc(frames, swap, &page, &addr_space, upage),
            Kind::File => self.resolve_file(frames, swap, &page, &addr_space, upage),
            Kind::Alloc => self.resolve_swapped(frames, swap, &page, &addr_space, upage),
        }
    }

    fn resolve_unalloc(
        &self,
        frames: &FrameTable,
        swap: &Swap,
        page: &Arc<Page>,
        addr_space: &Arc<dyn AddressSpace>,
        upage: Va,
    ) -> Result<(), KernelError> {
        if let Backing::Executable {
            identity,
            offset,
            writable: false,
            ..
        } = &page.backing
        {
            if let Some(shared) = frames.find_shared(*identity, *offset) {
                frames.set_pinned(shared, true);
                let kva = frames.kva_of(shared);
                addr_space.install_page(upage, kva, false);
                frames.share(
                    shared,
                    Owner {
                        addr_space: addr_space.clone(),
                        user_page: upage,
                        page: page.clone(),
                    },
                );
                page.set_frame(Some((shared, kva)));
                page.set_kind(Kind::Alloc);
                frames.set_pinned(shared, false);
                return Ok(());
            }
        }

        let owner = Owner {
            addr_space: addr_space.clone(),
            user_page: upage,
            page: page.clone(),
        };
        let (id, kva) = frames.alloc(swap, owner, true);
        let buf = frame_bytes_mut(kva);
        buf.fill(0);
        let writable = match &page.backing {
            Backing::Anon => true,
            Backing::Executable {
                file,
                offset,
                read_bytes,
                writable,
                ..
            } => {
                file.read_at(&mut buf[..*read_bytes], *offset);
                *writable
            }
            Backing::Mapped { .. } => unreachable!("Mapped pages start as Kind::File"),
        };
        addr_space.install_page(upage, kva, writable);
        page.set_frame(Some((id, kva)));
        page.set_kind(Kind::Alloc);
        frames.set_pinned(id, false);
        Ok(())
    }

    fn resolve_file(
        &self,
        frames: &FrameTable,
        swap: &Swap,
        page: &Arc<Page>,
        addr_space: &Arc<dyn AddressSpace>,
        upage: Va,
    ) -> Result<(), KernelError> {
        let (file, offset, writable) = match &page.backing {
            Backing::Mapped {
                file,
                offset,
                writable,
                ..
            } => (file, *offset, *writable),
            _ => unreachable!("Kind::File pages are always Mapped"),
        };
        let owner = Owner {
            addr_space: addr_space.clone(),
            user_page: upage,
            page: page.clone(),
        };
        let (id, kva) = frames.alloc(swap, owner, true);
        let buf = frame_bytes_mut(kva);
        buf.fill(0);
        file.read_at(buf, offset);
        addr_space.install_page(upage, kva, writable);
        page.set_frame(Some((id, kva)));
        frames.set_pinned(id, false);
        Ok(())
    }

    fn resolve_swapped(
        &self,
        frames: &FrameTable,
        swap: &Swap,
        page: &Arc<Page>,
        addr_space: &Arc<dyn AddressSpace>,
        upage: Va,
    ) -> Result<(), KernelError> {
        let slot = page.take_slot().ok_or(KernelError::FilesystemCorrupted(
            "supplemental page marked Alloc with no frame or slot",
        ))?;
        let owner = Owner {
            addr_space: addr_space.clone(),
            user_page: upage,
            page: page.clone(),
        };
        let (id, kva) = frames.alloc(swap, owner, true);
        let buf = frame_bytes_mut(kva);
        swap.swap_in(slot, buf);
        addr_space.install_page(upage, kva, true);
        addr_space.set_dirty(upage, true);
        page.set_frame(Some((id, kva)));
        frames.set_pinned(id, false);
        Ok(())
    }

    /// Tears down `page`: pins and removes its frame if resident (writing
    /// back a dirty `Mapped` page synchronously — the resolved Open
    /// Question on `munmap`/exit semantics), or discards its swap slot if
    /// it was evicted. Used by both `munmap` and whole-process teardown.
    pub fn free(&self, frames: &FrameTable, swap: &Swap, page: &Arc<Page>) {
        let guard = page.frame.lock();
        let frame = *guard;
        guard.unlock();
        if let Some((id, kva)) = frame {
            frames.set_pinned(id, true);
            let dirty = {
                // Best effort: a page about to be torn down has no further
                // owners to consult for the dirty bit through `AddressSpace`,
                // so a writable `Mapped` page is always flushed on teardown.
                matches!(&page.backing, Backing::Mapped { writable: true, .. })
            };
            let buf = frame_bytes_mut(kva);
            persist_evicted(page, buf, dirty, swap);
            frames.remove(id, page);
        } else if let Some(slot) = page.take_slot() {
            let mut scratch = [0u8; PAGE_SIZE];
            swap.swap_in(slot, &mut scratch);
        }
        let mut pages = self.pages.lock();
        pages.remove(&Self::key(page.process, page.user_base));
        pages.unlock();
    }
}

fn frame_bytes_mut(kva: Kva) -> &'static mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(kva.into_usize() as *mut u8, PAGE_SIZE) }
}

/// Persists a victim frame's contents before it's unmapped and freed.
/// `ALLOC` pages go to swap if dirty, else are simply demoted back to
/// `Unalloc` (they're reconstructible: zero-fill or re-read the
/// executable). `FILE` pages are written back to their backing file if
/// dirty, and otherwise just drop their frame — the file itself already
/// holds the page's last-written contents. Called by `vm::frame`'s
/// eviction sweep with the frame table's own lock already released.
pub(super) fn persist_evicted(page: &Arc<Page>, frame_bytes: &[u8], dirty: bool, swap: &Swap) {
    let guard = page.kind.lock();
    let kind = *guard;
    guard.unlock();
    match kind {
        Kind::Alloc => {
            if dirty {
                let slot = swap.swap_out(frame_bytes);
                page.set_slot(Some(slot));
            } else {
                page.set_kind(Kind::Unalloc);
            }
        }
        Kind::File => {
            if dirty {
                if let Backing::Mapped { file, offset, .. } = &page.backing {
                    file.write_at(frame_bytes, *offset);
                }
            }
        }
        Kind::Unalloc => unreachable!("an Unalloc page never holds a frame"),
    }
}
