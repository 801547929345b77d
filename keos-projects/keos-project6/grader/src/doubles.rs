//! Hand-written `AddressSpace`/`BackingFile` doubles standing in for the
//! page-table and loader layers `keos-project6` names only by interface.
//!
//! Grounded on `keos-project3/src/lazy_pager.rs`'s `VmAreaStruct` shim: a
//! plain per-page map of installed frame plus accessed/dirty bits is enough
//! for `vm::frame`'s eviction sweep and `vm::supplemental`'s fault-in path
//! to run their real logic without a real page directory behind them.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use keos::addressing::{Kva, Va};
use keos::sync::SpinLock;
use keos_project6::vm::mmu::AddressSpace;
use keos_project6::vm::supplemental::BackingFile;

struct Mapping {
    kva: Kva,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A page directory double: every `install_page`/`clear_page`/bit-twiddle
/// call just edits a `BTreeMap` keyed by user page instead of real page
/// table entries.
pub struct FakeAddressSpace {
    pages: SpinLock<BTreeMap<usize, Mapping>>,
}

impl FakeAddressSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: SpinLock::new(BTreeMap::new()),
        })
    }
}

impl AddressSpace for FakeAddressSpace {
    fn install_page(&self, upage: Va, kva: Kva, writable: bool) {
        let mut pages = self.pages.lock();
        pages.insert(
            upage.into_usize(),
            Mapping {
                kva,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        pages.unlock();
    }

    fn clear_page(&self, upage: Va) {
        let mut pages = self.pages.lock();
        pages.remove(&upage.into_usize());
        pages.unlock();
    }

    fn is_accessed(&self, upage: Va) -> bool {
        let pages = self.pages.lock();
        let v = pages.get(&upage.into_usize()).map(|m| m.accessed).unwrap_or(false);
        pages.unlock();
        v
    }

    fn set_accessed(&self, upage: Va, value: bool) {
        let mut pages = self.pages.lock();
        if let Some(m) = pages.get_mut(&upage.into_usize()) {
            m.accessed = value;
        }
        pages.unlock();
    }

    fn is_dirty(&self, upage: Va) -> bool {
        let pages = self.pages.lock();
        let v = pages.get(&upage.into_usize()).map(|m| m.dirty).unwrap_or(false);
        pages.unlock();
        v
    }

    fn set_dirty(&self, upage: Va, value: bool) {
        let mut pages = self.pages.lock();
        if let Some(m) = pages.get_mut(&upage.into_usize()) {
            m.dirty = value;
        }
        pages.unlock();
    }

    fn get_page(&self, upage: Va) -> Option<Kva> {
        let pages = self.pages.lock();
        let v = pages.get(&upage.into_usize()).map(|m| m.kva);
        pages.unlock();
        v
    }

    fn activate(&self) {}
}

/// A `BackingFile` double: an in-memory byte buffer standing in for an
/// executable segment or an mmap'd file.
pub struct FakeBackingFile {
    id: u64,
    data: SpinLock<Vec<u8>>,
}

impl FakeBackingFile {
    pub fn new(id: u64, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id,
            data: SpinLock::new(data),
        })
    }
}

impl BackingFile for FakeBackingFile {
    fn identity(&self) -> u64 {
        self.id
    }

    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            data.unlock();
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        data.unlock();
        n
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.data.lock();
        if offset + buf.len() > data.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        data.unlock();
        buf.len()
    }
}

/// Reads back the live contents of a frame at `kva`, for assertions that
/// need to see past an [`AddressSpace`] double straight into physical
/// memory.
pub fn frame_bytes(kva: Kva, len: usize) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(kva.into_usize() as *const u8, len) }
}

/// Writes `src` directly into the frame at `kva`, simulating a user write
/// that a real page table would otherwise let through.
pub fn write_frame_bytes(kva: Kva, src: &[u8]) {
    let dst = unsafe { core::slice::from_raw_parts_mut(kva.into_usize() as *mut u8, src.len()) };
    dst.copy_from_slice(src);
}
