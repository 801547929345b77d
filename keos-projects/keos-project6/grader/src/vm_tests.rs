//! Tests for the frame table's clock-sweep eviction and cross-process
//! sharing, and the supplemental page table's lazy/anonymous/file-backed
//! fault-in paths.
//!
//! Driven against the [`crate::doubles::FakeAddressSpace`]/
//! [`crate::doubles::FakeBackingFile`] test doubles standing in for the
//! page-table and loader layers this crate only names by interface.

use crate::doubles::{frame_bytes, write_frame_bytes, FakeAddressSpace, FakeBackingFile};
use alloc::sync::Arc;
use keos::addressing::Va;
use keos_project6::fs::swap::Swap;
use keos_project6::vm::frame::FrameTable;
use keos_project6::vm::supplemental::{Backing, SupplementalTable};
use keos::fs::Disk;

fn va(n: usize) -> Va {
    Va::new(n * 0x1000).unwrap()
}

pub fn anon_lazy_load_then_fault_in_zero_fills() {
    let frames = FrameTable::new(8);
    let swap = Swap::new(Disk::new(30), 8);
    let table = SupplementalTable::new();
    let addr_space: Arc<dyn keos_project6::vm::mmu::AddressSpace> = FakeAddressSpace::new();

    let upage = va(0x1000);
    table.lazy_load(1, upage, Backing::Anon);
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage).unwrap();

    let kva = table.kva_of(1, upage).expect("page should be resident after full_load");
    assert_eq!(frame_bytes(kva, 16), &[0u8; 16]);
    assert_eq!(addr_space.get_page(upage), Some(kva));
}

pub fn executable_readonly_pages_share_one_frame_across_processes() {
    let frames = FrameTable::new(8);
    let swap = Swap::new(Disk::new(31), 8);
    let table = SupplementalTable::new();
    let file = FakeBackingFile::new(42, alloc::vec![7u8; 64]);

    let addr_space_a: Arc<dyn keos_project6::vm::mmu::AddressSpace> = FakeAddressSpace::new();
    let addr_space_b: Arc<dyn keos_project6::vm::mmu::AddressSpace> = FakeAddressSpace::new();
    let upage_a = va(0x2000);
    let upage_b = va(0x7000);

    table.lazy_load(
        1,
        upage_a,
        Backing::Executable {
            file: file.clone(),
            identity: 42,
            offset: 0,
            read_bytes: 32,
            writable: false,
        },
    );
    table.lazy_load(
        2,
        upage_b,
        Backing::Executable {
            file: file.clone(),
            identity: 42,
            offset: 0,
            read_bytes: 32,
            writable: false,
        },
    );

    table.full_load(&frames, &swap, addr_space_a.clone(), 1, upage_a).unwrap();
    table.full_load(&frames, &swap, addr_space_b.clone(), 2, upage_b).unwrap();

    let kva_a = addr_space_a.get_page(upage_a).unwrap();
    let kva_b = addr_space_b.get_page(upage_b).unwrap();
    assert_eq!(kva_a, kva_b, "identical read-only executable pages must share one physical frame");
}

pub fn eviction_swaps_out_dirty_anon_and_reloads_it() {
    let frames = FrameTable::new(1);
    let swap = Swap::new(Disk::new(32), 4);
    let table = SupplementalTable::new();
    let addr_space: Arc<dyn keos_project6::vm::mmu::AddressSpace> = FakeAddressSpace::new();

    let upage_a = va(0x3000);
    let upage_b = va(0x4000);

    table.lazy_load(1, upage_a, Backing::Anon);
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage_a).unwrap();
    let kva_a = table.kva_of(1, upage_a).unwrap();

    let pattern = [0x5au8; 16];
    write_frame_bytes(kva_a, &pattern);
    addr_space.set_dirty(upage_a, true);

    // The pool holds one frame; loading a second anonymous page forces A's
    // eviction, since A was never marked accessed.
    table.lazy_load(1, upage_b, Backing::Anon);
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage_b).unwrap();
    assert!(addr_space.get_page(upage_a).is_none(), "evicted page must be unmapped");

    // Faulting A back in should swap its dirty contents back in, evicting B
    // in turn since the pool is still capped at one frame.
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage_a).unwrap();
    let kva_a2 = table.kva_of(1, upage_a).unwrap();
    assert_eq!(frame_bytes(kva_a2, 16), &pattern, "swapped-out dirty page must round-trip its contents");
}

pub fn eviction_discards_clean_anon_page_without_swapping() {
    let frames = FrameTable::new(1);
    let swap = Swap::new(Disk::new(33), 4);
    let table = SupplementalTable::new();
    let addr_space: Arc<dyn keos_project6::vm::mmu::AddressSpace> = FakeAddressSpace::new();

    let upage_a = va(0x5000);
    let upage_b = va(0x6000);

    table.lazy_load(1, upage_a, Backing::Anon);
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage_a).unwrap();
    let kva_a = table.kva_of(1, upage_a).unwrap();
    write_frame_bytes(kva_a, &[0x77u8; 16]);
    // Left clean: never marked dirty.

    table.lazy_load(1, upage_b, Backing::Anon);
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage_b).unwrap();

    table.full_load(&frames, &swap, addr_space.clone(), 1, upage_a).unwrap();
    let kva_a2 = table.kva_of(1, upage_a).unwrap();
    assert_eq!(
        frame_bytes(kva_a2, 16),
        &[0u8; 16],
        "a clean anonymous page is zero-filled again, not restored, on refault"
    );
}

pub fn clock_sweep_spares_recently_accessed_frame() {
    let frames = FrameTable::new(2);
    let swap = Swap::new(Disk::new(34), 4);
    let table = SupplementalTable::new();
    let addr_space: Arc<dyn keos_project6::vm::mmu::AddressSpace> = FakeAddressSpace::new();

    let upage_a = va(0x8000);
    let upage_b = va(0x9000);
    let upage_c = va(0xa000);

    table.lazy_load(1, upage_a, Backing::Anon);
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage_a).unwrap();
    addr_space.set_accessed(upage_a, true);

    table.lazy_load(1, upage_b, Backing::Anon);
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage_b).unwrap();

    // Pool is now full (A, B). Loading C forces one eviction; the sweep
    // should spare A (accessed) and take B instead.
    table.lazy_load(1, upage_c, Backing::Anon);
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage_c).unwrap();

    assert!(addr_space.get_page(upage_a).is_some(), "an accessed frame survives one sweep");
    assert!(addr_space.get_page(upage_b).is_none(), "the unaccessed frame is the one evicted");
    assert!(addr_space.get_page(upage_c).is_some());
}

pub fn free_writes_back_dirty_mapped_page() {
    let frames = FrameTable::new(4);
    let swap = Swap::new(Disk::new(35), 4);
    let table = SupplementalTable::new();
    let addr_space: Arc<dyn keos_project6::vm::mmu::AddressSpace> = FakeAddressSpace::new();
    let file = FakeBackingFile::new(99, alloc::vec![0u8; 16]);

    let upage = va(0xb000);
    let page = table.lazy_load(
        1,
        upage,
        Backing::Mapped {
            file: file.clone(),
            identity: 99,
            offset: 0,
            writable: true,
        },
    );
    table.full_load(&frames, &swap, addr_space.clone(), 1, upage).unwrap();
    let kva = table.kva_of(1, upage).unwrap();
    write_frame_bytes(kva, &[0x42u8; 16]);

    table.free(&frames, &swap, &page);

    let mut back = [0u8; 16];
    file.read_at(&mut back, 0);
    assert_eq!(back, [0x42u8; 16], "a dirty mmap'd page is flushed back to its file on teardown");
}
