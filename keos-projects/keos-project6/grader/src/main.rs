// This is test & bootstrap implementation.
// This file will be overwritten when grading.
#![no_std]
#![no_main]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;
extern crate keos;
extern crate keos_project6;
#[macro_use]
extern crate grading;

mod doubles;
mod fs_tests;
mod process_tests;
mod sync_tests;
mod vm_tests;

use keos::SystemConfigurationBuilder;
pub use keos_project6::Thread;
use keos_project6::sync::PriorityScheduler;

#[unsafe(no_mangle)]
pub unsafe fn main(config_builder: SystemConfigurationBuilder) {
    config_builder.set_scheduler(PriorityScheduler::new());
    keos::TestDriver::<Thread>::start([
        // Mutex.
        &sync_tests::mutex::smoke,
        &sync_tests::mutex::parking,
        &sync_tests::mutex::try_lock_fails_while_held,
        // Semaphore.
        &sync_tests::semaphore::producer_consumer,
        &sync_tests::semaphore::try_down_does_not_block,
        // Reader/writer lock.
        &sync_tests::rwlock::many_readers_concurrent,
        &sync_tests::rwlock::writer_excludes_readers,
        // Condition variable.
        &sync_tests::condvar::bounded_buffer,
        &sync_tests::condvar::broadcast_wakes_every_waiter,
        // Sector cache.
        &fs_tests::cache_read_write_roundtrip,
        &fs_tests::cache_partial_write_preserves_rest_of_sector,
        // Free-sector bitmap.
        &fs_tests::freemap_allocate_then_release,
        &fs_tests::freemap_reserves_fixed_sectors,
        // Inode.
        &fs_tests::inode_large_file_spans_direct_and_indirect_extents,
        &fs_tests::inode_read_past_eof_is_short,
        &fs_tests::inode_deny_write_blocks_writes,
        &fs_tests::open_inodes_shares_same_instance_by_sector,
        // Directory / path resolution.
        &fs_tests::directory_lifecycle,
        &fs_tests::directory_rejects_removing_root_and_nonempty_dirs,
        &fs_tests::path_resolution_walks_nested_components,
        // Swap.
        &fs_tests::swap_out_in_roundtrip,
        // Frame table / supplemental page table.
        &vm_tests::anon_lazy_load_then_fault_in_zero_fills,
        &vm_tests::executable_readonly_pages_share_one_frame_across_processes,
        &vm_tests::eviction_swaps_out_dirty_anon_and_reloads_it,
        &vm_tests::eviction_discards_clean_anon_page_without_swapping,
        &vm_tests::clock_sweep_spares_recently_accessed_frame,
        &vm_tests::free_writes_back_dirty_mapped_page,
        // File descriptor table.
        &process_tests::install_read_write_seek_roundtrip,
        &process_tests::foreign_tid_cannot_touch_anothers_fd,
        &process_tests::directory_fd_rejects_read_write_and_supports_readdir,
        &process_tests::close_all_owned_by_releases_only_matching_tid,
        // Exit-data arena.
        &process_tests::exit_table::parent_waits_for_child_exit_code,
        &process_tests::exit_table::waiting_twice_on_the_same_child_fails,
        &process_tests::exit_table::waiting_on_a_non_child_fails,
        &process_tests::exit_table::parent_exit_orphans_still_running_child,
    ]);
}

#[unsafe(no_mangle)]
pub unsafe fn ap_main() {}
