//! Tests for the process-wide file-descriptor table and the parent/child
//! exit-data arena.
//!
//! Shares [`crate::fs_tests`]'s scratch-filesystem recipe so fd table tests
//! exercise real inodes rather than a fake file object.

use alloc::sync::Arc;
use keos::fs::Disk;
use keos_project6::fs::cache::Cache;
use keos_project6::fs::freemap::FreeMap;
use keos_project6::fs::inode::OpenInodes;
use keos_project6::fs::ROOT_SECTOR;
use keos_project6::process::fdtable::{FdTable, Kind};

fn fresh_fs(disk_index: usize) -> (Cache, FreeMap) {
    let cache = Cache::new(Disk::new(disk_index));
    let freemap = FreeMap::format(512);
    freemap.flush(&cache);
    (cache, freemap)
}

pub fn install_read_write_seek_roundtrip() {
    let (cache, freemap) = fresh_fs(40);
    let open_inodes = OpenInodes::new();
    let sector = freemap.allocate(1).unwrap();
    open_inodes
        .create(&cache, &freemap, sector, 0, false, ROOT_SECTOR)
        .unwrap();
    let inode = open_inodes.open(&cache, sector);

    let table = FdTable::new();
    let fd = table.install(1, Kind::File { inode, pos: 0 }).unwrap();
    assert!(fd >= 2, "fds 0 and 1 are reserved for stdio");

    let n = table.write(&cache, &freemap, 1, fd, b"hello world").unwrap();
    assert_eq!(n, 11);
    assert_eq!(table.tell(1, fd).unwrap(), 11);
    assert_eq!(table.filesize(1, fd).unwrap(), 11);

    table.seek(1, fd, 0).unwrap();
    let mut buf = [0u8; 11];
    let n = table.read(&cache, 1, fd, &mut buf).unwrap();
    assert_eq!(n, 11);
    assert_eq!(&buf, b"hello world");
    assert!(!table.is_dir(1, fd).unwrap());

    let inode = table.close(1, fd).unwrap();
    open_inodes.close(&cache, &freemap, inode);
}

pub fn foreign_tid_cannot_touch_anothers_fd() {
    let (cache, freemap) = fresh_fs(41);
    let open_inodes = OpenInodes::new();
    let sector = freemap.allocate(1).unwrap();
    open_inodes
        .create(&cache, &freemap, sector, 0, false, ROOT_SECTOR)
        .unwrap();
    let inode = open_inodes.open(&cache, sector);

    let table = FdTable::new();
    let fd = table.install(1, Kind::File { inode, pos: 0 }).unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(
        table.read(&cache, 2, fd, &mut buf),
        Err(keos::KernelError::BadFileDescriptor)
    );
    assert_eq!(
        table.close(2, fd),
        Err(keos::KernelError::BadFileDescriptor)
    );

    let inode = table.close(1, fd).unwrap();
    open_inodes.close(&cache, &freemap, inode);
}

pub fn directory_fd_rejects_read_write_and_supports_readdir() {
    let (cache, freemap) = fresh_fs(42);
    let open_inodes = OpenInodes::new();

    open_inodes
        .create(&cache, &freemap, ROOT_SECTOR, 0, true, ROOT_SECTOR)
        .unwrap();
    let root = open_inodes.open(&cache, ROOT_SECTOR);
    let file_sector = freemap.allocate(1).unwrap();
    open_inodes
        .create(&cache, &freemap, file_sector, 0, false, ROOT_SECTOR)
        .unwrap();
    keos_project6::fs::dir::add(&root, &cache, &freemap, "a.txt", file_sector).unwrap();

    let table = FdTable::new();
    let fd = table
        .install(
            1,
            Kind::Dir {
                inode: root.clone(),
                cursor: keos_project6::fs::dir::ReadDirCursor::new(),
            },
        )
        .unwrap();

    assert_eq!(table.filesize(1, fd), Err(keos::KernelError::IsDirectory));
    assert!(table.is_dir(1, fd).unwrap());

    let mut name = alloc::vec::Vec::new();
    assert!(table.readdir(&cache, 1, fd, &mut name).unwrap());
    assert_eq!(name, b"a.txt");
    assert!(!table.readdir(&cache, 1, fd, &mut name).unwrap());

    let inode = table.close(1, fd).unwrap();
    open_inodes.close(&cache, &freemap, inode);
}

pub fn close_all_owned_by_releases_only_matching_tid() {
    let (cache, freemap) = fresh_fs(43);
    let open_inodes = OpenInodes::new();
    let sector_a = freemap.allocate(1).unwrap();
    let sector_b = freemap.allocate(1).unwrap();
    open_inodes
        .create(&cache, &freemap, sector_a, 0, false, ROOT_SECTOR)
        .unwrap();
    open_inodes
        .create(&cache, &freemap, sector_b, 0, false, ROOT_SECTOR)
        .unwrap();
    let inode_a = open_inodes.open(&cache, sector_a);
    let inode_b = open_inodes.open(&cache, sector_b);

    let table = FdTable::new();
    let fd_a = table.install(1, Kind::File { inode: inode_a, pos: 0 }).unwrap();
    let fd_b = table.install(2, Kind::File { inode: inode_b, pos: 0 }).unwrap();

    let closed = table.close_all_owned_by(1);
    assert_eq!(closed.len(), 1);
    for inode in closed {
        open_inodes.close(&cache, &freemap, inode);
    }

    assert_eq!(
        table.read(&cache, 1, fd_a, &mut [0u8; 1]),
        Err(keos::KernelError::BadFileDescriptor),
        "fd closed by close_all_owned_by must no longer be usable"
    );
    assert!(table.tell(2, fd_b).is_ok(), "other tids' fds are untouched");

    let inode_b = table.close(2, fd_b).unwrap();
    open_inodes.close(&cache, &freemap, inode_b);
}

pub mod exit_table {
    use alloc::sync::Arc;
    use keos::thread::ThreadBuilder;
    use keos_project6::process::exit_table::ExitTable;

    pub fn parent_waits_for_child_exit_code() {
        let table = Arc::new(ExitTable::new());
        table.spawn_child(1, 2);

        let child = {
            let table = table.clone();
            ThreadBuilder::new("child").spawn(move || {
                table.post_exit(2, 7);
            })
        };
        child.join();

        let code = table.wait(1, 2).unwrap();
        assert_eq!(code, 7);
    }

    pub fn waiting_twice_on_the_same_child_fails() {
        let table = ExitTable::new();
        table.spawn_child(1, 2);
        table.post_exit(2, 0);
        assert!(table.wait(1, 2).is_ok());
        assert_eq!(table.wait(1, 2), Err(keos::KernelError::NoSuchEntry));
    }

    pub fn waiting_on_a_non_child_fails() {
        let table = ExitTable::new();
        table.spawn_child(1, 2);
        assert_eq!(table.wait(99, 2), Err(keos::KernelError::NoSuchEntry));
    }

    pub fn parent_exit_orphans_still_running_child() {
        let table = ExitTable::new();
        table.spawn_child(1, 2);
        table.reap_children_of(1);

        // The child's death is posted after the parent already reaped its
        // record; nothing observes it, and re-waiting fails cleanly.
        table.post_exit(2, 5);
        assert_eq!(table.wait(1, 2), Err(keos::KernelError::NoSuchEntry));
    }
}
