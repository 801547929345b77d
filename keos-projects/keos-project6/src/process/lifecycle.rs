//! `exec`/`wait`/`process_exit` orchestration, and the kernel-wide
//! singleton bag every process operates against.
//!
//! Grounded on `spec.md` §4.I's seven-step `process_exit` sequence and on
//! `keos-project5::process::Thread`'s one-thread-is-one-process model: like
//! that crate, a "process" here is a single [`keos::thread::Thread`] whose
//! [`Process`] record is reachable from its `Task` impl, not a separate
//! scheduling entity. Argv parsing, stack marshalling, and the load-complete
//! handshake are in scope; parsing the executable itself and trampolining a
//! raw syscall are not (`process::external::{Loader, Dispatcher}`).

use super::exit_table::ExitTable;
use super::external::{Dispatcher, Loader};
use super::fdtable::FdTable;
use crate::fs::cache::Cache;
use crate::fs::freemap::FreeMap;
use crate::fs::inode::{Inode, OpenInodes};
use crate::fs::swap::Swap;
use crate::fs::ROOT_SECTOR;
use crate::sync::semaphore::Semaphore;
use crate::vm::frame::FrameTable;
use crate::vm::mmu::{AddressSpace, AddressSpaceFactory};
use crate::vm::supplemental::{Backing, SupplementalTable};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use keos::KernelError;
use keos::addressing::Va;
use keos::fs::Sector;
use keos::sync::SpinLock;
use keos::thread::{Current, JoinHandle, ThreadBuilder};

/// Maximum number of whitespace-separated argv tokens `execute` will parse.
pub const ARGV_MAX: usize = 64;
/// Maximum length, in bytes, of a full command line passed to `execute`.
pub const CMDLEN_MAX: usize = 256;
/// A stack-growth fault within this many bytes below the current `esp` is
/// treated as legitimate growth rather than a bad access.
pub const STACK_MAX: usize = 32;

/// The highest page of the user address space; the initial stack page is
/// placed one page below it.
const USER_STACK_TOP: usize = 0x0000_7fff_ffff_f000;

/// The kernel-wide singleton bag: one instance per boot, passed by
/// reference into every process operation (`spec.md` §9's redesign note:
/// "process-wide objects owned by the kernel root", never a global
/// pointer).
pub struct Resources {
    pub cache: Arc<Cache>,
    pub freemap: Arc<FreeMap>,
    pub open_inodes: Arc<OpenInodes>,
    pub swap: Arc<Swap>,
    pub frames: Arc<FrameTable>,
    pub supplemental: Arc<SupplementalTable>,
    pub fdtable: Arc<FdTable>,
    pub exit_table: Arc<ExitTable>,
    pub address_spaces: Arc<dyn AddressSpaceFactory>,
    pub loader: Arc<dyn Loader>,
    pub processes: SpinLock<BTreeMap<u64, Arc<Process>>>,
}

impl Resources {
    pub fn process_of(&self, tid: u64) -> Option<Arc<Process>> {
        let processes = self.processes.lock();
        let found = processes.get(&tid).cloned();
        processes.unlock();
        found
    }
}

/// One mapped region created by `mmap`, tracked so `munmap` (and whole
/// process teardown) can tear every page of it back down together.
struct Mapping {
    pages: Vec<Va>,
}

/// Per-process state reachable from its `Task` impl: identity, address
/// space, working directory, executable handle, and outstanding `mmap`s.
pub struct Process {
    pub tid: u64,
    pub name: String,
    parent_tid: Option<u64>,
    pub cwd: SpinLock<Sector>,
    executable: Arc<Inode>,
    pub addr_space: Arc<dyn AddressSpace>,
    mappings: SpinLock<BTreeMap<usize, Mapping>>,
    next_mapping_id: SpinLock<usize>,
    pages: SpinLock<Vec<Va>>,
    /// Lowest user page currently backing the stack. A page-fault exactly
    /// one page below this, and still within [`MAX_STACK_PAGES`] of
    /// [`USER_STACK_TOP`], grows the stack downward by calling
    /// [`crate::vm::supplemental::SupplementalTable::full_load_stack`].
    stack_floor: SpinLock<Va>,
    load_done: Semaphore,
    load_ok: keos::sync::atomic::AtomicBool,
}

impl Process {
    fn register_page(&self, page: Va) {
        let mut pages = self.pages.lock();
        pages.push(page);
        pages.unlock();
    }
}

/// Cap on how far the user stack may grow downward from [`USER_STACK_TOP`],
/// in pages. `spec.md` §4.H's fault-handler stack-growth rule is stated in
/// terms of the faulting thread's live `esp`, which `keos::task::Task::
/// page_fault`'s `(ec, cr2)` signature does not expose; grown against the
/// process's own recorded stack floor instead gives the same "bounded
/// downward growth, otherwise a bad access" behavior without it.
pub const MAX_STACK_PAGES: usize = 2048;

/// Grows `process`'s stack to cover `fault_page`, if `fault_page` is exactly
/// one page below the current floor and the result stays within
/// [`MAX_STACK_PAGES`] of [`USER_STACK_TOP`]. Returns whether it did.
pub fn grow_stack(res: &Resources, process: &Process, fault_page: Va) -> bool {
    let mut floor = process.stack_floor.lock();
    let floor_addr = floor.into_usize();
    if fault_page.into_usize() + 0x1000 != floor_addr {
        floor.unlock();
        return false;
    }
    if USER_STACK_TOP - fault_page.into_usize() > MAX_STACK_PAGES * 0x1000 {
        floor.unlock();
        return false;
    }
    let ok = res
        .supplemental
        .full_load_stack(&res.frames, &res.swap, process.addr_space.clone(), process.tid, fault_page)
        .is_ok();
    if ok {
        *floor = fault_page;
    }
    floor.unlock();
    if ok {
        process.register_page(fault_page);
    }
    ok
}

/// Splits `cmdline` into at most [`ARGV_MAX`] whitespace-separated tokens.
/// `KernelError::InvalidArgument` if the line is too long or has too many
/// tokens.
fn parse_argv(cmdline: &str) -> Result<Vec<String>, KernelError> {
    if cmdline.len() > CMDLEN_MAX {
        return Err(KernelError::InvalidArgument);
    }
    let argv: Vec<String> = cmdline.split_whitespace().map(|s| s.to_string()).collect();
    if argv.is_empty() || argv.len() > ARGV_MAX {
        return Err(KernelError::InvalidArgument);
    }
    Ok(argv)
}

/// Marshals `argv` onto the freshly-loaded user stack at `stack_top`,
/// 4-byte aligned, System-V style: strings first (highest addresses), then
/// the `argv[]` pointer array, then `argc`, matching the layout
/// `start_process` hands off to `main`. Returns the resulting stack
/// pointer.
///
/// Writes go straight through the stack page's kernel-virtual address
/// rather than `keos::syscall::uaccess`: the new process's thread doesn't
/// exist yet, so there is no `Task` whose `access_ok` the uaccess layer
/// could consult, and the stack page was just faulted in on `tid`'s behalf
/// by [`SupplementalTable::full_load_stack`] a moment earlier.
fn marshal_argv(
    supplemental: &SupplementalTable,
    tid: u64,
    stack_page: Va,
    stack_top: Va,
    argv: &[String],
) -> Result<Va, KernelError> {
    let kva = supplemental
        .kva_of(tid, stack_page)
        .ok_or(KernelError::BadAddress)?;
    let page_base = stack_page.into_usize();
    let kva_base = kva.into_usize();

    let put_bytes = |sp: usize, bytes: &[u8]| -> Result<(), KernelError> {
        if sp < page_base || sp + bytes.len() > page_base + 0x1000 {
            return Err(KernelError::BadAddress);
        }
        unsafe {
            core::slice::from_raw_parts_mut((kva_base + (sp - page_base)) as *mut u8, bytes.len())
                .copy_from_slice(bytes);
        }
        Ok(())
    };
    let put_usize = |sp: usize, val: usize| -> Result<(), KernelError> {
        put_bytes(sp, &val.to_ne_bytes())
    };

    let mut sp = stack_top.into_usize();
    let mut pointers = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        let bytes = arg.as_bytes();
        sp -= bytes.len() + 1;
        put_bytes(sp, bytes)?;
        put_bytes(sp + bytes.len(), &[0u8])?;
        pointers.push(sp);
    }
    sp &= !0x3usize;
    // NULL sentinel terminating argv[].
    sp -= core::mem::size_of::<usize>();
    put_usize(sp, 0)?;
    for ptr in pointers {
        sp -= core::mem::size_of::<usize>();
        put_usize(sp, ptr)?;
    }
    let argv_base = sp;
    sp -= core::mem::size_of::<usize>();
    put_usize(sp, argv_base)?;
    sp -= core::mem::size_of::<usize>();
    put_usize(sp, argv.len())?;

    Va::new(sp).ok_or(KernelError::BadAddress)
}

/// `execute(cmdline)`: parses argv, loads the named executable's segments
/// lazily, builds the initial stack, and spawns a thread running it. Blocks
/// on the load-complete semaphore before returning, so the caller learns
/// load success/failure synchronously (`spec.md` §4.I).
pub fn execute(
    res: &Arc<Resources>,
    parent_tid: Option<u64>,
    cmdline: &str,
    make_dispatcher: impl FnOnce(u64) -> Box<dyn Dispatcher> + Send + 'static,
) -> Result<JoinHandle, KernelError> {
    let argv = parse_argv(cmdline)?;
    let image = res.loader.load(&argv[0])?;

    let parent_cwd = parent_tid
        .and_then(|tid| res.process_of(tid))
        .map(|p| *p.cwd.lock())
        .unwrap_or(ROOT_SECTOR);

    let exe_sector = crate::fs::dir::resolve(
        &res.cache,
        &res.freemap,
        &res.open_inodes,
        ROOT_SECTOR,
        parent_cwd,
        &argv[0],
    )?;
    let executable = res.open_inodes.open(&res.cache, exe_sector);
    executable.deny_write();

    let addr_space = res.address_spaces.create();

    let builder = ThreadBuilder::new(argv[0].as_str());
    let tid = builder.get_tid();
    let stack_page = Va::new(USER_STACK_TOP - 0x1000).ok_or(KernelError::BadAddress)?;

    let process = Arc::new(Process {
        tid,
        name: argv[0].clone(),
        parent_tid,
        cwd: SpinLock::new(parent_cwd),
        executable,
        addr_space: addr_space.clone(),
        mappings: SpinLock::new(BTreeMap::new()),
        next_mapping_id: SpinLock::new(0),
        pages: SpinLock::new(Vec::new()),
        stack_floor: SpinLock::new(stack_page),
        load_done: Semaphore::new(0),
        load_ok: keos::sync::atomic::AtomicBool::new(false),
    });

    {
        let mut processes = res.processes.lock();
        processes.insert(tid, process.clone());
        processes.unlock();
    }
    if let Some(parent) = parent_tid {
        res.exit_table.spawn_child(parent, tid);
    }

    for segment in image.segments {
        let backing = Backing::Executable {
            file: segment.file,
            identity: process.executable.sector().0 as u64,
            offset: segment.offset,
            read_bytes: segment.read_bytes,
            writable: segment.writable,
        };
        let mut page_addr = segment.va.page_down();
        let end = Va::new(segment.va.into_usize() + segment.read_bytes + segment.zero_bytes)
            .ok_or(KernelError::BadAddress)?;
        while page_addr < end {
            res.supplemental.lazy_load(tid, page_addr, backing_for(&backing, page_addr, &segment));
            process.register_page(page_addr);
            page_addr = Va::new(page_addr.into_usize() + 0x1000).ok_or(KernelError::BadAddress)?;
        }
    }

    res.supplemental
        .full_load_stack(&res.frames, &res.swap, addr_space.clone(), tid, stack_page)?;
    process.register_page(stack_page);

    let entry = image.entry;
    let stack_top = Va::new(USER_STACK_TOP).ok_or(KernelError::BadAddress)?;
    let argv_sp = marshal_argv(&res.supplemental, tid, stack_page, stack_top, &argv)?;

    let res2 = res.clone();
    let process2 = process.clone();
    let dispatcher = make_dispatcher(tid);
    let handle = builder.attach_task(Box::new(crate::Thread::new(
        tid,
        process.clone(),
        res.clone(),
        dispatcher,
    ))).spawn(move || {
        process2.addr_space.activate();
        let _ = &res2;
        let mut regs = keos::syscall::Registers::new();
        *regs.rip() = entry.into_usize();
        *regs.rsp() = argv_sp.into_usize();
        process2.load_ok.store(true);
        process2.load_done.up();
        regs.launch()
    });

    process.load_done.down();
    if !process.load_ok.load() {
        return Err(KernelError::NoExec);
    }
    Ok(handle)
}

fn backing_for(
    template: &Backing,
    _page_addr: Va,
    _segment: &super::external::Segment,
) -> Backing {
    match template {
        Backing::Executable {
            file,
            identity,
            offset,
            read_bytes,
            writable,
        } => Backing::Executable {
            file: file.clone(),
            identity: *identity,
            offset: *offset,
            read_bytes: *read_bytes,
            writable: *writable,
        },
        other => clone_backing(other),
    }
}

fn clone_backing(b: &Backing) -> Backing {
    match b {
        Backing::Anon => Backing::Anon,
        Backing::Executable {
            file,
            identity,
            offset,
            read_bytes,
            writable,
        } => Backing::Executable {
            file: file.clone(),
            identity: *identity,
            offset: *offset,
            read_bytes: *read_bytes,
            writable: *writable,
        },
        Backing::Mapped {
            file,
            identity,
            offset,
            writable,
        } => Backing::Mapped {
            file: file.clone(),
            identity: *identity,
            offset: *offset,
            writable: *writable,
        },
    }
}

/// `wait(tid)`: see [`ExitTable::wait`].
pub fn wait(res: &Resources, parent_tid: u64, child_tid: u64) -> Result<i32, KernelError> {
    res.exit_table.wait(parent_tid, child_tid)
}

/// `process_exit(status)`: the seven-step teardown of `spec.md` §4.I.
pub fn process_exit(res: &Resources, process: &Process, status: i32) -> ! {
    keos::info!("{}: exit({})", process.name, status);

    process.executable.allow_write();
    res.open_inodes
        .close(&res.cache, &res.freemap, process.executable.clone());

    res.exit_table.post_exit(process.tid, status);

    res.exit_table.reap_children_of(process.tid);

    {
        let mappings = process.mappings.lock();
        let ids: Vec<usize> = mappings.keys().copied().collect();
        mappings.unlock();
        for id in ids {
            let _ = munmap(res, process, id);
        }
    }
    {
        let pages = process.pages.lock();
        let all: Vec<Va> = pages.clone();
        pages.unlock();
        for page in all {
            if let Some(sup_page) = res.supplemental.lookup(process.tid, page) {
                res.supplemental.free(&res.frames, &res.swap, &sup_page);
            }
        }
    }

    res.address_spaces.activate_kernel();

    {
        let mut processes = res.processes.lock();
        processes.remove(&process.tid);
        processes.unlock();
    }

    Current::exit(status)
}

/// `mmap(fd, addr)`: registers every page of `file`'s contents at `addr` as
/// a lazily-loaded, writable-tracked [`Backing::Mapped`] region, returning
/// a mapping id for later `munmap`.
pub fn mmap(
    res: &Resources,
    process: &Process,
    file: Arc<dyn crate::vm::supplemental::BackingFile>,
    identity: u64,
    length: usize,
    addr: Va,
    writable: bool,
) -> Result<usize, KernelError> {
    if addr.into_usize() % 0x1000 != 0 || length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut pages = Vec::new();
    let mut page_addr = addr;
    let mut offset = 0usize;
    while offset < length {
        res.supplemental.lazy_load(
            process.tid,
            page_addr,
            Backing::Mapped {
                file: file.clone(),
                identity,
                offset,
                writable,
            },
        );
        pages.push(page_addr);
        process.register_page(page_addr);
        offset += 0x1000;
        page_addr =
            Va::new(page_addr.into_usize() + 0x1000).ok_or(KernelError::BadAddress)?;
    }

    let mut next_id = process.next_mapping_id.lock();
    let id = *next_id;
    *next_id += 1;
    next_id.unlock();

    let mut mappings = process.mappings.lock();
    mappings.insert(id, Mapping { pages });
    mappings.unlock();
    Ok(id)
}

/// `munmap(mapping)`: tears down every page of the mapping, flushing dirty
/// writable pages back to their file synchronously (the resolved Open
/// Question on `munmap`/exit write-back timing).
pub fn munmap(res: &Resources, process: &Process, mapping: usize) -> Result<(), KernelError> {
    let mut mappings = process.mappings.lock();
    let removed = mappings.remove(&mapping);
    mappings.unlock();
    let Mapping { pages } = removed.ok_or(KernelError::InvalidArgument)?;
    for page in pages {
        if let Some(sup_page) = res.supplemental.lookup(process.tid, page) {
            res.supplemental.free(&res.frames, &res.swap, &sup_page);
        }
    }
    Ok(())
}
