//! # Project 6: The User-Process Subsystem
//!
//! Project 6 pulls together every synchronization primitive, buffered
//! file-system layer, and virtual-memory structure built across the earlier
//! projects into a single `exec`/page-fault/`exit` loop: a `Task` whose
//! `syscall` handler is just a trampoline into whatever [`process::external::
//! Dispatcher`] the embedder supplies, and whose `page_fault` handler
//! resolves a fault through [`vm::supplemental::SupplementalTable`] or grows
//! the user stack, killing the thread only when neither applies.
//!
//! ## Project Outline
//!
//! - [`sync`]: Priority-donating mutex, condition variable, semaphore, and
//!   reader/writer lock.
//! - [`fs`]: Sector cache, free-sector bitmap, inode store, directory
//!   layer, and swap device.
//! - [`vm`]: Frame table (clock eviction, cross-process sharing) and
//!   supplemental page table (lazy/anonymous/file-backed residency).
//! - [`process`]: `exec`/`wait`/`process_exit`, the fd table, and the
//!   parent/child exit-data arena.
//!
//! Parsing an executable, installing a page-table entry, and trampolining a
//! raw syscall into/out of ring 3 are all named only by interface
//! (`process::external::{Loader, Dispatcher}`, `vm::mmu::{AddressSpace,
//! AddressSpaceFactory}`) — they are supplied by whoever embeds this crate,
//! not implemented here.

#![no_std]
#![no_main]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[allow(unused_imports)]
#[macro_use]
extern crate keos;

pub mod fs;
pub mod process;
pub mod sync;
pub mod vm;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ops::Range;
use keos::addressing::Va;
use keos::syscall::Registers;
use keos::task::{PFErrorCode, Task};
use process::external::Dispatcher;
use process::lifecycle::{Process, Resources};

/// The process-specific half of a [`Thread`]'s attached `Task`: everything
/// `syscall`/`access_ok`/`page_fault` need once a real process has been
/// `exec`'d. Split out from `Thread` itself so the test-harness thread
/// `TestDriver` spawns (which never runs user code) can use `Thread::default`
/// without fabricating a real [`Process`]/[`Resources`] pair.
pub struct Inner {
    pub process: Arc<Process>,
    pub resources: Arc<Resources>,
    pub dispatcher: Box<dyn Dispatcher>,
}

/// One user process's thread of execution, as seen by the scheduler: a
/// `keos::thread::Thread`'s attached `Task`. Grounded on
/// `keos-project5::process::Thread`'s one-thread-is-one-process model: the
/// fields here are exactly what [`process::lifecycle::execute`] hands to
/// `ThreadBuilder::attach_task` when it spawns a new process. `inner` is
/// `None` only for the placeholder task `TestDriver` attaches to a test's
/// own thread, which drives the library's module tests directly rather than
/// through a live process's syscall/page-fault path.
pub struct Thread {
    pub tid: u64,
    pub inner: Option<Inner>,
}

impl Default for Thread {
    fn default() -> Self {
        Thread {
            tid: 0,
            inner: None,
        }
    }
}

impl Thread {
    /// Builds the `Task` a freshly `exec`'d process attaches to.
    pub fn new(tid: u64, process: Arc<Process>, resources: Arc<Resources>, dispatcher: Box<dyn Dispatcher>) -> Self {
        Thread {
            tid,
            inner: Some(Inner {
                process,
                resources,
                dispatcher,
            }),
        }
    }
}

impl Task for Thread {
    /// Extracts the syscall number and up to six arguments from the x86_64
    /// `syscall` ABI (`%rax`, then `%rdi`/`%rsi`/`%rdx`/`%r10`/`%r8`/`%r9`)
    /// and hands them to the embedder's [`Dispatcher`], writing its result
    /// (or [`keos::KernelError::into_usize`]) back into `%rax`.
    fn syscall(&mut self, registers: &mut Registers) {
        let Some(inner) = self.inner.as_mut() else {
            registers.gprs.rax = keos::KernelError::InvalidArgument.into_usize();
            return;
        };
        let sysno = registers.gprs.rax;
        let args = [
            registers.gprs.rdi,
            registers.gprs.rsi,
            registers.gprs.rdx,
            registers.gprs.r10,
            registers.gprs.r8,
            registers.gprs.r9,
        ];
        let result = inner.dispatcher.dispatch(sysno, args);
        registers.gprs.rax = match result {
            Ok(v) => v,
            Err(e) => e.into_usize(),
        };
    }

    /// A range is accessible only if every page it spans is registered in
    /// this process's supplemental page table, and (for a write) writable.
    fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        let Some(inner) = self.inner.as_ref() else {
            return false;
        };
        if addr.start.into_usize() == 0 || addr.start >= addr.end {
            return false;
        }
        let mut page = addr.start.page_down();
        loop {
            match inner.resources.supplemental.lookup(self.tid, page) {
                Some(p) if !is_write || p.is_writable() => {}
                _ => return false,
            }
            let next = match Va::new(page.into_usize() + 0x1000) {
                Some(v) => v,
                None => return false,
            };
            if next >= addr.end {
                return true;
            }
            page = next;
        }
    }

    /// Resolves a page fault through the supplemental page table if `cr2`
    /// names a registered page, else tries to grow the user stack by one
    /// page; kills the thread if neither applies (`spec.md` §4.H).
    fn page_fault(&mut self, ec: PFErrorCode, cr2: Va) {
        let Some(inner) = self.inner.as_ref() else {
            keos::thread::kill_current_thread();
            return;
        };
        if ec.contains(PFErrorCode::PRESENT) {
            // A protection violation (e.g. a write through a read-only
            // mapping) this crate does not resolve.
            keos::thread::kill_current_thread();
        }

        let fault_page = cr2.page_down();
        if inner
            .resources
            .supplemental
            .lookup(self.tid, fault_page)
            .is_some()
        {
            let ok = inner
                .resources
                .supplemental
                .full_load(
                    &inner.resources.frames,
                    &inner.resources.swap,
                    inner.process.addr_space.clone(),
                    self.tid,
                    fault_page,
                )
                .is_ok();
            if ok {
                return;
            }
            keos::thread::kill_current_thread();
        }

        if process::lifecycle::grow_stack(&inner.resources, &inner.process, fault_page) {
            return;
        }
        keos::thread::kill_current_thread();
    }
}
