//! The user-program loader and system-call dispatch trampoline, named only
//! by interface.
//!
//! Per `spec.md` §1, parsing an ELF binary and trampolining into/out of a
//! system call are out of scope for this crate — the same way
//! `keos-project1`'s `syscall::SyscallAbi` and `keos::task::Task` are
//! consumed, not reimplemented, by every downstream `keos-projectN`. The
//! pieces that *are* in scope (argv marshalling, the fd table, the
//! exit-data arena, the wait/exec handshake in [`super::lifecycle`]) are
//! built entirely against these two trait objects.

use crate::vm::supplemental::BackingFile;
use alloc::sync::Arc;
use alloc::vec::Vec;
use keos::addressing::Va;
use keos::KernelError;

/// One loadable segment of a parsed executable: a range of the backing
/// file to map into the new address space, read-only unless `writable`.
pub struct Segment {
    pub file: Arc<dyn BackingFile>,
    pub va: Va,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}

/// The result of successfully parsing an executable: where to start
/// execution, and the segments to register as lazily-loaded supplemental
/// pages.
pub struct LoadedImage {
    pub entry: Va,
    pub segments: Vec<Segment>,
}

/// Parses an executable file into a [`LoadedImage`]. Implemented by the
/// ELF-loading layer this crate does not provide.
pub trait Loader: Send + Sync {
    /// Opens and validates `path`, returning its entry point and segment
    /// table. `KernelError::NoExec` on a malformed or unrecognized binary.
    fn load(&self, path: &str) -> Result<LoadedImage, KernelError>;

    /// Builds a register frame for `entry`/`sp` and drops to ring 3,
    /// never returning. The privileged trampoline (`iret` and friends) is
    /// out of scope for this crate, same as parsing the binary itself.
    fn enter(&self, entry: Va, sp: Va) -> !;
}

/// The system-call dispatch trampoline. Implemented by whatever owns the
/// concrete `keos::task::Task::syscall` handler for this crate's process
/// model; this crate only ever calls through the trait.
pub trait Dispatcher: Send + Sync {
    /// Executes syscall number `sysno` with up to six register arguments,
    /// returning the value (or error) to place back in `%rax`.
    fn dispatch(&mut self, sysno: usize, args: [usize; 6]) -> Result<usize, KernelError>;
}
