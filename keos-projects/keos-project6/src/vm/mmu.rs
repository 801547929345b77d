//! The MMU / page-directory shim, named only by interface.
//!
//! Installing a page-table entry, walking the accessed/dirty bits, and
//! tearing down a page directory are all per-architecture operations that
//! belong to the page-table project layer, not here. `vm::frame` and
//! `vm::supplemental` only ever need the narrow slice of that machinery
//! listed below, so it is captured as a trait rather than re-implemented.

use alloc::sync::Arc;
use keos::addressing::{Kva, Va};

/// A process's page directory, as seen by the VM subsystem.
///
/// Implemented by the page-table project layer; `vm::frame`'s eviction
/// sweep and `vm::supplemental`'s fault-in path drive a process's address
/// space purely through this trait.
pub trait AddressSpace: Send + Sync {
    /// Installs a mapping from `upage` to the frame at `kva`, replacing
    /// any prior mapping. `writable` controls the page's write permission.
    fn install_page(&self, upage: Va, kva: Kva, writable: bool);

    /// Clears any mapping at `upage`, invalidating the TLB entry for it.
    fn clear_page(&self, upage: Va);

    /// Reads the hardware-accessed bit for `upage`.
    fn is_accessed(&self, upage: Va) -> bool;
    /// Sets (or clears) the hardware-accessed bit for `upage`.
    fn set_accessed(&self, upage: Va, value: bool);

    /// Reads the hardware-dirty bit for `upage`.
    fn is_dirty(&self, upage: Va) -> bool;
    /// Sets (or clears) the hardware-dirty bit for `upage`.
    fn set_dirty(&self, upage: Va, value: bool);

    /// Returns the frame currently mapped at `upage`, if any.
    fn get_page(&self, upage: Va) -> Option<Kva>;

    /// Installs this address space as the one active on the current core.
    fn activate(&self);
}

/// Creates address spaces and knows how to activate the kernel's own.
///
/// One instance lives for the life of the kernel; `process::lifecycle`
/// calls it once per `exec` and once more on every `process_exit`.
pub trait AddressSpaceFactory: Send + Sync {
    /// Builds a fresh, empty address space for a newly exec'd process.
    fn create(&self) -> Arc<dyn AddressSpace>;
    /// Switches the current core back onto the kernel's own page directory.
    fn activate_kernel(&self);
}
