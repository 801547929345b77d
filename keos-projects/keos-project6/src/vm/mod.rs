//! Virtual memory: the physical frame table and each process's
//! supplemental page table, plus the MMU shim boundary they drive.
//!
//! Lock ordering (`spec.md` §5): a holder of the frame-table lock may
//! acquire the supplemental-table lock, never the reverse. Both
//! [`frame::FrameTable`] and [`supplemental::SupplementalTable`] only ever
//! hold their own internal lock across short, non-blocking sections —
//! eviction's write-back I/O and fault-in's file reads both run with the
//! relevant table lock released, pinning the frame in question first.

pub mod frame;
pub mod mmu;
pub mod supplemental;
