//! Process lifecycle: fd table, exit-data arena, and the external
//! collaborators (loader, dispatcher) that drive `exec`/`wait`/exit.
//!
//! Grounded on `keos-project1::file_struct` (fd table shape) and
//! `keos-project5`'s thread-per-process model (`spec.md` §4.I: a "process"
//! is one kernel thread, not a separate scheduling entity), reworked
//! against the process-wide fd table and tid-keyed exit-data arena this
//! crate's `spec.md` specifies instead of project1's per-process
//! `BTreeMap`.

pub mod exit_table;
pub mod external;
pub mod fdtable;
pub mod lifecycle;
