//! nodegrid-termination — drain and tear down nodes marked for removal.
//!
//! A node moves through a two-phase removal:
//!
//! ```text
//! Draining ──(all workloads evicted, or timeout + force)──▶ Terminating
//! Terminating ──(backend confirms the instance is gone)──▶ Terminated ──▶ removed
//! ```
//!
//! The termination finalizer on the node is released only on reaching
//! Terminated, so the registry refuses to forget a node whose instance may
//! still be running.

pub mod controller;
pub mod evictor;

pub use controller::{DRAIN_TIMED_OUT, TerminationController, TerminationStep};
pub use evictor::{BudgetedEvictor, Eviction, Evictor};
