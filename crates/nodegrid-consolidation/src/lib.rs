//! nodegrid-consolidation — remove capacity that is no longer needed.
//!
//! Runs on a fixed interval, independent of allocation. Every cycle starts
//! from a fresh registry snapshot:
//!
//! 1. Ready nodes past the cool-down that are empty or below the
//!    utilization threshold become candidates.
//! 2. Nodes hosting disruption-sensitive workloads, nodes whose removal
//!    failed recently, and empty nodes still inside their provisioner's
//!    empty TTL are skipped.
//! 3. Candidates are simulated one at a time: a node is drained only if
//!    its workloads fit on the remaining Ready nodes, including capacity
//!    already claimed by earlier removals in the same cycle.
//! 4. Proven nodes move to Draining and are handed to termination.

pub mod consolidator;

pub use consolidator::{ConsolidationPlan, Consolidator, SkipReason};
