//! nodegrid-packing — bin-packing shared by allocation and consolidation.
//!
//! Pure functions over in-memory bins; nothing here touches the registry
//! or the backend. Allocation uses it to place requests on existing nodes
//! and to plan new capacity. Consolidation uses the same routines to prove
//! that a node's workloads fit elsewhere before marking it for removal.
//!
//! # Components
//!
//! - **`scorer`** — Bins and best-fit scoring (remaining capacity, affinity)
//! - **`packer`** — First-fit-decreasing planning over offerings, placement onto existing bins
//! - **`convert`** — Registry nodes to bins, provisioners and shapes to offerings

pub mod convert;
pub mod packer;
pub mod scorer;

pub use convert::{node_to_bin, offerings_for};
pub use packer::{
    CapacityPlan, Offering, PlacedOn, PlannedNode, Placement, place_on_existing, plan_new_capacity, simulate_removal,
    sort_decreasing, sort_offerings,
};
pub use scorer::{Bin, BinScore, ScoreBreakdown, ScoringWeights, rank_bins, score_bin};
