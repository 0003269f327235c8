//! nodegrid-allocation — turn unplaced requests into capacity.
//!
//! One reconcile pass per provisioner:
//!
//! ```text
//! lifecycle   promote Pending nodes, retire dead ones, reap orphans
//!     │
//! match       unplaced requests owned by this provisioner
//!     │
//! claim       exclude requests another pass is already working on
//!     │
//! existing    best-fit onto Pending/Ready nodes via NodeRegistry::bind
//!     │
//! batch       group the rest by compatibility class
//!     │
//! plan        first-fit-decreasing over the provisioner's offerings
//!     │
//! launch      backend launch with retry and next-cheapest fallback,
//!             then upsert the Pending node and bind its requests
//! ```

pub mod batch;
pub mod claims;
pub mod controller;
pub mod launcher;
pub mod lifecycle;

pub use batch::{batch_by_class, match_provisioner};
pub use claims::{ClaimGuard, ClaimTable};
pub use controller::{
    AllocationController, AllocationOutcome, LIMIT_EXCEEDED, NO_OFFERINGS, UNSCHEDULABLE,
};
pub use launcher::{LAUNCH_FAILED, LaunchOutcome, launch_with_fallback};
pub use lifecycle::{LifecycleOutcome, collect_orphans, promote_nodes};
