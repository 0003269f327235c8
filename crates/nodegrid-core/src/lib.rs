//! nodegrid-core — shared data model and configuration.
//!
//! Every other nodegrid crate speaks in these types: the demand side
//! (`WorkloadRequest`, `PlacementConstraints`), the policy side
//! (`Provisioner`, `DisruptionBudget`), the supply side (`InstanceShape`)
//! and the `ResourceVector` arithmetic that ties them together.

pub mod config;
pub mod resources;
pub mod types;

pub use config::{ConfigError, ConfigResult, NodegridConfig};
pub use resources::ResourceVector;
pub use types::*;
