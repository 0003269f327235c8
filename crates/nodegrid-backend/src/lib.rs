//! nodegrid-backend — the capacity backend capability set.
//!
//! A `CapacityBackend` is the external system that actually creates and
//! destroys compute instances. The controllers only ever talk to the
//! trait; which implementation runs is decided once at startup from the
//! `[backend]` config section.
//!
//! - `FakeBackend`: in-process simulated cloud with scriptable failures.
//! - `InventoryBackend`: fixed pool of pre-provisioned machines.

pub mod error;
pub mod fake;
pub mod inventory;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

use nodegrid_core::InstanceShape;
use nodegrid_core::config::BackendConfig;

pub use error::{BackendError, BackendResult};
pub use fake::FakeBackend;
pub use inventory::InventoryBackend;
pub use types::{InstanceHandle, InstanceStatus, LaunchRequest, ShapeQuery};

/// Capability set every capacity backend implements.
#[async_trait]
pub trait CapacityBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Shapes currently offered that satisfy the query, cheapest first.
    async fn describe_shapes(&self, query: &ShapeQuery) -> BackendResult<Vec<InstanceShape>>;

    /// Launch one instance of a shape in a zone.
    async fn launch(&self, request: &LaunchRequest) -> BackendResult<InstanceHandle>;

    /// Terminate an instance.
    ///
    /// Terminating an already-terminated instance succeeds; an id the
    /// backend never issued fails with [`BackendError::NotFound`].
    async fn terminate(&self, instance_id: &str) -> BackendResult<()>;

    /// Current status of an instance.
    async fn describe_instance(&self, instance_id: &str) -> BackendResult<InstanceStatus>;

    /// Live instances tagged with a provisioner.
    async fn list_instances(&self, provisioner: &str) -> BackendResult<Vec<InstanceHandle>>;
}

/// Build the backend selected by configuration.
pub fn from_config(config: &BackendConfig) -> Arc<dyn CapacityBackend> {
    match config {
        BackendConfig::Fake { shapes } => Arc::new(FakeBackend::new(shapes.clone())),
        BackendConfig::Inventory { machines } => Arc::new(InventoryBackend::new(machines.clone())),
    }
}
