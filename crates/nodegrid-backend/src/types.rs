//! Request and response types of the backend capability set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Filter for `describe_shapes`. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeQuery {
    pub instance_types: Vec<String>,
    pub zones: Vec<String>,
}

impl ShapeQuery {
    pub fn matches_type(&self, name: &str) -> bool {
        self.instance_types.is_empty() || self.instance_types.iter().any(|t| t == name)
    }

    pub fn matches_zone(&self, zone: &str) -> bool {
        self.zones.is_empty() || self.zones.iter().any(|z| z == zone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub instance_type: String,
    pub zone: String,
    /// Owning provisioner; backends tag instances with it.
    pub provisioner: String,
    pub labels: BTreeMap<String, String>,
}

/// Backend-side instance identity plus shape and price metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: String,
    pub instance_type: String,
    pub zone: String,
    pub price: f64,
    pub provisioner: String,
    pub launched_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    NotFound,
}

impl InstanceStatus {
    /// The instance is gone or on its way out.
    pub fn is_gone(self) -> bool {
        matches!(
            self,
            InstanceStatus::ShuttingDown | InstanceStatus::Terminated | InstanceStatus::NotFound
        )
    }

    /// The backend confirms the instance no longer exists.
    pub fn is_terminated(self) -> bool {
        matches!(self, InstanceStatus::Terminated | InstanceStatus::NotFound)
    }
}
