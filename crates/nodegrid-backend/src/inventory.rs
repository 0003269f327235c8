//! Fixed pool of pre-provisioned machines.
//!
//! "Launching" claims a free machine of the requested type in the
//! requested zone; "terminating" returns it to the pool. Each machine
//! type is offered as a shape for as long as at least one machine of that
//! type is free.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use nodegrid_core::InstanceShape;
use nodegrid_core::config::MachineSpec;

use crate::CapacityBackend;
use crate::error::{BackendError, BackendResult};
use crate::types::{InstanceHandle, InstanceStatus, LaunchRequest, ShapeQuery};

struct Allocation {
    provisioner: String,
    launched_at: u64,
}

pub struct InventoryBackend {
    machines: Vec<MachineSpec>,
    /// Allocated machine ids.
    allocations: Mutex<BTreeMap<String, Allocation>>,
}

impl InventoryBackend {
    pub fn new(machines: Vec<MachineSpec>) -> Self {
        Self {
            machines,
            allocations: Mutex::new(BTreeMap::new()),
        }
    }

    fn handle(machine: &MachineSpec, allocation: &Allocation) -> InstanceHandle {
        InstanceHandle {
            id: machine.id.clone(),
            instance_type: machine.instance_type.clone(),
            zone: machine.zone.clone(),
            price: machine.cost,
            provisioner: allocation.provisioner.clone(),
            launched_at: allocation.launched_at,
        }
    }
}

#[async_trait]
impl CapacityBackend for InventoryBackend {
    fn name(&self) -> &str {
        "inventory"
    }

    async fn describe_shapes(&self, query: &ShapeQuery) -> BackendResult<Vec<InstanceShape>> {
        let allocations = self.allocations.lock().await;
        let mut shapes: BTreeMap<&str, InstanceShape> = BTreeMap::new();
        for machine in &self.machines {
            if allocations.contains_key(&machine.id)
                || !query.matches_type(&machine.instance_type)
                || !query.matches_zone(&machine.zone)
            {
                continue;
            }
            let shape = shapes
                .entry(machine.instance_type.as_str())
                .or_insert_with(|| InstanceShape {
                    name: machine.instance_type.clone(),
                    capacity: machine.capacity.clone(),
                    cost: machine.cost,
                    zones: Vec::new(),
                });
            if !shape.zones.contains(&machine.zone) {
                shape.zones.push(machine.zone.clone());
            }
        }
        let mut shapes: Vec<InstanceShape> = shapes.into_values().collect();
        shapes.sort_by(|a, b| a.cost.total_cmp(&b.cost));
        Ok(shapes)
    }

    async fn launch(&self, request: &LaunchRequest) -> BackendResult<InstanceHandle> {
        if !self
            .machines
            .iter()
            .any(|m| m.instance_type == request.instance_type)
        {
            return Err(BackendError::Invalid(format!(
                "no machines of type {}",
                request.instance_type
            )));
        }
        let mut allocations = self.allocations.lock().await;
        let machine = self
            .machines
            .iter()
            .find(|m| {
                m.instance_type == request.instance_type
                    && m.zone == request.zone
                    && !allocations.contains_key(&m.id)
            })
            .ok_or_else(|| {
                BackendError::Capacity(format!(
                    "no free {} machine in {}",
                    request.instance_type, request.zone
                ))
            })?;
        let allocation = Allocation {
            provisioner: request.provisioner.clone(),
            launched_at: epoch_secs(),
        };
        let handle = Self::handle(machine, &allocation);
        allocations.insert(machine.id.clone(), allocation);
        info!(machine = %machine.id, zone = %machine.zone, "machine allocated");
        Ok(handle)
    }

    async fn terminate(&self, instance_id: &str) -> BackendResult<()> {
        if !self.machines.iter().any(|m| m.id == instance_id) {
            return Err(BackendError::NotFound(instance_id.to_string()));
        }
        if self.allocations.lock().await.remove(instance_id).is_some() {
            info!(machine = %instance_id, "machine released");
        }
        Ok(())
    }

    async fn describe_instance(&self, instance_id: &str) -> BackendResult<InstanceStatus> {
        if !self.machines.iter().any(|m| m.id == instance_id) {
            return Ok(InstanceStatus::NotFound);
        }
        let allocations = self.allocations.lock().await;
        Ok(if allocations.contains_key(instance_id) {
            InstanceStatus::Running
        } else {
            InstanceStatus::Terminated
        })
    }

    async fn list_instances(&self, provisioner: &str) -> BackendResult<Vec<InstanceHandle>> {
        let allocations = self.allocations.lock().await;
        Ok(self
            .machines
            .iter()
            .filter_map(|m| {
                allocations
                    .get(&m.id)
                    .filter(|a| a.provisioner == provisioner)
                    .map(|a| Self::handle(m, a))
            })
            .collect())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_core::ResourceVector;

    fn machine(id: &str, zone: &str) -> MachineSpec {
        MachineSpec {
            id: id.to_string(),
            instance_type: "metal".to_string(),
            zone: zone.to_string(),
            capacity: ResourceVector::from_cores(32, 128),
            cost: 1.0,
        }
    }

    fn request(zone: &str) -> LaunchRequest {
        LaunchRequest {
            instance_type: "metal".to_string(),
            zone: zone.to_string(),
            provisioner: "onprem".to_string(),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn pool_exhaustion_is_a_capacity_error() {
        let backend = InventoryBackend::new(vec![machine("m1", "dc1"), machine("m2", "dc2")]);
        let first = backend.launch(&request("dc1")).await.unwrap();
        assert_eq!(first.id, "m1");

        let err = backend.launch(&request("dc1")).await.unwrap_err();
        assert!(matches!(err, BackendError::Capacity(_)));

        let shapes = backend.describe_shapes(&ShapeQuery::default()).await.unwrap();
        assert_eq!(shapes[0].zones, vec!["dc2".to_string()]);
    }

    #[tokio::test]
    async fn terminate_returns_machine_to_pool() {
        let backend = InventoryBackend::new(vec![machine("m1", "dc1")]);
        backend.launch(&request("dc1")).await.unwrap();
        assert_eq!(backend.list_instances("onprem").await.unwrap().len(), 1);

        backend.terminate("m1").await.unwrap();
        backend.terminate("m1").await.unwrap();
        assert_eq!(
            backend.describe_instance("m1").await.unwrap(),
            InstanceStatus::Terminated
        );
        assert!(backend.launch(&request("dc1")).await.is_ok());
        assert!(matches!(
            backend.terminate("m9").await.unwrap_err(),
            BackendError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn unknown_type_is_invalid() {
        let backend = InventoryBackend::new(vec![machine("m1", "dc1")]);
        let mut req = request("dc1");
        req.instance_type = "gpu".to_string();
        assert!(matches!(
            backend.launch(&req).await.unwrap_err(),
            BackendError::Invalid(_)
        ));
    }
}
