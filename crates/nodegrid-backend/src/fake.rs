//! In-process simulated cloud.
//!
//! Offers a fixed catalog of shapes, hands out sequential instance ids and
//! lets tests script failures for upcoming launch and terminate calls.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use nodegrid_core::InstanceShape;

use crate::CapacityBackend;
use crate::error::{BackendError, BackendResult};
use crate::types::{InstanceHandle, InstanceStatus, LaunchRequest, ShapeQuery};

struct FakeInstance {
    handle: InstanceHandle,
    status: InstanceStatus,
}

#[derive(Default)]
struct FakeState {
    instances: BTreeMap<String, FakeInstance>,
    next_id: u64,
    launch_failures: VecDeque<BackendError>,
    terminate_failures: VecDeque<BackendError>,
}

pub struct FakeBackend {
    shapes: Vec<InstanceShape>,
    state: Mutex<FakeState>,
    /// Status a new instance starts in.
    boot_status: InstanceStatus,
    latency: Option<Duration>,
    launch_calls: AtomicU32,
    terminate_calls: AtomicU32,
}

impl FakeBackend {
    pub fn new(shapes: Vec<InstanceShape>) -> Self {
        Self {
            shapes,
            state: Mutex::new(FakeState::default()),
            boot_status: InstanceStatus::Running,
            latency: None,
            launch_calls: AtomicU32::new(0),
            terminate_calls: AtomicU32::new(0),
        }
    }

    /// New instances report `Pending` until `set_status` moves them on.
    pub fn with_slow_boot(mut self) -> Self {
        self.boot_status = InstanceStatus::Pending;
        self
    }

    /// Sleep this long inside every launch and terminate call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` launch calls with `error`.
    pub async fn fail_next_launches(&self, count: usize, error: BackendError) {
        let mut state = self.state.lock().await;
        state
            .launch_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Fail the next `count` terminate calls with `error`.
    pub async fn fail_next_terminates(&self, count: usize, error: BackendError) {
        let mut state = self.state.lock().await;
        state
            .terminate_failures
            .extend(std::iter::repeat_n(error, count));
    }

    pub async fn set_status(&self, instance_id: &str, status: InstanceStatus) {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.status = status;
        }
    }

    /// Register an instance the controller never launched (e.g. after a
    /// crash between launch and registry update).
    pub async fn inject_instance(&self, handle: InstanceHandle) {
        let mut state = self.state.lock().await;
        state.instances.insert(
            handle.id.clone(),
            FakeInstance {
                handle,
                status: InstanceStatus::Running,
            },
        );
    }

    /// Instances that are not terminated.
    pub async fn live_instances(&self) -> Vec<InstanceHandle> {
        let state = self.state.lock().await;
        state
            .instances
            .values()
            .filter(|i| !i.status.is_gone())
            .map(|i| i.handle.clone())
            .collect()
    }

    pub fn launch_calls(&self) -> u32 {
        self.launch_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u32 {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl CapacityBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn describe_shapes(&self, query: &ShapeQuery) -> BackendResult<Vec<InstanceShape>> {
        let mut shapes: Vec<InstanceShape> = self
            .shapes
            .iter()
            .filter(|s| query.matches_type(&s.name))
            .filter_map(|s| {
                let zones: Vec<String> = s
                    .zones
                    .iter()
                    .filter(|z| query.matches_zone(z))
                    .cloned()
                    .collect();
                (!zones.is_empty()).then(|| InstanceShape {
                    zones,
                    ..s.clone()
                })
            })
            .collect();
        shapes.sort_by(|a, b| a.cost.total_cmp(&b.cost));
        Ok(shapes)
    }

    async fn launch(&self, request: &LaunchRequest) -> BackendResult<InstanceHandle> {
        self.launch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if let Some(error) = state.launch_failures.pop_front() {
            debug!(shape = %request.instance_type, zone = %request.zone, %error, "scripted launch failure");
            return Err(error);
        }
        let shape = self
            .shapes
            .iter()
            .find(|s| s.name == request.instance_type)
            .ok_or_else(|| BackendError::Invalid(format!("unknown shape {}", request.instance_type)))?;
        if !shape.zones.iter().any(|z| *z == request.zone) {
            return Err(BackendError::Invalid(format!(
                "shape {} not offered in {}",
                shape.name, request.zone
            )));
        }

        state.next_id += 1;
        let handle = InstanceHandle {
            id: format!("fake-{:04}", state.next_id),
            instance_type: shape.name.clone(),
            zone: request.zone.clone(),
            price: shape.cost,
            provisioner: request.provisioner.clone(),
            launched_at: epoch_secs(),
        };
        state.instances.insert(
            handle.id.clone(),
            FakeInstance {
                handle: handle.clone(),
                status: self.boot_status,
            },
        );
        info!(instance = %handle.id, shape = %handle.instance_type, zone = %handle.zone, "instance launched");
        Ok(handle)
    }

    async fn terminate(&self, instance_id: &str) -> BackendResult<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if let Some(error) = state.terminate_failures.pop_front() {
            return Err(error);
        }
        match state.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.status = InstanceStatus::Terminated;
                info!(instance = %instance_id, "instance terminated");
                Ok(())
            }
            None => Err(BackendError::NotFound(instance_id.to_string())),
        }
    }

    async fn describe_instance(&self, instance_id: &str) -> BackendResult<InstanceStatus> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .get(instance_id)
            .map_or(InstanceStatus::NotFound, |i| i.status))
    }

    async fn list_instances(&self, provisioner: &str) -> BackendResult<Vec<InstanceHandle>> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .values()
            .filter(|i| i.handle.provisioner == provisioner && !i.status.is_gone())
            .map(|i| i.handle.clone())
            .collect())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
