//! Allocation controller.
//!
//! Keyed by provisioner name. Each pass recomputes everything from the
//! registry and the backend, so a pass interrupted after a launch but
//! before the registry update is repaired by the next one (the orphaned
//! instance is reaped, the requests are still unplaced).

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use nodegrid_backend::ShapeQuery;
use nodegrid_core::{NodeId, Provisioner, RequestId, ResourceVector, WorkloadRequest};
use nodegrid_packing::{
    Bin, Offering, PlacedOn, PlannedNode, ScoringWeights, node_to_bin, offerings_for,
    place_on_existing, plan_new_capacity,
};
use nodegrid_runtime::{
    Action, ControllerContext, ControllerError, ControllerResult, Reconciler, WorkQueue,
};
use nodegrid_state::{Node, NodeState};

use crate::batch::{batch_by_class, match_provisioner};
use crate::claims::ClaimTable;
use crate::launcher::{LaunchOutcome, launch_with_fallback};
use crate::lifecycle::{LifecycleOutcome, collect_orphans, promote_nodes};

pub const UNSCHEDULABLE: &str = "Unschedulable";
pub const NO_OFFERINGS: &str = "NoOfferings";
pub const LIMIT_EXCEEDED: &str = "LimitExceeded";

/// How soon to look again while nodes are booting or work was deferred.
const FOLLOW_UP: Duration = Duration::from_secs(5);

/// What one pass did.
#[derive(Debug, Clone, Default)]
pub struct AllocationOutcome {
    pub lifecycle: LifecycleOutcome,
    pub orphans: Vec<String>,
    /// Requests bound to nodes that already existed.
    pub bound_existing: Vec<PlacedOn>,
    /// Nodes launched and registered in this pass.
    pub launched: Vec<NodeId>,
    /// Requests left unplaced (conditions record why).
    pub unplaced: Vec<RequestId>,
    /// Requests skipped because another pass holds them or a bind lost a race.
    pub deferred: Vec<RequestId>,
}

pub struct AllocationController {
    ctx: ControllerContext,
    claims: ClaimTable,
    weights: ScoringWeights,
    termination: Option<WorkQueue<NodeId>>,
}

impl AllocationController {
    pub fn new(ctx: ControllerContext) -> Self {
        let claims = ClaimTable::new(ctx.config.allocation.claim_ttl.as_secs());
        Self {
            ctx,
            claims,
            weights: ScoringWeights::default(),
            termination: None,
        }
    }

    /// Hand retired nodes straight to the termination controller.
    pub fn with_termination_queue(mut self, queue: WorkQueue<NodeId>) -> Self {
        self.termination = Some(queue);
        self
    }

    pub fn claims(&self) -> &ClaimTable {
        &self.claims
    }

    /// Run one allocation pass for a provisioner.
    ///
    /// Launch failures do not stop the pass: other planned nodes are still
    /// launched and registered, and the last failure is returned at the end.
    pub async fn reconcile_provisioner(&self, name: &str) -> ControllerResult<AllocationOutcome> {
        let ctx = &self.ctx;
        let Some(provisioner) = ctx.registry.get_provisioner(name)? else {
            debug!(provisioner = %name, "provisioner gone, nothing to do");
            return Ok(AllocationOutcome::default());
        };

        let mut outcome = AllocationOutcome {
            lifecycle: promote_nodes(ctx, name).await?,
            ..Default::default()
        };
        if let Some(queue) = &self.termination {
            for id in &outcome.lifecycle.retired {
                queue.add(id.clone());
            }
        }
        outcome.orphans = collect_orphans(ctx, name).await?;

        let now = ctx.now();
        let owned = self.owned_requests(&provisioner)?;
        let guard = self.claims.claim(owned.iter().map(|r| &r.id), now);
        let mut claimed = Vec::new();
        for request in owned {
            if !guard.holds(&request.id) {
                outcome.deferred.push(request.id);
                continue;
            }
            // Another pass may have bound it between listing and claiming.
            if let Some(fresh) = ctx.registry.get_pending(&request.id)? {
                claimed.push(fresh);
            }
        }
        if claimed.is_empty() {
            return Ok(outcome);
        }

        let remaining = self.place_on_nodes(claimed, &mut outcome)?;
        if remaining.is_empty() {
            return Ok(outcome);
        }

        let shapes = ctx
            .backend
            .describe_shapes(&ShapeQuery {
                instance_types: provisioner.instance_types.clone(),
                zones: provisioner.zones.clone(),
            })
            .await?;
        let offerings = offerings_for(&provisioner, &shapes);
        if offerings.is_empty() {
            ctx.set_condition(
                "Provisioner",
                name,
                NO_OFFERINGS,
                "EmptyCatalog",
                format!("backend {} offers no allowed shape", ctx.backend.name()),
            )?;
            outcome.unplaced.extend(remaining.into_iter().map(|r| r.id));
            return Ok(outcome);
        }
        ctx.clear_condition("Provisioner", name, NO_OFFERINGS)?;

        let mut provisioned: ResourceVector = ctx
            .registry
            .list(|n| n.provisioner == name)?
            .iter()
            .map(|n| &n.allocatable)
            .sum();
        let mut last_error = None;

        for (class, batch) in batch_by_class(remaining) {
            let plan = plan_new_capacity(&batch, &offerings);
            debug!(
                provisioner = %name,
                %class,
                requests = batch.len(),
                nodes = plan.nodes.len(),
                cost = plan.total_cost(),
                "batch planned"
            );
            for request in &plan.unplaceable {
                ctx.set_condition(
                    "WorkloadRequest",
                    &request.id,
                    UNSCHEDULABLE,
                    "NoFittingShape",
                    format!("no shape allowed by provisioner {name} can host {}", request.resources),
                )?;
                outcome.unplaced.push(request.id.clone());
            }

            for planned in plan.nodes {
                let within: Vec<Offering> = offerings
                    .iter()
                    .filter(|o| within_limits(&provisioner, &provisioned, &o.capacity))
                    .cloned()
                    .collect();
                if !within.contains(&planned.offering) {
                    ctx.set_condition(
                        "Provisioner",
                        name,
                        LIMIT_EXCEEDED,
                        "CapacityLimit",
                        format!(
                            "launching {} would exceed the provisioner limit",
                            planned.offering.instance_type
                        ),
                    )?;
                    outcome
                        .unplaced
                        .extend(planned.requests.iter().map(|r| r.id.clone()));
                    continue;
                }

                match launch_with_fallback(ctx, &planned, &within).await {
                    Ok(launch) => {
                        provisioned += &launch.offering.capacity;
                        let id = self.register(&provisioner, &planned, &launch)?;
                        outcome.launched.push(id);
                    }
                    Err(e) => {
                        warn!(
                            provisioner = %name,
                            requests = planned.requests.len(),
                            error = %e,
                            "no capacity launched for planned node"
                        );
                        outcome
                            .unplaced
                            .extend(planned.requests.iter().map(|r| r.id.clone()));
                        last_error = Some(e);
                    }
                }
            }
        }
        drop(guard);

        info!(
            provisioner = %name,
            bound_existing = outcome.bound_existing.len(),
            launched = outcome.launched.len(),
            unplaced = outcome.unplaced.len(),
            "allocation pass complete"
        );
        match last_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Unplaced requests owned by this provisioner. Requests no provisioner
    /// admits get an `Unschedulable` condition.
    fn owned_requests(&self, provisioner: &Provisioner) -> ControllerResult<Vec<WorkloadRequest>> {
        let provisioners = self.ctx.registry.list_provisioners()?;
        let mut owned = Vec::new();
        for request in self.ctx.registry.list_pending()? {
            match match_provisioner(&request, &provisioners) {
                Some(p) if p.name == provisioner.name => owned.push(request),
                Some(_) => {}
                None => self.ctx.set_condition(
                    "WorkloadRequest",
                    &request.id,
                    UNSCHEDULABLE,
                    "NoProvisioner",
                    "no provisioner admits this request".to_string(),
                )?,
            }
        }
        Ok(owned)
    }

    /// Best-fit onto Pending and Ready nodes. Returns what is left.
    fn place_on_nodes(
        &self,
        requests: Vec<WorkloadRequest>,
        outcome: &mut AllocationOutcome,
    ) -> ControllerResult<Vec<WorkloadRequest>> {
        let registry = &self.ctx.registry;
        let mut bins: Vec<Bin> = registry
            .list(|n| n.state.is_schedulable() && !n.deletion_requested)?
            .iter()
            .map(node_to_bin)
            .collect();
        if bins.is_empty() {
            return Ok(requests);
        }

        let placement = place_on_existing(&requests, &mut bins, &self.weights);
        for placed in placement.placed {
            let Some(request) = requests.iter().find(|r| r.id == placed.request) else {
                continue;
            };
            match registry.bind(&placed.bin, request) {
                Ok(_) => {
                    self.ctx
                        .clear_condition("WorkloadRequest", &request.id, UNSCHEDULABLE)?;
                    outcome.bound_existing.push(placed);
                }
                Err(e) => match ControllerError::from(e) {
                    ControllerError::Conflict(msg) => {
                        debug!(request = %request.id, node = %placed.bin, reason = %msg, "bind lost a race");
                        outcome.deferred.push(request.id.clone());
                    }
                    other => return Err(other),
                },
            }
        }
        Ok(placement.unplaced)
    }

    /// Record a launched instance as a Pending node and bind its requests.
    fn register(
        &self,
        provisioner: &Provisioner,
        planned: &PlannedNode,
        launch: &LaunchOutcome,
    ) -> ControllerResult<NodeId> {
        let handle = &launch.handle;
        let mut node = Node::new(
            &handle.id,
            &provisioner.name,
            &handle.instance_type,
            &handle.zone,
            launch.offering.capacity.clone(),
            self.ctx.now(),
        );
        node.instance_id = handle.id.clone();
        node.price = handle.price;
        node.labels = launch.offering.labels.clone();
        node.taints = launch.offering.taints.clone();
        let node = self.ctx.registry.upsert(&node)?;

        for request in &planned.requests {
            self.ctx.registry.bind(&node.id, request)?;
            self.ctx
                .clear_condition("WorkloadRequest", &request.id, UNSCHEDULABLE)?;
        }
        if launch.failures == 0 {
            self.ctx
                .clear_condition("Provisioner", &provisioner.name, crate::launcher::LAUNCH_FAILED)?;
        }
        Ok(node.id)
    }
}

fn within_limits(provisioner: &Provisioner, provisioned: &ResourceVector, extra: &ResourceVector) -> bool {
    provisioner
        .limits
        .as_ref()
        .is_none_or(|limits| provisioned.add(extra).fits_within(limits))
}

#[async_trait]
impl Reconciler for AllocationController {
    type Key = String;

    fn name(&self) -> &'static str {
        "allocation"
    }

    async fn reconcile(&self, key: &String) -> ControllerResult<Action> {
        let outcome = self.reconcile_provisioner(key).await?;
        let follow_up = !outcome.lifecycle.waiting.is_empty()
            || !outcome.launched.is_empty()
            || !outcome.deferred.is_empty();
        Ok(if follow_up {
            Action::Requeue(FOLLOW_UP)
        } else {
            Action::Done
        })
    }

    fn resync_keys(&self) -> ControllerResult<Vec<String>> {
        Ok(self
            .ctx
            .registry
            .list_provisioners()?
            .into_iter()
            .map(|p| p.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nodegrid_backend::{BackendError, CapacityBackend, FakeBackend};
    use nodegrid_core::{InstanceShape, NodegridConfig, OwnerRef};
    use nodegrid_runtime::Clock;
    use nodegrid_state::NodeRegistry;

    fn catalog() -> Vec<InstanceShape> {
        vec![
            InstanceShape {
                name: "c.4".to_string(),
                capacity: ResourceVector::from_cores(4, 16),
                cost: 0.2,
                zones: vec!["zone-a".to_string(), "zone-b".to_string()],
            },
            InstanceShape {
                name: "c.8".to_string(),
                capacity: ResourceVector::from_cores(8, 32),
                cost: 0.4,
                zones: vec!["zone-a".to_string(), "zone-b".to_string()],
            },
        ]
    }

    fn setup(backend: Arc<FakeBackend>) -> AllocationController {
        let mut config = NodegridConfig::default();
        config.allocation.launch_backoff_base = Duration::from_millis(1);
        config.allocation.launch_backoff_max = Duration::from_millis(2);
        let registry = NodeRegistry::open_in_memory().unwrap();
        let mut provisioner = Provisioner::new("default");
        provisioner.zones = vec!["zone-a".to_string(), "zone-b".to_string()];
        registry.put_provisioner(&provisioner).unwrap();
        let backend: Arc<dyn CapacityBackend> = backend;
        AllocationController::new(ControllerContext::new(
            registry,
            backend,
            config,
            Clock::manual(1_000),
        ))
    }

    fn req(id: &str, cores: u64) -> WorkloadRequest {
        WorkloadRequest::new(id, OwnerRef::new("ReplicaSet", "web"), ResourceVector::from_cores(cores, 1))
    }

    fn enqueue(controller: &AllocationController, requests: &[WorkloadRequest]) {
        for request in requests {
            controller.ctx.registry.enqueue_request(request).unwrap();
        }
    }

    #[tokio::test]
    async fn launches_and_binds_pending_node() {
        let backend = Arc::new(FakeBackend::new(catalog()));
        let controller = setup(Arc::clone(&backend));
        enqueue(&controller, &[req("r1", 3)]);

        let outcome = controller.reconcile_provisioner("default").await.unwrap();
        assert_eq!(outcome.launched.len(), 1);

        let node = controller.ctx.registry.get(&outcome.launched[0]).unwrap().unwrap();
        assert_eq!(node.state, NodeState::Pending);
        assert_eq!(node.instance_type, "c.4");
        assert_eq!(node.zone, "zone-a");
        assert!(node.bound.contains_key("r1"));
        assert!(controller.ctx.registry.list_pending().unwrap().is_empty());
        assert!(controller.claims().is_empty());

        // Next pass promotes it.
        let outcome = controller.reconcile_provisioner("default").await.unwrap();
        assert_eq!(outcome.lifecycle.promoted, vec![node.id]);
    }

    #[tokio::test]
    async fn existing_spare_capacity_is_used_first() {
        let backend = Arc::new(FakeBackend::new(catalog()));
        let controller = setup(Arc::clone(&backend));
        enqueue(&controller, &[req("r1", 2)]);
        controller.reconcile_provisioner("default").await.unwrap();
        assert_eq!(backend.launch_calls(), 1);

        enqueue(&controller, &[req("r2", 2)]);
        let outcome = controller.reconcile_provisioner("default").await.unwrap();
        assert_eq!(outcome.bound_existing.len(), 1);
        assert!(outcome.launched.is_empty());
        assert_eq!(backend.launch_calls(), 1);
    }

    #[tokio::test]
    async fn ten_two_core_requests_pack_tightly() {
        let backend = Arc::new(FakeBackend::new(catalog()));
        let controller = setup(Arc::clone(&backend));
        let requests: Vec<WorkloadRequest> = (0..10).map(|i| req(&format!("r{i:02}"), 2)).collect();
        enqueue(&controller, &requests);

        let outcome = controller.reconcile_provisioner("default").await.unwrap();
        assert!(outcome.unplaced.is_empty());

        let nodes = controller.ctx.registry.list(|_| true).unwrap();
        let cores: u64 = nodes.iter().map(|n| n.allocatable.cpu_millis / 1000).sum();
        assert_eq!(cores, 20);
        for node in &nodes {
            assert!(node.requested().fits_within(&node.allocatable));
            assert!(node.utilization() > 0.5);
        }
    }

    #[tokio::test]
    async fn oversized_request_is_unschedulable() {
        let backend = Arc::new(FakeBackend::new(catalog()));
        let controller = setup(backend);
        enqueue(&controller, &[req("huge", 64)]);

        let outcome = controller.reconcile_provisioner("default").await.unwrap();
        assert_eq!(outcome.unplaced, vec!["huge".to_string()]);
        let conditions = controller
            .ctx
            .registry
            .list_conditions("WorkloadRequest", "huge")
            .unwrap();
        assert_eq!(conditions[0].type_, UNSCHEDULABLE);
    }

    #[tokio::test]
    async fn limits_stop_launches() {
        let backend = Arc::new(FakeBackend::new(catalog()));
        let controller = setup(Arc::clone(&backend));
        let mut provisioner = controller.ctx.registry.get_provisioner("default").unwrap().unwrap();
        provisioner.limits = Some(ResourceVector::from_cores(4, 64));
        controller.ctx.registry.put_provisioner(&provisioner).unwrap();

        enqueue(&controller, &[req("a", 3)]);
        let outcome = controller.reconcile_provisioner("default").await.unwrap();
        assert_eq!(outcome.launched.len(), 1);

        enqueue(&controller, &[req("b", 3)]);
        let outcome = controller.reconcile_provisioner("default").await.unwrap();
        assert!(outcome.launched.is_empty());
        assert_eq!(outcome.unplaced, vec!["b".to_string()]);
        assert_eq!(backend.launch_calls(), 1);
        let conditions = controller.ctx.registry.list_conditions("Provisioner", "default").unwrap();
        assert!(conditions.iter().any(|c| c.type_ == LIMIT_EXCEEDED));
    }

    #[tokio::test]
    async fn empty_catalog_sets_condition() {
        let backend = Arc::new(FakeBackend::new(Vec::new()));
        let controller = setup(backend);
        enqueue(&controller, &[req("r1", 1)]);

        let outcome = controller.reconcile_provisioner("default").await.unwrap();
        assert_eq!(outcome.unplaced, vec!["r1".to_string()]);
        let conditions = controller.ctx.registry.list_conditions("Provisioner", "default").unwrap();
        assert_eq!(conditions[0].type_, NO_OFFERINGS);
    }

    #[tokio::test]
    async fn terminal_launch_failure_releases_claims() {
        let backend = Arc::new(FakeBackend::new(catalog()));
        backend
            .fail_next_launches(100, BackendError::Capacity("sold out".into()))
            .await;
        let controller = setup(Arc::clone(&backend));
        enqueue(&controller, &[req("r1", 1)]);

        let err = controller.reconcile_provisioner("default").await.unwrap_err();
        assert!(matches!(err, ControllerError::Capacity(_)));
        assert!(controller.claims().is_empty());
        assert!(controller.ctx.registry.get_pending("r1").unwrap().is_some());
        assert!(controller.ctx.registry.list(|_| true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_provisioner_is_a_no_op() {
        let controller = setup(Arc::new(FakeBackend::new(catalog())));
        let action = controller.reconcile(&"missing".to_string()).await.unwrap();
        assert_eq!(action, Action::Done);
    }
}
