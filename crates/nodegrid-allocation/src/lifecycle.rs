//! Node lifecycle checks against the backend.
//!
//! Registry and backend are reconciled against each other on every pass
//! instead of being committed atomically:
//!
//! - a Pending node whose instance reports `Running` is promoted to Ready;
//! - a Pending node whose instance vanished, or that never came up within
//!   the registration TTL, is retired to Terminating and its requests go
//!   back to the unplaced set;
//! - a backend instance tagged with a provisioner but unknown to the
//!   registry past the orphan grace period is terminated.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use nodegrid_backend::InstanceStatus;
use nodegrid_core::NodeId;
use nodegrid_runtime::{ControllerContext, ControllerResult};
use nodegrid_state::NodeState;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleOutcome {
    pub promoted: Vec<NodeId>,
    /// Nodes moved to Terminating; the termination controller takes over.
    pub retired: Vec<NodeId>,
    /// Nodes still waiting for their instance.
    pub waiting: Vec<NodeId>,
}

/// Check every Pending node of a provisioner against its instance.
pub async fn promote_nodes(ctx: &ControllerContext, provisioner: &str) -> ControllerResult<LifecycleOutcome> {
    let now = ctx.now();
    let ttl = ctx.config.controller.registration_ttl.as_secs();
    let pending = ctx
        .registry
        .list(|n| n.provisioner == provisioner && n.state == NodeState::Pending)?;

    let mut outcome = LifecycleOutcome::default();
    for node in pending {
        let status = ctx.backend.describe_instance(&node.instance_id).await?;
        match status {
            InstanceStatus::Running => {
                ctx.registry
                    .transition(&node.id, NodeState::Pending, NodeState::Ready, now)?;
                info!(node = %node.id, provisioner, "node ready");
                outcome.promoted.push(node.id);
            }
            status if status.is_gone() || node.age(now) > ttl => {
                warn!(
                    node = %node.id,
                    provisioner,
                    ?status,
                    age_secs = node.age(now),
                    "node never registered, retiring"
                );
                ctx.registry
                    .transition(&node.id, NodeState::Pending, NodeState::Terminating, now)?;
                for request_id in node.bound.keys() {
                    ctx.registry.release_to_pending(&node.id, request_id, now)?;
                }
                outcome.retired.push(node.id);
            }
            _ => {
                debug!(node = %node.id, ?status, "instance still booting");
                outcome.waiting.push(node.id);
            }
        }
    }
    Ok(outcome)
}

/// Terminate backend instances of a provisioner the registry does not track.
pub async fn collect_orphans(ctx: &ControllerContext, provisioner: &str) -> ControllerResult<Vec<String>> {
    let now = ctx.now();
    let grace = ctx.config.allocation.orphan_grace.as_secs();
    let known: BTreeSet<String> = ctx
        .registry
        .list(|n| n.provisioner == provisioner)?
        .into_iter()
        .map(|n| n.instance_id)
        .collect();

    let mut terminated = Vec::new();
    for instance in ctx.backend.list_instances(provisioner).await? {
        if known.contains(&instance.id) || now.saturating_sub(instance.launched_at) <= grace {
            continue;
        }
        warn!(instance = %instance.id, provisioner, "terminating orphaned instance");
        ctx.backend.terminate(&instance.id).await?;
        terminated.push(instance.id);
    }
    Ok(terminated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nodegrid_backend::{CapacityBackend, FakeBackend, InstanceHandle, LaunchRequest};
    use nodegrid_core::{InstanceShape, NodegridConfig, OwnerRef, ResourceVector, WorkloadRequest};
    use nodegrid_runtime::Clock;
    use nodegrid_state::{Node, NodeRegistry};

    fn backend() -> Arc<FakeBackend> {
        Arc::new(
            FakeBackend::new(vec![InstanceShape {
                name: "c.4".to_string(),
                capacity: ResourceVector::from_cores(4, 16),
                cost: 0.2,
                zones: vec!["zone-a".to_string()],
            }])
            .with_slow_boot(),
        )
    }

    fn context(backend: Arc<FakeBackend>) -> ControllerContext {
        let backend: Arc<dyn CapacityBackend> = backend;
        ControllerContext::new(
            NodeRegistry::open_in_memory().unwrap(),
            backend,
            NodegridConfig::default(),
            Clock::manual(10_000),
        )
    }

    async fn launch(ctx: &ControllerContext, backend: &FakeBackend) -> Node {
        let handle = backend
            .launch(&LaunchRequest {
                instance_type: "c.4".to_string(),
                zone: "zone-a".to_string(),
                provisioner: "default".to_string(),
                labels: Default::default(),
            })
            .await
            .unwrap();
        let node = Node::new(
            &handle.id,
            "default",
            "c.4",
            "zone-a",
            ResourceVector::from_cores(4, 16),
            ctx.now(),
        );
        ctx.registry.upsert(&node).unwrap()
    }

    #[tokio::test]
    async fn running_instance_promotes_node() {
        let backend = backend();
        let ctx = context(Arc::clone(&backend));
        let node = launch(&ctx, &backend).await;

        let outcome = promote_nodes(&ctx, "default").await.unwrap();
        assert_eq!(outcome.waiting, vec![node.id.clone()]);

        backend.set_status(&node.id, InstanceStatus::Running).await;
        let outcome = promote_nodes(&ctx, "default").await.unwrap();
        assert_eq!(outcome.promoted, vec![node.id.clone()]);
        let stored = ctx.registry.get(&node.id).unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Ready);
        assert_eq!(stored.ready_at, Some(10_000));
    }

    #[tokio::test]
    async fn registration_timeout_retires_and_releases() {
        let backend = backend();
        let ctx = context(Arc::clone(&backend));
        let node = launch(&ctx, &backend).await;
        let request = WorkloadRequest::new("r1", OwnerRef::new("Job", "a"), ResourceVector::from_cores(1, 1));
        ctx.registry.bind(&node.id, &request).unwrap();

        ctx.clock.advance(16 * 60);
        let outcome = promote_nodes(&ctx, "default").await.unwrap();
        assert_eq!(outcome.retired, vec![node.id.clone()]);

        let stored = ctx.registry.get(&node.id).unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Terminating);
        assert!(stored.bound.is_empty());
        assert!(ctx.registry.get_pending("r1").unwrap().is_some());
    }

    #[tokio::test]
    async fn vanished_instance_retires_node() {
        let backend = backend();
        let ctx = context(Arc::clone(&backend));
        let node = launch(&ctx, &backend).await;
        backend.set_status(&node.id, InstanceStatus::Terminated).await;

        let outcome = promote_nodes(&ctx, "default").await.unwrap();
        assert_eq!(outcome.retired, vec![node.id]);
    }

    #[tokio::test]
    async fn orphans_past_grace_are_terminated() {
        let backend = backend();
        let ctx = context(Arc::clone(&backend));
        let tracked = launch(&ctx, &backend).await;
        backend
            .inject_instance(InstanceHandle {
                id: "orphan-1".to_string(),
                instance_type: "c.4".to_string(),
                zone: "zone-a".to_string(),
                price: 0.2,
                provisioner: "default".to_string(),
                launched_at: ctx.now() - 3600,
            })
            .await;
        backend
            .inject_instance(InstanceHandle {
                id: "young-1".to_string(),
                instance_type: "c.4".to_string(),
                zone: "zone-a".to_string(),
                price: 0.2,
                provisioner: "default".to_string(),
                launched_at: ctx.now() - 10,
            })
            .await;

        let terminated = collect_orphans(&ctx, "default").await.unwrap();
        assert_eq!(terminated, vec!["orphan-1".to_string()]);
        assert_eq!(
            backend.describe_instance(&tracked.id).await.unwrap(),
            InstanceStatus::Pending
        );
    }
}
