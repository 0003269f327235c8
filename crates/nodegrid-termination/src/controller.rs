//! Termination controller, keyed by node id.
//!
//! Every call re-reads the node and continues from whatever phase it is
//! in, so invoking it again after partial progress (or after the node is
//! gone) is safe and never issues a second terminate for a finished node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use nodegrid_backend::BackendError;
use nodegrid_core::NodeId;
use nodegrid_runtime::{Action, Backoff, ControllerContext, ControllerResult, Reconciler};
use nodegrid_state::{Node, NodeState};

use crate::evictor::{Eviction, Evictor};

pub const DRAIN_TIMED_OUT: &str = "DrainTimedOut";

/// Where a node stands after one termination step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationStep {
    /// Not in the registry; nothing to do.
    Gone,
    /// Not marked for removal.
    NotMarked,
    /// Workloads remain; evictions will be retried.
    Draining { remaining: usize },
    /// Drain timeout passed without `force`; still retrying.
    DrainTimedOut { remaining: usize },
    /// Terminate issued but the backend has not confirmed yet.
    AwaitingTermination,
    /// Backend confirmed; registry entry removed.
    Removed,
}

pub struct TerminationController {
    ctx: ControllerContext,
    evictor: Arc<dyn Evictor>,
    drain_backoff: Backoff,
    terminate_backoff: Backoff,
    /// Consecutive unproductive steps per node, for backoff.
    attempts: Mutex<HashMap<NodeId, u32>>,
}

impl TerminationController {
    pub fn new(ctx: ControllerContext, evictor: Arc<dyn Evictor>) -> Self {
        let settings = &ctx.config.termination;
        let drain_backoff = Backoff::new(settings.eviction_backoff_base, settings.eviction_backoff_max);
        let terminate_backoff =
            Backoff::new(settings.terminate_backoff_base, settings.terminate_backoff_max);
        Self {
            ctx,
            evictor,
            drain_backoff,
            terminate_backoff,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Advance one node through drain and teardown as far as possible.
    pub async fn terminate_node(&self, id: &str) -> ControllerResult<TerminationStep> {
        let Some(node) = self.ctx.registry.get(id)? else {
            debug!(node = %id, "node already removed");
            return Ok(TerminationStep::Gone);
        };
        match node.state {
            NodeState::Pending | NodeState::Ready => Ok(TerminationStep::NotMarked),
            NodeState::Draining => self.drain(node).await,
            NodeState::Terminating => self.teardown(node).await,
            NodeState::Terminated => self.retire(&node.id),
        }
    }

    async fn drain(&self, node: Node) -> ControllerResult<TerminationStep> {
        let ctx = &self.ctx;
        let settings = &ctx.config.termination;
        let now = ctx.now();

        let mut remaining = 0;
        for request in node.bound.values() {
            match self.evictor.evict(&node, request).await? {
                Eviction::Confirmed => {
                    ctx.registry.release_to_pending(&node.id, &request.id, now)?;
                    debug!(node = %node.id, request = %request.id, "workload evicted");
                }
                Eviction::Refused(reason) => {
                    debug!(node = %node.id, request = %request.id, %reason, "eviction deferred");
                    remaining += 1;
                }
            }
        }

        let started = node.drain_started_at.unwrap_or(now);
        let timed_out = now.saturating_sub(started) >= settings.drain_timeout.as_secs();
        if remaining > 0 && !(timed_out && settings.force) {
            if timed_out {
                ctx.set_condition(
                    "Node",
                    &node.id,
                    DRAIN_TIMED_OUT,
                    "EvictionBlocked",
                    format!("{remaining} workloads could not be evicted"),
                )?;
                warn!(node = %node.id, remaining, "drain timed out, waiting for evictions");
                return Ok(TerminationStep::DrainTimedOut { remaining });
            }
            return Ok(TerminationStep::Draining { remaining });
        }

        if remaining > 0 {
            warn!(node = %node.id, remaining, "drain timed out, forcing termination");
            if let Some(fresh) = ctx.registry.get(&node.id)? {
                for request_id in fresh.bound.keys() {
                    ctx.registry.release_to_pending(&fresh.id, request_id, now)?;
                }
            }
        }
        ctx.clear_condition("Node", &node.id, DRAIN_TIMED_OUT)?;
        let node = ctx
            .registry
            .transition(&node.id, NodeState::Draining, NodeState::Terminating, now)?;
        self.reset(&node.id);
        self.teardown(node).await
    }

    async fn teardown(&self, node: Node) -> ControllerResult<TerminationStep> {
        let ctx = &self.ctx;
        let backend = &ctx.backend;

        let mut status = backend.describe_instance(&node.instance_id).await?;
        if !status.is_gone() {
            match backend.terminate(&node.instance_id).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => {
                    warn!(node = %node.id, instance = %node.instance_id, error = %e, "terminate failed");
                    ctx.registry.record_removal_failure(&node.id, ctx.now())?;
                    return Err(e.into());
                }
            }
            status = backend.describe_instance(&node.instance_id).await?;
        }
        // A shutting-down instance still holds capacity; keep the finalizer.
        if !status.is_terminated() {
            debug!(node = %node.id, ?status, "waiting for backend to confirm termination");
            return Ok(TerminationStep::AwaitingTermination);
        }

        ctx.registry
            .transition(&node.id, NodeState::Terminating, NodeState::Terminated, ctx.now())?;
        self.retire(&node.id)
    }

    fn retire(&self, id: &str) -> ControllerResult<TerminationStep> {
        self.ctx.registry.remove(id)?;
        self.reset(id);
        info!(node = %id, "node terminated and removed");
        Ok(TerminationStep::Removed)
    }

    fn next_delay(&self, id: &str, backoff: &Backoff) -> std::time::Duration {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = attempts.entry(id.to_string()).or_insert(0);
        let delay = backoff.delay(*attempt);
        *attempt = attempt.saturating_add(1);
        delay
    }

    fn reset(&self, id: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

#[async_trait]
impl Reconciler for TerminationController {
    type Key = NodeId;

    fn name(&self) -> &'static str {
        "termination"
    }

    async fn reconcile(&self, key: &NodeId) -> ControllerResult<Action> {
        Ok(match self.terminate_node(key).await? {
            TerminationStep::Gone | TerminationStep::NotMarked | TerminationStep::Removed => {
                Action::Done
            }
            TerminationStep::Draining { .. } | TerminationStep::DrainTimedOut { .. } => {
                Action::Requeue(self.next_delay(key, &self.drain_backoff))
            }
            TerminationStep::AwaitingTermination => {
                Action::Requeue(self.next_delay(key, &self.terminate_backoff))
            }
        })
    }

    fn resync_keys(&self) -> ControllerResult<Vec<NodeId>> {
        Ok(self
            .ctx
            .registry
            .list(|n| {
                matches!(
                    n.state,
                    NodeState::Draining | NodeState::Terminating | NodeState::Terminated
                )
            })?
            .into_iter()
            .map(|n| n.id)
            .collect())
    }
}
