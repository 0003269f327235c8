//! Consolidator — underutilization detection and simulated repacking.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use nodegrid_core::{NodeId, Provisioner, RequestId, WorkloadRequest};
use nodegrid_packing::{Bin, ScoringWeights, node_to_bin, simulate_removal};
use nodegrid_runtime::{ControllerContext, ControllerResult, WorkQueue};
use nodegrid_state::{Node, NodeState};

/// Why an underutilized node was not drained this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Hosts a workload that must not be disrupted.
    DisruptionSensitive,
    /// A removal attempt failed within the failure cool-down.
    RecentRemovalFailure,
    /// Empty, but not yet for the provisioner's empty TTL.
    EmptyTtl { remaining_secs: u64 },
    /// Its workloads do not fit on the remaining nodes.
    NoAlternativeCapacity,
    /// The per-cycle drain limit was reached first.
    CycleLimit,
    /// The node changed under us; retried next cycle.
    Raced(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DisruptionSensitive => write!(f, "hosts a disruption-sensitive workload"),
            SkipReason::RecentRemovalFailure => write!(f, "removal failed recently"),
            SkipReason::EmptyTtl { remaining_secs } => {
                write!(f, "empty TTL not reached ({remaining_secs}s left)")
            }
            SkipReason::NoAlternativeCapacity => write!(f, "workloads do not fit elsewhere"),
            SkipReason::CycleLimit => write!(f, "drain limit for this cycle reached"),
            SkipReason::Raced(msg) => write!(f, "raced: {msg}"),
        }
    }
}

/// Result of one consolidation cycle.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationPlan {
    /// Underutilized nodes considered this cycle, in evaluation order.
    pub candidates: Vec<NodeId>,
    /// Nodes moved to Draining.
    pub drained: Vec<NodeId>,
    pub skipped: Vec<(NodeId, SkipReason)>,
}

pub struct Consolidator {
    ctx: ControllerContext,
    weights: ScoringWeights,
    termination: Option<WorkQueue<NodeId>>,
}

impl Consolidator {
    pub fn new(ctx: ControllerContext) -> Self {
        Self {
            ctx,
            weights: ScoringWeights::default(),
            termination: None,
        }
    }

    pub fn with_termination_queue(mut self, queue: WorkQueue<NodeId>) -> Self {
        self.termination = Some(queue);
        self
    }

    /// Run one consolidation cycle.
    pub fn consolidate(&self) -> ControllerResult<ConsolidationPlan> {
        let ctx = &self.ctx;
        let settings = &ctx.config.consolidation;
        let now = ctx.now();

        let provisioners: BTreeMap<String, Provisioner> = ctx
            .registry
            .list_provisioners()?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        let ready = ctx
            .registry
            .list(|n| n.state == NodeState::Ready && !n.deletion_requested)?;

        let mut plan = ConsolidationPlan::default();
        let mut eligible: Vec<&Node> = Vec::new();
        for node in &ready {
            if node.age(now) < settings.cooldown.as_secs() {
                continue;
            }
            if !node.is_empty() && node.utilization() >= settings.utilization_threshold {
                continue;
            }
            plan.candidates.push(node.id.clone());

            if node.hosts_disruption_sensitive() {
                plan.skipped
                    .push((node.id.clone(), SkipReason::DisruptionSensitive));
                continue;
            }
            if node.removal_failed_at.is_some_and(|at| {
                now.saturating_sub(at) < settings.removal_failure_cooldown.as_secs()
            }) {
                plan.skipped
                    .push((node.id.clone(), SkipReason::RecentRemovalFailure));
                continue;
            }
            if node.is_empty()
                && let Some(remaining_secs) = empty_ttl_remaining(node, provisioners.get(&node.provisioner), now)
            {
                plan.skipped
                    .push((node.id.clone(), SkipReason::EmptyTtl { remaining_secs }));
                continue;
            }
            eligible.push(node);
        }

        // Empty nodes first, then the least utilized; cheaper removals last.
        eligible.sort_by(|a, b| {
            b.is_empty()
                .cmp(&a.is_empty())
                .then_with(|| a.utilization().total_cmp(&b.utilization()))
                .then_with(|| b.price.total_cmp(&a.price))
                .then_with(|| a.id.cmp(&b.id))
        });

        // Destinations: every Ready node still standing. Nodes proven
        // removable are taken out as the cycle proceeds, and the work they
        // shed travels with the bin it landed on.
        let mut bins: Vec<Bin> = ready.iter().map(node_to_bin).collect();
        let requests: BTreeMap<&RequestId, &WorkloadRequest> =
            ready.iter().flat_map(|n| n.bound.iter()).collect();
        for node in eligible {
            if plan.drained.len() >= settings.max_drains_per_cycle {
                plan.skipped.push((node.id.clone(), SkipReason::CycleLimit));
                continue;
            }
            let others: Vec<Bin> = bins.iter().filter(|b| b.id != node.id).cloned().collect();
            let workloads: Vec<WorkloadRequest> = bins
                .iter()
                .find(|b| b.id == node.id)
                .into_iter()
                .flat_map(|b| b.requests.iter())
                .filter_map(|id| requests.get(id).map(|r| (*r).clone()))
                .collect();
            let Some(after) = simulate_removal(&workloads, &others, &self.weights) else {
                debug!(node = %node.id, workloads = workloads.len(), "no room to repack");
                plan.skipped
                    .push((node.id.clone(), SkipReason::NoAlternativeCapacity));
                continue;
            };

            match ctx
                .registry
                .transition(&node.id, NodeState::Ready, NodeState::Draining, now)
            {
                Ok(_) => {
                    info!(
                        node = %node.id,
                        provisioner = %node.provisioner,
                        utilization = node.utilization(),
                        workloads = workloads.len(),
                        "node marked for removal"
                    );
                    bins = after;
                    plan.drained.push(node.id.clone());
                    if let Some(queue) = &self.termination {
                        queue.add(node.id.clone());
                    }
                }
                Err(e) => {
                    warn!(node = %node.id, error = %e, "could not mark node for removal");
                    ctx.registry.record_removal_failure(&node.id, now)?;
                    plan.skipped
                        .push((node.id.clone(), SkipReason::Raced(e.to_string())));
                }
            }
        }

        debug!(
            candidates = plan.candidates.len(),
            drained = plan.drained.len(),
            skipped = plan.skipped.len(),
            "consolidation cycle complete"
        );
        Ok(plan)
    }

    /// Run the consolidation loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "consolidator started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.consolidate() {
                        warn!(error = %e, "consolidation cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("consolidator shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Seconds until an empty node may be removed, `None` once it may.
fn empty_ttl_remaining(node: &Node, provisioner: Option<&Provisioner>, now: u64) -> Option<u64> {
    let ttl = provisioner?.ttl_seconds_after_empty?;
    let empty_for = now.saturating_sub(node.empty_since.unwrap_or(node.launched_at));
    (empty_for < ttl).then(|| ttl - empty_for)
}
