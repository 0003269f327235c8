//! Workload eviction under disruption budgets.

use async_trait::async_trait;
use tracing::debug;

use nodegrid_core::WorkloadRequest;
use nodegrid_runtime::ControllerResult;
use nodegrid_state::{Node, NodeRegistry};

/// Answer to an eviction request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eviction {
    /// The workload may leave; the caller unbinds it.
    Confirmed,
    /// Not now; retry later.
    Refused(String),
}

/// Issues eviction requests for workloads on a draining node.
#[async_trait]
pub trait Evictor: Send + Sync {
    async fn evict(&self, node: &Node, request: &WorkloadRequest) -> ControllerResult<Eviction>;
}

/// Enforces `DisruptionBudget`s: an owner may not have more than
/// `max_unavailable` workloads unplaced at once. Owners without a budget
/// are always evictable.
pub struct BudgetedEvictor {
    registry: NodeRegistry,
}

impl BudgetedEvictor {
    pub fn new(registry: NodeRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Evictor for BudgetedEvictor {
    async fn evict(&self, node: &Node, request: &WorkloadRequest) -> ControllerResult<Eviction> {
        let Some(budget) = self.registry.get_budget(&request.owner)? else {
            return Ok(Eviction::Confirmed);
        };
        let unavailable = self
            .registry
            .list_pending()?
            .iter()
            .filter(|r| r.owner == request.owner)
            .count() as u32;
        if unavailable >= budget.max_unavailable {
            debug!(
                node = %node.id,
                request = %request.id,
                owner = %request.owner,
                unavailable,
                max_unavailable = budget.max_unavailable,
                "eviction refused by disruption budget"
            );
            return Ok(Eviction::Refused(format!(
                "{} has {unavailable}/{} workloads unavailable",
                request.owner, budget.max_unavailable
            )));
        }
        Ok(Eviction::Confirmed)
    }
}
