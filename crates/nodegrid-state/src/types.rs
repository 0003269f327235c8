//! Registry-owned domain types.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use nodegrid_core::{NodeId, RequestId, ResourceVector, Taint, WorkloadRequest};

/// Finalizer carried by every node until its instance is confirmed gone.
pub const TERMINATION_FINALIZER: &str = "nodegrid.io/termination";

/// Node lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Pending,
    Ready,
    Draining,
    Terminating,
    Terminated,
}

impl NodeState {
    fn rank(self) -> u8 {
        match self {
            NodeState::Pending => 0,
            NodeState::Ready => 1,
            NodeState::Draining => 2,
            NodeState::Terminating => 3,
            NodeState::Terminated => 4,
        }
    }

    /// Forward moves only. Skipping states is allowed (a node that never
    /// joined goes straight from Pending to Terminating).
    pub fn can_transition_to(self, next: NodeState) -> bool {
        next.rank() > self.rank()
    }

    /// Whether the node accepts new bindings.
    pub fn is_schedulable(self) -> bool {
        matches!(self, NodeState::Pending | NodeState::Ready)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Pending => "Pending",
            NodeState::Ready => "Ready",
            NodeState::Draining => "Draining",
            NodeState::Terminating => "Terminating",
            NodeState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// One unit of launched compute capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub provisioner: String,
    pub instance_type: String,
    pub zone: String,
    /// Backend instance handle id.
    pub instance_id: String,
    pub allocatable: ResourceVector,
    /// Price per hour as reported by the backend.
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub state: NodeState,
    pub launched_at: u64,
    #[serde(default)]
    pub ready_at: Option<u64>,
    #[serde(default)]
    pub drain_started_at: Option<u64>,
    /// When the node last became empty; `None` while it hosts workloads.
    #[serde(default)]
    pub empty_since: Option<u64>,
    #[serde(default)]
    pub removal_failed_at: Option<u64>,
    #[serde(default)]
    pub bound: BTreeMap<RequestId, WorkloadRequest>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// An external removal request was received for this node.
    #[serde(default)]
    pub deletion_requested: bool,
    /// Bumped on every stored change; used for optimistic concurrency.
    #[serde(default)]
    pub generation: u64,
}

impl Node {
    /// A freshly launched Pending node.
    pub fn new(
        id: &str,
        provisioner: &str,
        instance_type: &str,
        zone: &str,
        allocatable: ResourceVector,
        launched_at: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            provisioner: provisioner.to_string(),
            instance_type: instance_type.to_string(),
            zone: zone.to_string(),
            instance_id: id.to_string(),
            allocatable,
            price: 0.0,
            labels: BTreeMap::new(),
            taints: Vec::new(),
            state: NodeState::Pending,
            launched_at,
            ready_at: None,
            drain_started_at: None,
            empty_since: Some(launched_at),
            removal_failed_at: None,
            bound: BTreeMap::new(),
            finalizers: Vec::new(),
            deletion_requested: false,
            generation: 0,
        }
    }

    /// Sum of the bound requests' resource vectors.
    pub fn requested(&self) -> ResourceVector {
        self.bound.values().map(|r| &r.resources).sum()
    }

    /// Allocatable capacity not yet claimed by bound requests.
    pub fn spare(&self) -> ResourceVector {
        self.allocatable.saturating_sub(&self.requested())
    }

    /// Highest per-dimension utilization.
    pub fn utilization(&self) -> f64 {
        self.requested().utilization(&self.allocatable)
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    pub fn hosts_disruption_sensitive(&self) -> bool {
        self.bound.values().any(|r| r.disruption_sensitive)
    }

    /// Seconds since launch, saturating at zero.
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.launched_at)
    }
}

/// Orchestrator-facing mirror of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeObject {
    pub name: NodeId,
    pub provisioner: String,
    pub state: NodeState,
    pub instance_type: String,
    pub zone: String,
    pub allocatable: ResourceVector,
    pub requested: ResourceVector,
    pub bound_count: usize,
    pub labels: BTreeMap<String, String>,
    pub finalizers: Vec<String>,
    pub deletion_requested: bool,
}

impl From<&Node> for NodeObject {
    fn from(node: &Node) -> Self {
        Self {
            name: node.id.clone(),
            provisioner: node.provisioner.clone(),
            state: node.state,
            instance_type: node.instance_type.clone(),
            zone: node.zone.clone(),
            allocatable: node.allocatable.clone(),
            requested: node.requested(),
            bound_count: node.bound.len(),
            labels: node.labels.clone(),
            finalizers: node.finalizers.clone(),
            deletion_requested: node.deletion_requested,
        }
    }
}

/// Persistent status condition attached to a provisioner, node or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Object kind: `Provisioner`, `Node` or `WorkloadRequest`.
    pub kind: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition: u64,
}

impl Condition {
    pub fn new(kind: &str, name: &str, type_: &str, reason: &str, message: String, now: u64) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            type_: type_.to_string(),
            status: true,
            reason: reason.to_string(),
            message,
            last_transition: now,
        }
    }

    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.kind, self.name, self.type_)
    }
}

/// Leader lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

/// Current wall-clock time in Unix seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_core::OwnerRef;

    #[test]
    fn transitions_only_move_forward() {
        use NodeState::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Draining));
        assert!(Pending.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));
        assert!(!Draining.can_transition_to(Ready));
        assert!(!Terminated.can_transition_to(Pending));
        assert!(!Ready.can_transition_to(Ready));
    }

    #[test]
    fn only_pending_and_ready_schedule() {
        assert!(NodeState::Pending.is_schedulable());
        assert!(NodeState::Ready.is_schedulable());
        assert!(!NodeState::Draining.is_schedulable());
        assert!(!NodeState::Terminating.is_schedulable());
    }

    #[test]
    fn node_utilization_and_spare() {
        let mut node = Node::new("n1", "default", "c.4", "zone-a", ResourceVector::from_cores(4, 8), 0);
        let req = WorkloadRequest::new("r1", OwnerRef::new("Job", "a"), ResourceVector::from_cores(1, 4));
        node.bound.insert(req.id.clone(), req);
        assert!((node.utilization() - 0.5).abs() < f64::EPSILON);
        assert_eq!(node.spare(), ResourceVector::from_cores(3, 4));

        let obj = NodeObject::from(&node);
        assert_eq!(obj.bound_count, 1);
        assert_eq!(obj.requested, ResourceVector::from_cores(1, 4));
    }

    #[test]
    fn epoch_secs_returns_reasonable_value() {
        assert!(epoch_secs() > 1_704_067_200);
    }
}
