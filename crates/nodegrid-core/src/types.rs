//! Shared domain types used across nodegrid crates.
//!
//! These types are the externally supplied side of the model: workload
//! requests created by the orchestrator, provisioner policies managed by
//! operators, and instance shapes described by a capacity backend.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;

/// Unique identifier of a workload request.
pub type RequestId = String;

/// Unique identifier of a node (one launched instance).
pub type NodeId = String;

/// Well-known node labels stamped on every launched node.
pub mod well_known {
    pub const ZONE: &str = "nodegrid.io/zone";
    pub const INSTANCE_TYPE: &str = "nodegrid.io/instance-type";
    pub const PROVISIONER: &str = "nodegrid.io/provisioner";
}

// ── Taints and tolerations ────────────────────────────────────────

/// Effect of a taint on workloads that do not tolerate it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintEffect {
    #[default]
    NoSchedule,
    NoExecute,
}

/// A node taint. Workloads must tolerate every taint of a node to be bound to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub effect: TaintEffect,
}

/// A toleration. `value: None` tolerates any value of the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl Toleration {
    pub fn tolerates(&self, taint: &Taint) -> bool {
        self.key == taint.key && self.value.as_ref().is_none_or(|v| *v == taint.value)
    }
}

// ── Workload requests ─────────────────────────────────────────────

/// The external object that owns a workload (e.g. `ReplicaSet/web`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

impl OwnerRef {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Where a workload may (and would prefer to) run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementConstraints {
    /// Required zones (empty = any zone).
    #[serde(default)]
    pub zones: Vec<String>,
    /// Zones preferred during best-fit placement.
    #[serde(default)]
    pub preferred_zones: Vec<String>,
    /// Required node labels.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Node labels preferred during best-fit placement.
    #[serde(default)]
    pub preferred_labels: BTreeMap<String, String>,
    /// Taints this workload tolerates.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// Eligible instance types (empty = any shape).
    #[serde(default)]
    pub instance_types: Vec<String>,
    /// Anti-affinity group: two workloads sharing a group never share a node.
    #[serde(default)]
    pub anti_affinity: Option<String>,
}

impl PlacementConstraints {
    /// Whether a node with these labels and taints satisfies the hard constraints.
    pub fn admits(&self, labels: &BTreeMap<String, String>, taints: &[Taint]) -> bool {
        if !self.zones.is_empty()
            && !labels
                .get(well_known::ZONE)
                .is_some_and(|z| self.zones.contains(z))
        {
            return false;
        }
        if !self.instance_types.is_empty()
            && !labels
                .get(well_known::INSTANCE_TYPE)
                .is_some_and(|t| self.instance_types.contains(t))
        {
            return false;
        }
        let selector_ok = self
            .node_selector
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v));
        selector_ok && self.tolerates_all(taints)
    }

    /// Whether every taint is tolerated by at least one toleration.
    pub fn tolerates_all(&self, taints: &[Taint]) -> bool {
        taints
            .iter()
            .all(|t| self.tolerations.iter().any(|tol| tol.tolerates(t)))
    }

    /// Soft-affinity score in `0.0..=1.0`; 0.5 when nothing is preferred.
    pub fn affinity_score(&self, labels: &BTreeMap<String, String>) -> f64 {
        let total = self.preferred_labels.len() + usize::from(!self.preferred_zones.is_empty());
        if total == 0 {
            return 0.5;
        }
        let mut matched = self
            .preferred_labels
            .iter()
            .filter(|(k, v)| labels.get(*k).is_some_and(|lv| lv == *v))
            .count();
        if labels
            .get(well_known::ZONE)
            .is_some_and(|z| self.preferred_zones.contains(z))
        {
            matched += 1;
        }
        matched as f64 / total as f64
    }
}

/// A unit of demand that the orchestrator could not place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadRequest {
    pub id: RequestId,
    pub owner: OwnerRef,
    pub resources: ResourceVector,
    #[serde(default)]
    pub constraints: PlacementConstraints,
    /// Disruption-sensitive workloads pin their node against consolidation.
    #[serde(default)]
    pub disruption_sensitive: bool,
    /// Unix timestamp (seconds) when the request was created.
    #[serde(default)]
    pub created_at: u64,
}

impl WorkloadRequest {
    pub fn new(id: &str, owner: OwnerRef, resources: ResourceVector) -> Self {
        Self {
            id: id.to_string(),
            owner,
            resources,
            constraints: PlacementConstraints::default(),
            disruption_sensitive: false,
            created_at: 0,
        }
    }

    /// The batching key: requests with equal classes may share a batch.
    pub fn compatibility_class(&self) -> CompatibilityClass {
        let c = &self.constraints;
        CompatibilityClass {
            zones: c.zones.iter().cloned().collect(),
            node_selector: c.node_selector.clone(),
            tolerations: c
                .tolerations
                .iter()
                .map(|t| (t.key.clone(), t.value.clone()))
                .collect(),
            instance_types: c.instance_types.iter().cloned().collect(),
        }
    }
}

/// Identical zone, label, taint and shape-eligibility constraints.
///
/// Ordered so that batches are processed deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompatibilityClass {
    pub zones: BTreeSet<String>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: BTreeSet<(String, Option<String>)>,
    pub instance_types: BTreeSet<String>,
}

impl std::fmt::Display for CompatibilityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let zones: Vec<&str> = self.zones.iter().map(String::as_str).collect();
        let types: Vec<&str> = self.instance_types.iter().map(String::as_str).collect();
        write!(
            f,
            "zones=[{}] types=[{}] selector={} tolerations={}",
            zones.join(","),
            types.join(","),
            self.node_selector.len(),
            self.tolerations.len()
        )
    }
}

// ── Supply side ───────────────────────────────────────────────────

/// An instance shape offered by a capacity backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceShape {
    /// Instance type name (e.g. `m.large`).
    pub name: String,
    /// Allocatable capacity of one instance.
    pub capacity: ResourceVector,
    /// Price per hour.
    pub cost: f64,
    /// Zones where this shape is currently offered.
    pub zones: Vec<String>,
}

/// Operator policy governing what capacity may be launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provisioner {
    pub name: String,
    /// Allowed instance types (empty = every shape the backend offers).
    #[serde(default)]
    pub instance_types: Vec<String>,
    /// Allowed zones in preference order (empty = any zone).
    #[serde(default)]
    pub zones: Vec<String>,
    /// Per-shape cost multipliers (default 1.0).
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    /// Maximum total allocatable capacity across this provisioner's nodes.
    #[serde(default)]
    pub limits: Option<ResourceVector>,
    /// Seconds an empty node may live before it is removed.
    #[serde(default)]
    pub ttl_seconds_after_empty: Option<u64>,
    /// Labels applied to launched nodes.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Taints applied to launched nodes.
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl Provisioner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instance_types: Vec::new(),
            zones: Vec::new(),
            weights: BTreeMap::new(),
            limits: None,
            ttl_seconds_after_empty: None,
            labels: BTreeMap::new(),
            taints: Vec::new(),
        }
    }

    /// Whether nodes launched by this provisioner could host the request.
    pub fn admits(&self, request: &WorkloadRequest) -> bool {
        let c = &request.constraints;
        if !self.zones.is_empty()
            && !c.zones.is_empty()
            && !c.zones.iter().any(|z| self.zones.contains(z))
        {
            return false;
        }
        if !self.instance_types.is_empty()
            && !c.instance_types.is_empty()
            && !c.instance_types.iter().any(|t| self.instance_types.contains(t))
        {
            return false;
        }
        let selector_ok = c.node_selector.iter().all(|(k, v)| match k.as_str() {
            well_known::ZONE => self.allows_zone(v),
            well_known::INSTANCE_TYPE => self.allows_shape(v),
            well_known::PROVISIONER => *v == self.name,
            _ => self.labels.get(k).is_some_and(|lv| lv == v),
        });
        selector_ok && c.tolerates_all(&self.taints)
    }

    pub fn allows_shape(&self, shape: &str) -> bool {
        self.instance_types.is_empty() || self.instance_types.iter().any(|t| t == shape)
    }

    pub fn allows_zone(&self, zone: &str) -> bool {
        self.zones.is_empty() || self.zones.iter().any(|z| z == zone)
    }

    /// Position of a zone in the preference order, `None` if not allowed.
    pub fn zone_rank(&self, zone: &str) -> Option<usize> {
        if self.zones.is_empty() {
            return Some(0);
        }
        self.zones.iter().position(|z| z == zone)
    }

    /// Cost multiplier for a shape.
    pub fn weight(&self, shape: &str) -> f64 {
        self.weights.get(shape).copied().unwrap_or(1.0)
    }

    /// Labels stamped on a node launched with the given shape and zone.
    pub fn node_labels(&self, shape: &str, zone: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(well_known::ZONE.to_string(), zone.to_string());
        labels.insert(well_known::INSTANCE_TYPE.to_string(), shape.to_string());
        labels.insert(well_known::PROVISIONER.to_string(), self.name.clone());
        labels
    }
}

/// Externally declared disruption budget for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisruptionBudget {
    pub owner: OwnerRef,
    /// Maximum number of the owner's workloads that may be unplaced at once.
    pub max_unavailable: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> WorkloadRequest {
        WorkloadRequest::new(id, OwnerRef::new("ReplicaSet", "web"), ResourceVector::from_cores(1, 1))
    }

    fn labels(zone: &str, shape: &str) -> BTreeMap<String, String> {
        Provisioner::new("default").node_labels(shape, zone)
    }

    #[test]
    fn toleration_without_value_matches_any_value() {
        let taint = Taint {
            key: "dedicated".to_string(),
            value: "gpu".to_string(),
            effect: TaintEffect::NoSchedule,
        };
        let any = Toleration { key: "dedicated".to_string(), value: None };
        let exact = Toleration { key: "dedicated".to_string(), value: Some("gpu".to_string()) };
        let other = Toleration { key: "dedicated".to_string(), value: Some("db".to_string()) };
        assert!(any.tolerates(&taint));
        assert!(exact.tolerates(&taint));
        assert!(!other.tolerates(&taint));
    }

    #[test]
    fn constraints_check_zone_and_selector() {
        let mut req = request("r1");
        req.constraints.zones = vec!["zone-a".to_string()];
        req.constraints
            .node_selector
            .insert("team".to_string(), "search".to_string());

        let mut node = labels("zone-a", "m.large");
        assert!(!req.constraints.admits(&node, &[]));
        node.insert("team".to_string(), "search".to_string());
        assert!(req.constraints.admits(&node, &[]));
        assert!(!req.constraints.admits(&labels("zone-b", "m.large"), &[]));
    }

    #[test]
    fn untolerated_taint_rejects() {
        let req = request("r1");
        let taint = Taint {
            key: "gpu".to_string(),
            value: String::new(),
            effect: TaintEffect::NoSchedule,
        };
        assert!(!req.constraints.admits(&labels("zone-a", "m.large"), std::slice::from_ref(&taint)));
    }

    #[test]
    fn affinity_score_is_neutral_without_preferences() {
        let req = request("r1");
        assert_eq!(req.constraints.affinity_score(&labels("zone-a", "m")), 0.5);

        let mut pref = request("r2");
        pref.constraints.preferred_zones = vec!["zone-a".to_string()];
        assert_eq!(pref.constraints.affinity_score(&labels("zone-a", "m")), 1.0);
        assert_eq!(pref.constraints.affinity_score(&labels("zone-b", "m")), 0.0);
    }

    #[test]
    fn compatibility_class_ignores_soft_constraints() {
        let mut a = request("a");
        let mut b = request("b");
        a.constraints.preferred_zones = vec!["zone-a".to_string()];
        b.constraints.anti_affinity = Some("web".to_string());
        assert_eq!(a.compatibility_class(), b.compatibility_class());

        b.constraints.zones = vec!["zone-b".to_string()];
        assert_ne!(a.compatibility_class(), b.compatibility_class());
    }

    #[test]
    fn provisioner_admits_by_zone_label_and_taint() {
        let mut prov = Provisioner::new("gpu");
        prov.zones = vec!["zone-a".to_string()];
        prov.labels.insert("pool".to_string(), "gpu".to_string());
        prov.taints.push(Taint {
            key: "gpu".to_string(),
            value: String::new(),
            effect: TaintEffect::NoSchedule,
        });

        let mut req = request("r1");
        assert!(!prov.admits(&req), "taint not tolerated");

        req.constraints.tolerations.push(Toleration { key: "gpu".to_string(), value: None });
        assert!(prov.admits(&req));

        req.constraints
            .node_selector
            .insert("pool".to_string(), "cpu".to_string());
        assert!(!prov.admits(&req));

        req.constraints.node_selector.clear();
        req.constraints.zones = vec!["zone-b".to_string()];
        assert!(!prov.admits(&req));
    }

    #[test]
    fn provisioner_selector_on_well_known_labels() {
        let mut prov = Provisioner::new("default");
        prov.instance_types = vec!["m.large".to_string()];

        let mut req = request("r1");
        req.constraints
            .node_selector
            .insert(well_known::INSTANCE_TYPE.to_string(), "m.large".to_string());
        assert!(prov.admits(&req));

        req.constraints
            .node_selector
            .insert(well_known::PROVISIONER.to_string(), "other".to_string());
        assert!(!prov.admits(&req));
    }

    #[test]
    fn zone_rank_follows_listing_order() {
        let mut prov = Provisioner::new("default");
        assert_eq!(prov.zone_rank("anything"), Some(0));
        prov.zones = vec!["zone-b".to_string(), "zone-a".to_string()];
        assert_eq!(prov.zone_rank("zone-b"), Some(0));
        assert_eq!(prov.zone_rank("zone-a"), Some(1));
        assert_eq!(prov.zone_rank("zone-c"), None);
    }

    #[test]
    fn request_round_trips_through_json_with_defaults() {
        let json = r#"{"id":"r1","owner":{"kind":"Job","name":"etl"},"resources":{"cpu_millis":500}}"#;
        let req: WorkloadRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.resources.cpu_millis, 500);
        assert!(!req.disruption_sensitive);
        assert!(req.constraints.zones.is_empty());
    }
}
