//! Packing engine — existing bins first, then new capacity.
//!
//! `place_on_existing` performs greedy best-fit onto bins that already
//! exist. `plan_new_capacity` computes the node shapes to launch for the
//! requests that are left:
//!
//! 1. Requests are sorted by dominant resource share, descending.
//! 2. For every offering, a first-fit-decreasing pass opens new bins of
//!    that offering (or of the cheapest offering that admits a request the
//!    opener cannot host).
//! 3. Each resulting bin is right-sized to the cheapest offering that
//!    admits its whole contents.
//! 4. The cheapest plan wins; equal-cost plans prefer fewer nodes, then
//!    the earlier opener in offering order.
//!
//! Offerings are ordered by cost, then zone preference, so the cheapest
//! eligible shape wins ties and the earliest-listed zone wins among equal
//! costs.

use std::collections::BTreeMap;

use tracing::debug;

use nodegrid_core::{RequestId, ResourceVector, Taint, WorkloadRequest};

use crate::scorer::{Bin, ScoringWeights, rank_bins};

const COST_EPSILON: f64 = 1e-9;

/// A launchable (shape, zone) pair for one provisioner.
#[derive(Debug, Clone, PartialEq)]
pub struct Offering {
    pub provisioner: String,
    pub instance_type: String,
    pub zone: String,
    pub capacity: ResourceVector,
    /// Backend price multiplied by the provisioner's shape weight.
    pub cost: f64,
    /// Position of the zone in the provisioner's zone list.
    pub zone_rank: usize,
    /// Labels the launched node will carry.
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
}

impl Offering {
    pub fn open_bin(&self, id: &str) -> Bin {
        Bin::new(id, self.labels.clone(), self.taints.clone(), self.capacity.clone())
    }

    /// Whether an empty node of this offering could host the request.
    pub fn admits(&self, request: &WorkloadRequest) -> bool {
        self.open_bin("").admits(request)
    }

    /// Whether one node of this offering could host all of the requests.
    pub fn admits_all(&self, requests: &[&WorkloadRequest]) -> bool {
        let mut bin = self.open_bin("");
        for request in requests {
            if !bin.admits(request) {
                return false;
            }
            bin.assign(request);
        }
        true
    }
}

/// Sort offerings cheapest first; equal costs prefer the earlier zone.
pub fn sort_offerings(offerings: &mut [Offering]) {
    offerings.sort_by(|a, b| {
        a.cost
            .total_cmp(&b.cost)
            .then_with(|| a.zone_rank.cmp(&b.zone_rank))
            .then_with(|| a.instance_type.cmp(&b.instance_type))
            .then_with(|| a.zone.cmp(&b.zone))
    });
}

/// Sort requests by dominant share of `reference`, largest first.
pub fn sort_decreasing(requests: &mut [&WorkloadRequest], reference: &ResourceVector) {
    requests.sort_by(|a, b| {
        b.resources
            .dominant_share(reference)
            .total_cmp(&a.resources.dominant_share(reference))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// One node the plan wants launched, with the requests it will host.
#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub offering: Offering,
    pub requests: Vec<WorkloadRequest>,
}

impl PlannedNode {
    pub fn requested(&self) -> ResourceVector {
        self.requests.iter().map(|r| &r.resources).sum()
    }
}

/// Output of `plan_new_capacity`.
#[derive(Debug, Clone, Default)]
pub struct CapacityPlan {
    pub nodes: Vec<PlannedNode>,
    /// Requests no offering can host.
    pub unplaceable: Vec<WorkloadRequest>,
}

impl CapacityPlan {
    pub fn total_cost(&self) -> f64 {
        self.nodes.iter().map(|n| n.offering.cost).sum()
    }
}

/// Compute the node shapes to launch for a batch of requests.
pub fn plan_new_capacity(requests: &[WorkloadRequest], offerings: &[Offering]) -> CapacityPlan {
    let mut offerings = offerings.to_vec();
    sort_offerings(&mut offerings);

    let reference = offerings
        .iter()
        .fold(ResourceVector::default(), |acc, o| acc.max(&o.capacity));
    let mut ordered: Vec<&WorkloadRequest> = requests.iter().collect();
    sort_decreasing(&mut ordered, &reference);

    let (placeable, unplaceable): (Vec<&WorkloadRequest>, Vec<&WorkloadRequest>) = ordered
        .into_iter()
        .partition(|r| offerings.iter().any(|o| o.admits(r)));

    let mut best: Option<(Vec<PlannedNode>, f64)> = None;
    for opener in &offerings {
        if !placeable.iter().any(|r| opener.admits(r)) {
            continue;
        }
        let nodes = first_fit_decreasing(&placeable, opener, &offerings);
        let cost: f64 = nodes.iter().map(|n| n.offering.cost).sum();
        let better = match &best {
            None => true,
            Some((best_nodes, best_cost)) => {
                cost < best_cost - COST_EPSILON
                    || ((cost - best_cost).abs() <= COST_EPSILON && nodes.len() < best_nodes.len())
            }
        };
        debug!(
            opener = %opener.instance_type,
            zone = %opener.zone,
            nodes = nodes.len(),
            cost,
            better,
            "evaluated packing"
        );
        if better {
            best = Some((nodes, cost));
        }
    }

    CapacityPlan {
        nodes: best.map(|(nodes, _)| nodes).unwrap_or_default(),
        unplaceable: unplaceable.into_iter().cloned().collect(),
    }
}

fn first_fit_decreasing(
    requests: &[&WorkloadRequest],
    opener: &Offering,
    offerings: &[Offering],
) -> Vec<PlannedNode> {
    let mut bins: Vec<(Bin, &Offering, Vec<&WorkloadRequest>)> = Vec::new();

    for request in requests {
        if let Some((bin, _, items)) = bins.iter_mut().find(|(b, _, _)| b.admits(request)) {
            bin.assign(request);
            items.push(*request);
            continue;
        }
        let offering = if opener.admits(request) {
            opener
        } else {
            match offerings.iter().find(|o| o.admits(request)) {
                Some(o) => o,
                None => continue,
            }
        };
        let mut bin = offering.open_bin(&format!("planned-{}", bins.len()));
        bin.assign(request);
        bins.push((bin, offering, vec![*request]));
    }

    bins.into_iter()
        .map(|(_, opened_with, items)| {
            let offering = offerings
                .iter()
                .find(|o| o.admits_all(&items))
                .unwrap_or(opened_with);
            PlannedNode {
                offering: offering.clone(),
                requests: items.into_iter().cloned().collect(),
            }
        })
        .collect()
}

/// Where `place_on_existing` put a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOn {
    pub request: RequestId,
    pub bin: String,
}

/// Output of `place_on_existing`.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub placed: Vec<PlacedOn>,
    pub unplaced: Vec<WorkloadRequest>,
}

impl Placement {
    pub fn is_complete(&self) -> bool {
        self.unplaced.is_empty()
    }
}

/// Greedy best-fit of requests onto existing bins, largest request first.
///
/// `bins` is updated in place so callers can chain simulations; clone it
/// first to run a dry simulation.
pub fn place_on_existing(
    requests: &[WorkloadRequest],
    bins: &mut [Bin],
    weights: &ScoringWeights,
) -> Placement {
    let reference = bins
        .iter()
        .fold(ResourceVector::default(), |acc, b| acc.max(&b.allocatable));
    let mut ordered: Vec<&WorkloadRequest> = requests.iter().collect();
    sort_decreasing(&mut ordered, &reference);

    let mut placement = Placement::default();
    for request in ordered {
        let best = rank_bins(bins, request, weights)
            .into_iter()
            .next()
            .and_then(|score| bins.iter().position(|b| b.id == score.bin_id));
        match best {
            Some(idx) => {
                let bin = &mut bins[idx];
                bin.assign(request);
                placement.placed.push(PlacedOn {
                    request: request.id.clone(),
                    bin: bin.id.clone(),
                });
            }
            None => placement.unplaced.push(request.clone()),
        }
    }
    placement
}

/// Prove that `requests` can all move onto `bins`.
///
/// Returns the destination bins with the requests placed when every one
/// fits, `None` otherwise. `bins` itself is left untouched.
pub fn simulate_removal(
    requests: &[WorkloadRequest],
    bins: &[Bin],
    weights: &ScoringWeights,
) -> Option<Vec<Bin>> {
    let mut trial = bins.to_vec();
    let placement = place_on_existing(requests, &mut trial, weights);
    if placement.is_complete() {
        Some(trial)
    } else {
        debug!(
            unplaced = placement.unplaced.len(),
            "removal simulation left workloads stranded"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_core::{OwnerRef, Provisioner, well_known};

    fn offering(shape: &str, cores: u64, cost: f64, zone: &str, zone_rank: usize) -> Offering {
        Offering {
            provisioner: "default".to_string(),
            instance_type: shape.to_string(),
            zone: zone.to_string(),
            capacity: ResourceVector::from_cores(cores, cores * 4),
            cost,
            zone_rank,
            labels: Provisioner::new("default").node_labels(shape, zone),
            taints: Vec::new(),
        }
    }

    fn req(id: &str, cores: u64) -> WorkloadRequest {
        WorkloadRequest::new(id, OwnerRef::new("ReplicaSet", "web"), ResourceVector::from_cores(cores, 1))
    }

    fn requests(count: usize, cores: u64) -> Vec<WorkloadRequest> {
        (0..count).map(|i| req(&format!("r{i:02}"), cores)).collect()
    }

    fn shape_counts(plan: &CapacityPlan) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for node in &plan.nodes {
            *counts.entry(node.offering.instance_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn ten_two_cpu_requests_prefer_large_nodes() {
        let offerings = vec![
            offering("c.4", 4, 0.2, "zone-a", 0),
            offering("c.8", 8, 0.4, "zone-a", 0),
        ];
        let plan = plan_new_capacity(&requests(10, 2), &offerings);

        assert!(plan.unplaceable.is_empty());
        let counts = shape_counts(&plan);
        assert_eq!(counts.get("c.8"), Some(&2));
        assert_eq!(counts.get("c.4"), Some(&1));
        let placed: usize = plan.nodes.iter().map(|n| n.requests.len()).sum();
        assert_eq!(placed, 10);
        for node in &plan.nodes {
            assert!(node.requested().fits_within(&node.offering.capacity));
            assert!(node.requested().utilization(&node.offering.capacity) > 0.5);
        }
    }

    #[test]
    fn cheaper_per_core_shape_wins() {
        let offerings = vec![
            offering("c.4", 4, 0.2, "zone-a", 0),
            offering("c.8", 8, 0.3, "zone-a", 0),
        ];
        let plan = plan_new_capacity(&requests(4, 2), &offerings);
        assert_eq!(shape_counts(&plan).get("c.8"), Some(&1));
        assert_eq!(plan.nodes.len(), 1);
        assert!((plan.total_cost() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn small_batch_right_sizes_to_cheapest_shape() {
        let offerings = vec![
            offering("c.8", 8, 0.4, "zone-a", 0),
            offering("c.4", 4, 0.2, "zone-a", 0),
        ];
        let plan = plan_new_capacity(&[req("r1", 1)], &offerings);
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].offering.instance_type, "c.4");
    }

    #[test]
    fn equal_cost_prefers_earliest_zone() {
        let offerings = vec![
            offering("c.4", 4, 0.2, "zone-b", 1),
            offering("c.4", 4, 0.2, "zone-a", 0),
        ];
        let plan = plan_new_capacity(&[req("r1", 1)], &offerings);
        assert_eq!(plan.nodes[0].offering.zone, "zone-a");
    }

    #[test]
    fn oversized_request_is_reported() {
        let offerings = vec![offering("c.4", 4, 0.2, "zone-a", 0)];
        let plan = plan_new_capacity(&[req("big", 16), req("small", 1)], &offerings);
        assert_eq!(plan.unplaceable.len(), 1);
        assert_eq!(plan.unplaceable[0].id, "big");
        assert_eq!(plan.nodes.len(), 1);
    }

    #[test]
    fn zone_constraint_limits_offerings() {
        let offerings = vec![
            offering("c.4", 4, 0.1, "zone-a", 0),
            offering("c.4", 4, 0.2, "zone-b", 1),
        ];
        let mut request = req("r1", 1);
        request.constraints.zones = vec!["zone-b".to_string()];
        let plan = plan_new_capacity(&[request], &offerings);
        assert_eq!(plan.nodes[0].offering.zone, "zone-b");
        assert_eq!(
            plan.nodes[0].offering.labels.get(well_known::ZONE).map(String::as_str),
            Some("zone-b")
        );
    }

    #[test]
    fn anti_affinity_spreads_across_nodes() {
        let offerings = vec![offering("c.8", 8, 0.4, "zone-a", 0)];
        let batch: Vec<WorkloadRequest> = (0..3)
            .map(|i| {
                let mut r = req(&format!("db-{i}"), 1);
                r.constraints.anti_affinity = Some("db".to_string());
                r
            })
            .collect();
        let plan = plan_new_capacity(&batch, &offerings);
        assert_eq!(plan.nodes.len(), 3);
    }

    #[test]
    fn empty_batch_plans_nothing() {
        let plan = plan_new_capacity(&[], &[offering("c.4", 4, 0.2, "zone-a", 0)]);
        assert!(plan.nodes.is_empty());
        assert!(plan.unplaceable.is_empty());
    }

    #[test]
    fn place_on_existing_best_fit() {
        let o = offering("c.4", 4, 0.2, "zone-a", 0);
        let mut tight = o.open_bin("tight");
        tight.assign(&req("x", 2));
        let loose = o.open_bin("loose");
        let mut bins = vec![loose, tight];

        let placement = place_on_existing(&[req("r1", 2)], &mut bins, &ScoringWeights::default());
        assert!(placement.is_complete());
        assert_eq!(placement.placed[0].bin, "tight");
        assert_eq!(bins[1].requests.len(), 2);
    }

    #[test]
    fn place_on_existing_reports_leftovers() {
        let o = offering("c.4", 4, 0.2, "zone-a", 0);
        let mut bins = vec![o.open_bin("only")];
        let placement = place_on_existing(&requests(3, 2), &mut bins, &ScoringWeights::default());
        assert_eq!(placement.placed.len(), 2);
        assert_eq!(placement.unplaced.len(), 1);
        assert!(bins[0].used.fits_within(&bins[0].allocatable));
    }

    #[test]
    fn removal_simulation_is_all_or_nothing() {
        let o = offering("c.4", 4, 0.2, "zone-a", 0);
        let mut half = o.open_bin("half");
        half.assign(&req("x", 2));
        let bins = vec![half];

        let moved = simulate_removal(&[req("a", 2)], &bins, &ScoringWeights::default()).unwrap();
        assert_eq!(moved[0].requests.len(), 2);

        assert!(simulate_removal(&requests(2, 2), &bins, &ScoringWeights::default()).is_none());
        assert_eq!(bins[0].requests.len(), 1);
    }

    #[test]
    fn removal_with_nothing_bound_always_fits() {
        assert!(simulate_removal(&[], &[], &ScoringWeights::default()).is_some());
    }
}
