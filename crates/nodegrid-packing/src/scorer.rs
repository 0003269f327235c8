//! Bin scoring for placement decisions.
//!
//! Evaluates candidate bins using a weighted combination of:
//! - **Bin-packing** (best-fit): prefer bins left with the least spare capacity
//! - **Affinity**: prefer bins whose labels and zone match soft preferences
//! - **Feasibility**: reject bins that violate hard constraints or overflow

use std::collections::{BTreeMap, BTreeSet};

use nodegrid_core::{RequestId, ResourceVector, Taint, WorkloadRequest};

/// A node (existing or hypothetical) that requests can be packed into.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub allocatable: ResourceVector,
    pub used: ResourceVector,
    /// Anti-affinity groups already present.
    pub groups: BTreeSet<String>,
    pub requests: Vec<RequestId>,
}

impl Bin {
    pub fn new(
        id: &str,
        labels: BTreeMap<String, String>,
        taints: Vec<Taint>,
        allocatable: ResourceVector,
    ) -> Self {
        Self {
            id: id.to_string(),
            labels,
            taints,
            allocatable,
            used: ResourceVector::default(),
            groups: BTreeSet::new(),
            requests: Vec::new(),
        }
    }

    pub fn spare(&self) -> ResourceVector {
        self.allocatable.saturating_sub(&self.used)
    }

    /// Whether the request can be added without breaking a hard constraint
    /// or exceeding allocatable capacity.
    pub fn admits(&self, request: &WorkloadRequest) -> bool {
        let c = &request.constraints;
        c.admits(&self.labels, &self.taints)
            && self
                .used
                .add(&request.resources)
                .fits_within(&self.allocatable)
            && c.anti_affinity
                .as_ref()
                .is_none_or(|group| !self.groups.contains(group))
    }

    pub fn assign(&mut self, request: &WorkloadRequest) {
        self.used += &request.resources;
        if let Some(group) = &request.constraints.anti_affinity {
            self.groups.insert(group.clone());
        }
        self.requests.push(request.id.clone());
    }

    pub fn utilization(&self) -> f64 {
        self.used.utilization(&self.allocatable)
    }
}

/// Scored placement result for a single bin.
#[derive(Debug, Clone)]
pub struct BinScore {
    pub bin_id: String,
    /// Total composite score (higher = better). Range: 0.0..=100.0.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    /// How full the bin will be after placement (higher = tighter fit).
    pub bin_packing: f64,
    /// How well labels and zone match soft preferences.
    pub affinity: f64,
}

/// Weights for the scoring components.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub bin_packing: f64,
    pub affinity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            bin_packing: 0.7,
            affinity: 0.3,
        }
    }
}

/// Score a single bin for the given request. `None` if it cannot host it.
pub fn score_bin(bin: &Bin, request: &WorkloadRequest, weights: &ScoringWeights) -> Option<BinScore> {
    if !bin.admits(request) {
        return None;
    }

    let projected = bin.used.add(&request.resources);
    let bin_packing = projected.utilization(&bin.allocatable).min(1.0) * 100.0;
    let affinity = request.constraints.affinity_score(&bin.labels) * 100.0;
    let score = weights.bin_packing * bin_packing + weights.affinity * affinity;

    Some(BinScore {
        bin_id: bin.id.clone(),
        score,
        breakdown: ScoreBreakdown {
            bin_packing,
            affinity,
        },
    })
}

/// Score all bins and return the feasible ones, best first.
///
/// Equal scores are ordered by bin id so repeated runs agree.
pub fn rank_bins(bins: &[Bin], request: &WorkloadRequest, weights: &ScoringWeights) -> Vec<BinScore> {
    let mut scores: Vec<BinScore> = bins
        .iter()
        .filter_map(|b| score_bin(b, request, weights))
        .collect();
    scores.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.bin_id.cmp(&b.bin_id))
    });
    scores
}
