//! Resource vectors.
//!
//! A `ResourceVector` is the unit of both demand (what a workload asks for)
//! and supply (what a node can allocate). Comparison is componentwise: a
//! demand fits a capacity only if every dimension fits.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// CPU, memory and extended resources (accelerators and the like).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVector {
    /// CPU in millicores.
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes.
    #[serde(default)]
    pub memory_bytes: u64,
    /// Extended resources keyed by resource name (e.g. `gpu`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended: BTreeMap<String, u64>,
}

const GIB: u64 = 1024 * 1024 * 1024;

impl ResourceVector {
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            extended: BTreeMap::new(),
        }
    }

    /// Whole cores and GiB, the way shapes are usually quoted.
    pub fn from_cores(cores: u64, memory_gib: u64) -> Self {
        Self::new(cores * 1000, memory_gib * GIB)
    }

    /// Add an extended resource quantity.
    pub fn with_extended(mut self, name: &str, quantity: u64) -> Self {
        self.extended.insert(name.to_string(), quantity);
        self
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0 && self.extended.values().all(|v| *v == 0)
    }

    /// Componentwise `self <= capacity`. An extended resource missing from
    /// `capacity` counts as zero.
    pub fn fits_within(&self, capacity: &ResourceVector) -> bool {
        self.cpu_millis <= capacity.cpu_millis
            && self.memory_bytes <= capacity.memory_bytes
            && self
                .extended
                .iter()
                .all(|(name, qty)| *qty <= capacity.extended.get(name).copied().unwrap_or(0))
    }

    /// Componentwise sum.
    pub fn add(&self, other: &ResourceVector) -> ResourceVector {
        let mut sum = self.clone();
        sum += other;
        sum
    }

    /// Componentwise difference, clamped at zero.
    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        let mut extended = self.extended.clone();
        for (name, qty) in &other.extended {
            if let Some(v) = extended.get_mut(name) {
                *v = v.saturating_sub(*qty);
            }
        }
        ResourceVector {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            extended,
        }
    }

    /// Highest per-dimension ratio of `self` to `allocatable`.
    ///
    /// Dimensions where both sides are zero are ignored. Demand on a
    /// dimension with zero allocatable yields infinity.
    pub fn utilization(&self, allocatable: &ResourceVector) -> f64 {
        let mut max = ratio(self.cpu_millis, allocatable.cpu_millis);
        max = max.max(ratio(self.memory_bytes, allocatable.memory_bytes));
        for (name, qty) in &self.extended {
            let cap = allocatable.extended.get(name).copied().unwrap_or(0);
            max = max.max(ratio(*qty, cap));
        }
        max
    }

    /// Dominant share of this demand relative to a reference capacity.
    ///
    /// Used as the sort key for first-fit-decreasing packing.
    pub fn dominant_share(&self, reference: &ResourceVector) -> f64 {
        self.utilization(reference)
    }

    /// Componentwise maximum.
    pub fn max(&self, other: &ResourceVector) -> ResourceVector {
        let mut extended = self.extended.clone();
        for (name, qty) in &other.extended {
            let entry = extended.entry(name.clone()).or_insert(0);
            *entry = (*entry).max(*qty);
        }
        ResourceVector {
            cpu_millis: self.cpu_millis.max(other.cpu_millis),
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
            extended,
        }
    }
}

fn ratio(used: u64, capacity: u64) -> f64 {
    match (used, capacity) {
        (0, _) => 0.0,
        (_, 0) => f64::INFINITY,
        (u, c) => u as f64 / c as f64,
    }
}

impl AddAssign<&ResourceVector> for ResourceVector {
    fn add_assign(&mut self, other: &ResourceVector) {
        self.cpu_millis = self.cpu_millis.saturating_add(other.cpu_millis);
        self.memory_bytes = self.memory_bytes.saturating_add(other.memory_bytes);
        for (name, qty) in &other.extended {
            let entry = self.extended.entry(name.clone()).or_insert(0);
            *entry = entry.saturating_add(*qty);
        }
    }
}

impl<'a> std::iter::Sum<&'a ResourceVector> for ResourceVector {
    fn sum<I: Iterator<Item = &'a ResourceVector>>(iter: I) -> Self {
        let mut total = ResourceVector::default();
        for v in iter {
            total += v;
        }
        total
    }
}

impl std::fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpu={}m mem={}", self.cpu_millis, self.memory_bytes)?;
        for (name, qty) in &self.extended {
            write!(f, " {name}={qty}")?;
        }
        Ok(())
    }
}
