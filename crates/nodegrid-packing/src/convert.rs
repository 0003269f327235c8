//! Type conversions between registry/catalog types and packing types.
//!
//! Bridges `nodegrid_state::Node` to `Bin`, and a provisioner plus the
//! backend's shape catalog to the `Offering`s it may launch.

use nodegrid_core::{InstanceShape, Provisioner};
use nodegrid_state::Node;

use crate::packer::Offering;
use crate::scorer::Bin;

/// Convert a registry [`Node`] to a [`Bin`] carrying its current bindings.
pub fn node_to_bin(node: &Node) -> Bin {
    let mut bin = Bin::new(
        &node.id,
        node.labels.clone(),
        node.taints.clone(),
        node.allocatable.clone(),
    );
    for request in node.bound.values() {
        bin.assign(request);
    }
    bin
}

/// Every (shape, zone) pair a provisioner may launch, priced with its weights.
pub fn offerings_for(provisioner: &Provisioner, shapes: &[InstanceShape]) -> Vec<Offering> {
    let mut offerings = Vec::new();
    for shape in shapes {
        if !provisioner.allows_shape(&shape.name) {
            continue;
        }
        for zone in &shape.zones {
            let Some(zone_rank) = provisioner.zone_rank(zone) else {
                continue;
            };
            offerings.push(Offering {
                provisioner: provisioner.name.clone(),
                instance_type: shape.name.clone(),
                zone: zone.clone(),
                capacity: shape.capacity.clone(),
                cost: shape.cost * provisioner.weight(&shape.name),
                zone_rank,
                labels: provisioner.node_labels(&shape.name, zone),
                taints: provisioner.taints.clone(),
            });
        }
    }
    offerings
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_core::{OwnerRef, ResourceVector, WorkloadRequest, well_known};

    fn shape(name: &str, cores: u64, cost: f64, zones: &[&str]) -> InstanceShape {
        InstanceShape {
            name: name.to_string(),
            capacity: ResourceVector::from_cores(cores, cores * 4),
            cost,
            zones: zones.iter().map(|z| z.to_string()).collect(),
        }
    }

    #[test]
    fn node_to_bin_carries_usage() {
        let mut node = Node::new("n1", "default", "c.4", "zone-a", ResourceVector::from_cores(4, 16), 0);
        let mut request = WorkloadRequest::new("r1", OwnerRef::new("Job", "a"), ResourceVector::from_cores(1, 1));
        request.constraints.anti_affinity = Some("etl".to_string());
        node.bound.insert(request.id.clone(), request);

        let bin = node_to_bin(&node);
        assert_eq!(bin.used, ResourceVector::from_cores(1, 1));
        assert!(bin.groups.contains("etl"));
        assert_eq!(bin.requests, vec!["r1".to_string()]);
    }

    #[test]
    fn offerings_respect_provisioner_policy() {
        let mut provisioner = Provisioner::new("default");
        provisioner.instance_types = vec!["c.4".to_string()];
        provisioner.zones = vec!["zone-b".to_string(), "zone-a".to_string()];
        provisioner.weights.insert("c.4".to_string(), 2.0);

        let shapes = vec![
            shape("c.4", 4, 0.2, &["zone-a", "zone-b", "zone-c"]),
            shape("c.8", 8, 0.4, &["zone-a"]),
        ];
        let offerings = offerings_for(&provisioner, &shapes);

        assert_eq!(offerings.len(), 2);
        assert!(offerings.iter().all(|o| o.instance_type == "c.4"));
        assert!(offerings.iter().all(|o| (o.cost - 0.4).abs() < 1e-9));
        let zone_b = offerings.iter().find(|o| o.zone == "zone-b").unwrap();
        assert_eq!(zone_b.zone_rank, 0);
        assert_eq!(zone_b.labels.get(well_known::PROVISIONER).map(String::as_str), Some("default"));
    }
}
