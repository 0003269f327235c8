//! Provisioner matching and batch formation.

use std::collections::BTreeMap;

use nodegrid_core::{CompatibilityClass, Provisioner, WorkloadRequest};

/// The provisioner that owns a request: the first, by name, whose nodes
/// could host it.
pub fn match_provisioner<'a>(
    request: &WorkloadRequest,
    provisioners: &'a [Provisioner],
) -> Option<&'a Provisioner> {
    let mut sorted: Vec<&Provisioner> = provisioners.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted.into_iter().find(|p| p.admits(request))
}

/// Partition requests into batches of identical compatibility class.
///
/// Requests from different classes never share a batch; batches and their
/// members come out in a stable order.
pub fn batch_by_class(
    requests: Vec<WorkloadRequest>,
) -> BTreeMap<CompatibilityClass, Vec<WorkloadRequest>> {
    let mut batches: BTreeMap<CompatibilityClass, Vec<WorkloadRequest>> = BTreeMap::new();
    for request in requests {
        batches
            .entry(request.compatibility_class())
            .or_default()
            .push(request);
    }
    for batch in batches.values_mut() {
        batch.sort_by(|a, b| a.id.cmp(&b.id));
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_core::{OwnerRef, ResourceVector, TaintEffect, Taint, Toleration};

    fn req(id: &str) -> WorkloadRequest {
        WorkloadRequest::new(id, OwnerRef::new("Job", "etl"), ResourceVector::from_cores(1, 1))
    }

    #[test]
    fn first_admitting_provisioner_by_name_wins() {
        let mut gpu = Provisioner::new("a-gpu");
        gpu.taints.push(Taint {
            key: "gpu".to_string(),
            value: "true".to_string(),
            effect: TaintEffect::NoSchedule,
        });
        let general = Provisioner::new("b-general");
        let provisioners = vec![general, gpu];

        let plain = req("r1");
        assert_eq!(
            match_provisioner(&plain, &provisioners).map(|p| p.name.as_str()),
            Some("b-general")
        );

        let mut tolerant = req("r2");
        tolerant.constraints.tolerations.push(Toleration {
            key: "gpu".to_string(),
            value: None,
        });
        assert_eq!(
            match_provisioner(&tolerant, &provisioners).map(|p| p.name.as_str()),
            Some("a-gpu")
        );
    }

    #[test]
    fn no_match_for_foreign_zone() {
        let mut provisioner = Provisioner::new("default");
        provisioner.zones = vec!["zone-a".to_string()];
        let mut request = req("r1");
        request.constraints.zones = vec!["zone-z".to_string()];
        assert!(match_provisioner(&request, &[provisioner]).is_none());
    }

    #[test]
    fn classes_never_mix() {
        let mut zoned = req("z1");
        zoned.constraints.zones = vec!["zone-a".to_string()];
        let batches = batch_by_class(vec![req("b"), zoned, req("a")]);

        assert_eq!(batches.len(), 2);
        let unconstrained = batches.get(&CompatibilityClass::default()).unwrap();
        let ids: Vec<&str> = unconstrained.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
