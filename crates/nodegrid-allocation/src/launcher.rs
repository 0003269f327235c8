//! Launch orchestration for one planned node.
//!
//! Each candidate offering is tried up to `launch_attempts` times with
//! exponential backoff between attempts. An `Invalid` backend answer ends
//! the attempts for that offering immediately. Once an offering is
//! exhausted a `LaunchFailed` condition is written on the provisioner and
//! the next cheapest offering that still fits the node's requests is
//! tried.

use tracing::{debug, info, warn};

use nodegrid_backend::{BackendError, InstanceHandle, LaunchRequest};
use nodegrid_packing::{Offering, PlannedNode, sort_offerings};
use nodegrid_runtime::{Backoff, ControllerContext, ControllerError, ControllerResult};

pub const LAUNCH_FAILED: &str = "LaunchFailed";

/// A successful launch.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub handle: InstanceHandle,
    /// The offering that actually launched; may differ from the plan.
    pub offering: Offering,
    /// Failed backend calls before the successful one.
    pub failures: u32,
}

/// The planned offering first, then every other offering able to host the
/// whole node, cheapest first.
fn candidates(planned: &PlannedNode, offerings: &[Offering]) -> Vec<Offering> {
    let requests: Vec<_> = planned.requests.iter().collect();
    let mut rest: Vec<Offering> = offerings
        .iter()
        .filter(|o| **o != planned.offering && o.admits_all(&requests))
        .cloned()
        .collect();
    sort_offerings(&mut rest);

    let mut ordered = Vec::with_capacity(rest.len() + 1);
    ordered.push(planned.offering.clone());
    ordered.extend(rest);
    ordered
}

/// Launch capacity for `planned`, falling back through `offerings`.
pub async fn launch_with_fallback(
    ctx: &ControllerContext,
    planned: &PlannedNode,
    offerings: &[Offering],
) -> ControllerResult<LaunchOutcome> {
    let settings = &ctx.config.allocation;
    let backoff = Backoff::new(settings.launch_backoff_base, settings.launch_backoff_max);
    let attempts = settings.launch_attempts.max(1);
    let mut failures = 0;
    let mut last_error: Option<BackendError> = None;

    for offering in candidates(planned, offerings) {
        let request = LaunchRequest {
            instance_type: offering.instance_type.clone(),
            zone: offering.zone.clone(),
            provisioner: offering.provisioner.clone(),
            labels: offering.labels.clone(),
        };

        for attempt in 0..attempts {
            match ctx.backend.launch(&request).await {
                Ok(handle) => {
                    info!(
                        provisioner = %offering.provisioner,
                        instance = %handle.id,
                        shape = %offering.instance_type,
                        zone = %offering.zone,
                        requests = planned.requests.len(),
                        failures,
                        "capacity launched"
                    );
                    return Ok(LaunchOutcome {
                        handle,
                        offering,
                        failures,
                    });
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        provisioner = %offering.provisioner,
                        shape = %offering.instance_type,
                        zone = %offering.zone,
                        attempt = attempt + 1,
                        error = %e,
                        "launch failed"
                    );
                    let invalid = matches!(e, BackendError::Invalid(_));
                    last_error = Some(e);
                    if invalid {
                        break;
                    }
                    if attempt + 1 < attempts {
                        let delay = backoff.delay(attempt);
                        debug!(delay_ms = delay.as_millis() as u64, "retrying launch");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let message = match &last_error {
            Some(e) => format!("{} in {}: {e}", offering.instance_type, offering.zone),
            None => format!("{} in {}", offering.instance_type, offering.zone),
        };
        ctx.set_condition("Provisioner", &offering.provisioner, LAUNCH_FAILED, "AttemptsExhausted", message)?;
    }

    Err(last_error
        .map(ControllerError::from)
        .unwrap_or_else(|| ControllerError::Capacity("no offering to launch".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use nodegrid_backend::{CapacityBackend, FakeBackend};
    use nodegrid_core::{InstanceShape, NodegridConfig, OwnerRef, Provisioner, ResourceVector, WorkloadRequest};
    use nodegrid_packing::offerings_for;
    use nodegrid_runtime::Clock;
    use nodegrid_state::NodeRegistry;

    fn shapes() -> Vec<InstanceShape> {
        vec![
            InstanceShape {
                name: "c.4".to_string(),
                capacity: ResourceVector::from_cores(4, 16),
                cost: 0.2,
                zones: vec!["zone-a".to_string()],
            },
            InstanceShape {
                name: "c.8".to_string(),
                capacity: ResourceVector::from_cores(8, 32),
                cost: 0.4,
                zones: vec!["zone-a".to_string()],
            },
        ]
    }

    fn setup(backend: Arc<FakeBackend>) -> ControllerContext {
        let mut config = NodegridConfig::default();
        config.allocation.launch_backoff_base = Duration::from_millis(1);
        config.allocation.launch_backoff_max = Duration::from_millis(2);
        let registry = NodeRegistry::open_in_memory().unwrap();
        let backend: Arc<dyn CapacityBackend> = backend;
        ControllerContext::new(registry, backend, config, Clock::manual(1000))
    }

    fn planned(offerings: &[Offering]) -> PlannedNode {
        PlannedNode {
            offering: offerings
                .iter()
                .find(|o| o.instance_type == "c.4")
                .unwrap()
                .clone(),
            requests: vec![WorkloadRequest::new(
                "r1",
                OwnerRef::new("Job", "a"),
                ResourceVector::from_cores(2, 1),
            )],
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_on_the_same_offering() {
        let backend = Arc::new(FakeBackend::new(shapes()));
        backend
            .fail_next_launches(2, BackendError::Transient("timeout".into()))
            .await;
        let ctx = setup(Arc::clone(&backend));
        let offerings = offerings_for(&Provisioner::new("default"), &shapes());

        let outcome = launch_with_fallback(&ctx, &planned(&offerings), &offerings)
            .await
            .unwrap();
        assert_eq!(outcome.offering.instance_type, "c.4");
        assert_eq!(outcome.failures, 2);
        assert_eq!(backend.launch_calls(), 3);
    }

    #[tokio::test]
    async fn falls_back_to_next_cheapest_after_exhaustion() {
        let backend = Arc::new(FakeBackend::new(shapes()));
        backend
            .fail_next_launches(3, BackendError::Capacity("sold out".into()))
            .await;
        let ctx = setup(Arc::clone(&backend));
        let offerings = offerings_for(&Provisioner::new("default"), &shapes());

        let outcome = launch_with_fallback(&ctx, &planned(&offerings), &offerings)
            .await
            .unwrap();
        assert_eq!(outcome.offering.instance_type, "c.8");

        let conditions = ctx.registry.list_conditions("Provisioner", "default").unwrap();
        assert!(conditions.iter().any(|c| c.type_ == LAUNCH_FAILED));
    }

    #[tokio::test]
    async fn invalid_skips_remaining_attempts() {
        let backend = Arc::new(FakeBackend::new(shapes()));
        backend
            .fail_next_launches(1, BackendError::Invalid("bad shape".into()))
            .await;
        let ctx = setup(Arc::clone(&backend));
        let offerings = offerings_for(&Provisioner::new("default"), &shapes());

        let outcome = launch_with_fallback(&ctx, &planned(&offerings), &offerings)
            .await
            .unwrap();
        assert_eq!(outcome.offering.instance_type, "c.8");
        assert_eq!(backend.launch_calls(), 2);
    }

    #[tokio::test]
    async fn every_offering_failing_is_an_error() {
        let backend = Arc::new(FakeBackend::new(shapes()));
        backend
            .fail_next_launches(6, BackendError::Capacity("sold out".into()))
            .await;
        let ctx = setup(Arc::clone(&backend));
        let offerings = offerings_for(&Provisioner::new("default"), &shapes());

        let err = launch_with_fallback(&ctx, &planned(&offerings), &offerings)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Capacity(_)));
        assert!(backend.live_instances().await.is_empty());
    }
}
