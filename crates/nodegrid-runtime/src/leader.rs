//! Lease-based leader election.
//!
//! Replicas race for a named lease in the registry. The holder renews it
//! every `renew_interval`; if it stops renewing, another replica takes over
//! once `lease_ttl` has passed.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use nodegrid_core::config::LeaderSettings;
use nodegrid_state::NodeRegistry;

use crate::context::Clock;
use crate::error::ControllerResult;

pub struct LeaderElector {
    registry: NodeRegistry,
    lease_name: String,
    identity: String,
    lease_ttl: Duration,
    renew_interval: Duration,
    clock: Clock,
}

impl LeaderElector {
    pub fn new(registry: NodeRegistry, settings: &LeaderSettings, identity: &str, clock: Clock) -> Self {
        Self {
            registry,
            lease_name: settings.lease_name.clone(),
            identity: identity.to_string(),
            lease_ttl: settings.lease_ttl,
            renew_interval: settings.renew_interval,
            clock,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Acquire or renew the lease once.
    pub fn try_acquire(&self) -> ControllerResult<bool> {
        Ok(self.registry.try_acquire_lease(
            &self.lease_name,
            &self.identity,
            self.lease_ttl.as_secs().max(1),
            self.clock.now(),
        )?)
    }

    pub fn release(&self) -> ControllerResult<bool> {
        Ok(self.registry.release_lease(&self.lease_name, &self.identity)?)
    }

    /// Keep the lease renewed, publishing leadership changes on `leading`.
    /// Releases the lease on shutdown.
    pub async fn run(self, leading: watch::Sender<bool>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.renew_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let acquired = match self.try_acquire() {
                        Ok(acquired) => acquired,
                        Err(e) => {
                            warn!(lease = %self.lease_name, error = %e, "lease renewal failed");
                            false
                        }
                    };
                    let was_leading = *leading.borrow();
                    if acquired != was_leading {
                        if acquired {
                            info!(identity = %self.identity, lease = %self.lease_name, "became leader");
                        } else {
                            warn!(identity = %self.identity, lease = %self.lease_name, "lost leadership");
                        }
                        let _ = leading.send(acquired);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.release() {
            warn!(lease = %self.lease_name, error = %e, "lease release failed");
        }
        let _ = leading.send(false);
        info!(identity = %self.identity, "leader elector stopped");
    }
}
