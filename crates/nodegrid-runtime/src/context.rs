//! Explicit controller context.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use nodegrid_backend::CapacityBackend;
use nodegrid_core::NodegridConfig;
use nodegrid_state::{Condition, NodeRegistry, epoch_secs};

use crate::error::ControllerResult;

/// Source of "now" in Unix seconds.
///
/// `Clock::manual` is driven by tests so that cool-downs, TTLs and drain
/// timeouts can be crossed without sleeping.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    manual: Option<Arc<AtomicU64>>,
}

impl Clock {
    pub fn system() -> Self {
        Self { manual: None }
    }

    pub fn manual(start: u64) -> Self {
        Self {
            manual: Some(Arc::new(AtomicU64::new(start))),
        }
    }

    pub fn now(&self) -> u64 {
        match &self.manual {
            Some(now) => now.load(Ordering::SeqCst),
            None => epoch_secs(),
        }
    }

    /// Move a manual clock forward. No effect on the system clock.
    pub fn advance(&self, secs: u64) {
        match &self.manual {
            Some(now) => {
                now.fetch_add(secs, Ordering::SeqCst);
            }
            None => warn!("advance() called on the system clock"),
        }
    }
}

/// Everything a controller needs, constructed once at startup.
#[derive(Clone)]
pub struct ControllerContext {
    pub registry: NodeRegistry,
    pub backend: Arc<dyn CapacityBackend>,
    pub config: Arc<NodegridConfig>,
    pub clock: Clock,
}

impl ControllerContext {
    pub fn new(
        registry: NodeRegistry,
        backend: Arc<dyn CapacityBackend>,
        config: NodegridConfig,
        clock: Clock,
    ) -> Self {
        Self {
            registry,
            backend,
            config: Arc::new(config),
            clock,
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Record a status condition on an object.
    pub fn set_condition(
        &self,
        kind: &str,
        name: &str,
        type_: &str,
        reason: &str,
        message: String,
    ) -> ControllerResult<()> {
        let condition = Condition::new(kind, name, type_, reason, message, self.now());
        self.registry.set_condition(&condition)?;
        Ok(())
    }

    /// Clear a condition once the problem it described is gone.
    pub fn clear_condition(&self, kind: &str, name: &str, type_: &str) -> ControllerResult<()> {
        self.registry.clear_condition(kind, name, type_)?;
        Ok(())
    }
}
