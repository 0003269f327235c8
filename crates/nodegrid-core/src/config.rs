//! nodegrid.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;
use crate::types::{DisruptionBudget, InstanceShape, Provisioner};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodegridConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub allocation: AllocationSettings,
    #[serde(default)]
    pub consolidation: ConsolidationSettings,
    #[serde(default)]
    pub termination: TerminationSettings,
    #[serde(default)]
    pub leader: LeaderSettings,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub provisioners: Vec<Provisioner>,
    #[serde(default)]
    pub disruption_budgets: Vec<DisruptionBudget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Worker pool size per controller queue.
    pub workers: usize,
    /// Periodic full resync of every provisioner and node.
    #[serde(with = "duration_str")]
    pub resync_interval: Duration,
    /// How long a Pending node may wait for its instance to come up.
    #[serde(with = "duration_str")]
    pub registration_ttl: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(30),
            registration_ttl: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationSettings {
    /// Launch attempts per shape before falling back to the next cheapest.
    pub launch_attempts: u32,
    #[serde(with = "duration_str")]
    pub launch_backoff_base: Duration,
    #[serde(with = "duration_str")]
    pub launch_backoff_max: Duration,
    /// Claims older than this are considered abandoned.
    #[serde(with = "duration_str")]
    pub claim_ttl: Duration,
    /// Untracked backend instances older than this are terminated.
    #[serde(with = "duration_str")]
    pub orphan_grace: Duration,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            launch_attempts: 3,
            launch_backoff_base: Duration::from_millis(500),
            launch_backoff_max: Duration::from_secs(30),
            claim_ttl: Duration::from_secs(5 * 60),
            orphan_grace: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationSettings {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Minimum node age before it may be considered for removal.
    #[serde(with = "duration_str")]
    pub cooldown: Duration,
    /// Nodes whose highest-dimension utilization is below this are candidates.
    pub utilization_threshold: f64,
    pub max_drains_per_cycle: usize,
    /// Nodes whose removal failed within this window are skipped.
    #[serde(with = "duration_str")]
    pub removal_failure_cooldown: Duration,
}

impl Default for ConsolidationSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(5 * 60),
            utilization_threshold: 0.5,
            max_drains_per_cycle: 1,
            removal_failure_cooldown: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminationSettings {
    #[serde(with = "duration_str")]
    pub drain_timeout: Duration,
    /// Terminate a node whose drain timed out even if workloads remain.
    pub force: bool,
    #[serde(with = "duration_str")]
    pub eviction_backoff_base: Duration,
    #[serde(with = "duration_str")]
    pub eviction_backoff_max: Duration,
    #[serde(with = "duration_str")]
    pub terminate_backoff_base: Duration,
    #[serde(with = "duration_str")]
    pub terminate_backoff_max: Duration,
}

impl Default for TerminationSettings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10 * 60),
            force: false,
            eviction_backoff_base: Duration::from_secs(1),
            eviction_backoff_max: Duration::from_secs(60),
            terminate_backoff_base: Duration::from_secs(1),
            terminate_backoff_max: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderSettings {
    pub lease_name: String,
    #[serde(with = "duration_str")]
    pub lease_ttl: Duration,
    #[serde(with = "duration_str")]
    pub renew_interval: Duration,
}

impl Default for LeaderSettings {
    fn default() -> Self {
        Self {
            lease_name: "nodegrid-controller".to_string(),
            lease_ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// Capacity backend selection. Exactly one backend is active per process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process simulated cloud offering a fixed catalog of shapes.
    Fake {
        #[serde(default)]
        shapes: Vec<InstanceShape>,
    },
    /// Fixed pool of pre-provisioned machines (on-prem).
    Inventory {
        #[serde(default)]
        machines: Vec<MachineSpec>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Fake { shapes: Vec::new() }
    }
}

/// One machine in an inventory pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub id: String,
    pub instance_type: String,
    pub zone: String,
    pub capacity: ResourceVector,
    #[serde(default)]
    pub cost: f64,
}

impl NodegridConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: NodegridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Structural checks on the daemon's own settings.
    ///
    /// Provisioner specs are validated before they reach the controller,
    /// so only duplicate names are rejected here.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.controller.workers == 0 {
            return Err(ConfigError::Invalid("controller.workers must be > 0".into()));
        }
        if self.allocation.launch_attempts == 0 {
            return Err(ConfigError::Invalid(
                "allocation.launch_attempts must be > 0".into(),
            ));
        }
        let threshold = self.consolidation.utilization_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "consolidation.utilization_threshold must be within 0..=1, got {threshold}"
            )));
        }
        if self.leader.renew_interval >= self.leader.lease_ttl {
            return Err(ConfigError::Invalid(
                "leader.renew_interval must be shorter than leader.lease_ttl".into(),
            ));
        }
        let mut names: Vec<&str> = self.provisioners.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid(format!(
                "duplicate provisioner '{}'",
                dup[0]
            )));
        }
        Ok(())
    }
}

/// Parse a human duration: `500ms`, `30s`, `5m`, `1h`, or bare seconds.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().map(Duration::from_millis).map_err(|_| invalid());
    }
    let (digits, unit) = if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else {
        (s, 1)
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(unit))
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Render a duration in the shortest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
