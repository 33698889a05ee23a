//! Node configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration. Durations are carried as milliseconds.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ddata::types::WriteConsistency;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub registry: RegistryConfig,
    pub membership: MembershipConfig,
    pub replicator: ReplicatorConfig,
}

impl NodeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.registry.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval between two publications of the local claim index.
    pub update_interval_ms: u64,
    pub write_consistency: WriteConsistency,
    pub inbox_capacity: usize,
}

impl RegistryConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_interval_ms == 0 {
            anyhow::bail!("registry.update_interval_ms must be positive");
        }
        if self.inbox_capacity == 0 {
            anyhow::bail!("registry.inbox_capacity must be positive");
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 3_000,
            write_consistency: WriteConsistency::Local,
            inbox_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub gossip_interval_ms: u64,
    pub failure_detection_interval_ms: u64,
    pub suspect_timeout_ms: u64,
    pub dead_timeout_ms: u64,
}

impl MembershipConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn failure_detection_interval(&self) -> Duration {
        Duration::from_millis(self.failure_detection_interval_ms)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_timeout_ms)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout_ms)
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 500,
            failure_detection_interval_ms: 2_000,
            suspect_timeout_ms: 5_000,
            dead_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    pub gossip_interval_ms: u64,
    /// Age after which tombstones are dropped and older entries refused.
    /// Must be far above the registry update interval.
    pub tombstone_retention_ms: u64,
}

impl ReplicatorConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 1_000,
            tombstone_retention_ms: 86_400_000,
        }
    }
}
