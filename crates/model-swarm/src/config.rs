//! Swarm configuration.
//!
//! Defaults reproduce the reference network's constants. A YAML file may
//! override any subset:
//!
//! ```yaml
//! node:
//!   chunk_size: 1048576
//!   discovery_interval: 30s
//!   request_timeout: 5s
//! coordinator:
//!   idle_timeout: 1h
//!   bandwidth_reward_per_mb: 0.001
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{SwarmError, SwarmResult};
use crate::training::ResourceCapacity;

/// Per-node settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bytes per data chunk
    pub chunk_size: usize,
    /// Peer directory cap
    pub max_connections: usize,
    /// Period of the discovery loop
    #[serde(with = "humantime_serde")]
    pub discovery_interval: Duration,
    /// Period of the upload-queue drain loop (one item per tick)
    #[serde(with = "humantime_serde")]
    pub upload_interval: Duration,
    /// Peers not seen for this long are pruned on each discovery pass
    #[serde(with = "humantime_serde")]
    pub peer_stale_after: Duration,
    /// Timeout for a single chunk request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Attempts per chunk before giving up
    pub max_fetch_attempts: u32,
    /// Initial retry backoff, doubled per attempt
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Cap on the retry backoff
    #[serde(with = "humantime_serde")]
    pub max_retry_backoff: Duration,
    /// Discovery tracker hint embedded in locators
    pub tracker: String,
    /// Resources this node offers for training
    pub capacity: ResourceCapacity,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_connections: 50,
            discovery_interval: Duration::from_secs(30),
            upload_interval: Duration::from_secs(1),
            peer_stale_after: Duration::from_secs(10 * 60),
            request_timeout: Duration::from_secs(5),
            max_fetch_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            max_retry_backoff: Duration::from_secs(5),
            tracker: "stellarium-ai-tracker".to_string(),
            capacity: ResourceCapacity::default(),
            event_capacity: crate::events::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl NodeConfig {
    /// Backoff before retry number `attempt` (1-based), capped.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }
}

/// Network coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Nodes idle for longer than this are evicted by the cleanup sweep
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Per-node timeout for fan-out operations
    #[serde(with = "humantime_serde")]
    pub fan_out_timeout: Duration,
    /// Tokens credited per MiB served or fetched
    pub bandwidth_reward_per_mb: f64,
    /// Uptime recorded for a participant after bandwidth activity
    pub active_uptime_percentage: f64,
    /// Reward per hour for pools created without one
    pub default_reward_per_hour: f64,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60 * 60),
            fan_out_timeout: Duration::from_secs(30),
            bandwidth_reward_per_mb: 0.001,
            active_uptime_percentage: 99.5,
            default_reward_per_hour: 0.05,
            event_capacity: crate::events::EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub node: NodeConfig,
    pub coordinator: CoordinatorConfig,
}

impl SwarmConfig {
    /// Load from a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> SwarmResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
            .map_err(|e| SwarmError::Config(format!("{}: {e}", path.display())))
    }

    /// Parse from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> SwarmResult<String> {
        serde_yaml::to_string(self).map_err(|e| SwarmError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_constants() {
        let config = SwarmConfig::default();
        assert_eq!(config.node.chunk_size, 1024 * 1024);
        assert_eq!(config.node.max_connections, 50);
        assert_eq!(config.node.discovery_interval, Duration::from_secs(30));
        assert_eq!(config.node.upload_interval, Duration::from_secs(1));
        assert_eq!(config.coordinator.idle_timeout, Duration::from_secs(3600));
        assert_eq!(config.coordinator.bandwidth_reward_per_mb, 0.001);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let config = SwarmConfig::from_yaml_str(
            "node:\n  chunk_size: 4096\n  discovery_interval: 5s\ncoordinator:\n  idle_timeout: 10m\n",
        )
        .unwrap();
        assert_eq!(config.node.chunk_size, 4096);
        assert_eq!(config.node.discovery_interval, Duration::from_secs(5));
        assert_eq!(config.node.max_connections, 50);
        assert_eq!(config.coordinator.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_yaml_round_trip_and_file_errors() {
        let config = SwarmConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(SwarmConfig::from_yaml_str(&yaml).unwrap(), config);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "node: [").unwrap();
        assert!(matches!(
            SwarmConfig::from_yaml_file(&path),
            Err(SwarmError::Config(_))
        ));
        assert!(matches!(
            SwarmConfig::from_yaml_file(dir.path().join("missing.yaml")),
            Err(SwarmError::Io(_))
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = NodeConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for(40), Duration::from_secs(5));
    }
}
