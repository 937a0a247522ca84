//! Engine configuration
//!
//! Tunables for admission control, merge limits and connection aging.
//! Loaded from JSON and swappable at runtime through the engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_FANOUT, DEFAULT_MAX_MERGED_FLOWS,
    DEFAULT_MAX_REWRITES, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT,
};

/// Miniflow engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiniflowConfig {
    /// Register merged flows with connection entries and run the aging loop
    pub aging_enabled: bool,
    /// Idle time after which a connection entry is aged out
    pub idle_timeout_secs: u64,
    /// Aging loop period
    pub aging_interval_ms: u64,
    /// Cap on installed plus queued merged flows
    pub max_merged_flows: usize,
    /// Queued merge requests above which new merges are refused
    pub queue_capacity: usize,
    /// Merge worker tasks
    pub worker_count: usize,
    /// Maximum forward destinations in one merged flow
    pub max_fanout: usize,
    /// Maximum header rewrites in one merged flow
    pub max_rewrites: usize,
    /// Merge roughly one eligible chain in N; 0 merges every chain
    pub merge_sample_rate: u32,
}

impl Default for MiniflowConfig {
    fn default() -> Self {
        Self {
            aging_enabled: true,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            aging_interval_ms: 1000,
            max_merged_flows: DEFAULT_MAX_MERGED_FLOWS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_count: DEFAULT_WORKER_COUNT,
            max_fanout: DEFAULT_MAX_FANOUT,
            max_rewrites: DEFAULT_MAX_REWRITES,
            merge_sample_rate: 0,
        }
    }
}

impl MiniflowConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_count",
                reason: "must be at least 1",
            });
        }
        if self.max_fanout == 0 {
            return Err(ConfigError::Invalid {
                field: "max_fanout",
                reason: "must be at least 1",
            });
        }
        if self.aging_enabled && self.aging_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "aging_interval_ms",
                reason: "must be non-zero while aging is enabled",
            });
        }
        Ok(())
    }

    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Aging period as a duration
    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }
}
