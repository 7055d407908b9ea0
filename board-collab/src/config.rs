//! Engine configuration.
//!
//! Durations are stored as integer milliseconds so a config can be loaded
//! from JSON without custom deserializers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ProtocolError;

/// Awareness protocol timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwarenessConfig {
    /// Re-send the local snapshot this often even without changes.
    pub heartbeat_interval_ms: u64,
    /// Remote entries older than this are garbage-collected.
    pub timeout_ms: u64,
    /// Lower bound between two outbound snapshots (30fps).
    pub min_broadcast_interval_ms: u64,
    /// How often the stale-entry sweep runs.
    pub sweep_interval_ms: u64,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            timeout_ms: 30_000,
            min_broadcast_interval_ms: 33,
            sweep_interval_ms: 5_000,
        }
    }
}

impl AwarenessConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.min_broadcast_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Offline queue bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Maximum queued changes; the oldest entry is evicted beyond this.
    pub max_queue_len: usize,
    /// Periodic drain attempt interval.
    pub sync_interval_ms: u64,
    /// Quiet period after the last element change before the board snapshot
    /// is written to the local store.
    pub snapshot_debounce_ms: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_queue_len: 10_000,
            sync_interval_ms: 30_000,
            snapshot_debounce_ms: 500,
        }
    }
}

impl OfflineConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn snapshot_debounce(&self) -> Duration {
        Duration::from_millis(self.snapshot_debounce_ms)
    }
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
    /// `None` retries forever (still bounded per attempt by `max_delay_ms`).
    pub max_attempts: Option<u32>,
    /// Ping interval used for latency sampling.
    pub ping_interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2,
            max_attempts: None,
            ping_interval_ms: 5_000,
        }
    }
}

/// Top-level configuration for one collaboration session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub awareness: AwarenessConfig,
    pub offline: OfflineConfig,
    pub reconnect: ReconnectConfig,
    /// Messages buffered per board channel receiver before lagging.
    pub channel_capacity: usize,
}

impl CollabConfig {
    /// Short intervals so timers fire within a test's lifetime.
    pub fn for_testing() -> Self {
        Self {
            awareness: AwarenessConfig {
                heartbeat_interval_ms: 50,
                timeout_ms: 200,
                min_broadcast_interval_ms: 0,
                sweep_interval_ms: 20,
            },
            offline: OfflineConfig {
                max_queue_len: 100,
                sync_interval_ms: 50,
                snapshot_debounce_ms: 10,
            },
            reconnect: ReconnectConfig {
                initial_delay_ms: 10,
                max_delay_ms: 100,
                multiplier: 2,
                max_attempts: Some(5),
                ping_interval_ms: 50,
            },
            channel_capacity: 64,
        }
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn channel_capacity(&self) -> usize {
        if self.channel_capacity == 0 {
            256
        } else {
            self.channel_capacity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.awareness.timeout(), Duration::from_secs(30));
        assert_eq!(config.awareness.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.offline.max_queue_len, 10_000);
        assert_eq!(config.offline.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.offline.snapshot_debounce(), Duration::from_millis(500));
        assert_eq!(config.channel_capacity(), 256);
    }

    #[test]
    fn test_from_json_partial() {
        let config = CollabConfig::from_json(r#"{"offline": {"max_queue_len": 5}}"#).unwrap();
        assert_eq!(config.offline.max_queue_len, 5);
        assert_eq!(config.offline.sync_interval_ms, 30_000);
        assert_eq!(config.awareness, AwarenessConfig::default());
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(CollabConfig::from_json("not json").is_err());
    }
}
