//! Container configuration.
//!
//! Handles loading and validation of the container's tuning knobs: eviction
//! queue capacity, bulk passivation batch size, and the idle timeout applied
//! to queued and persisted sessions.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Container tuning configuration.
///
/// All fields have working defaults, so `ContainerConfig::default()` and an
/// empty TOML document produce the same, usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Eviction queue capacity. When the queue reaches this length a bulk
    /// eviction pass runs synchronously on the thread that filled it.
    /// Capacity 0 degenerates to "evict one entry on every checkin".
    pub capacity: usize,

    /// Maximum entries persisted per eviction pass. Clamped to `capacity`.
    pub bulk_passivate: usize,

    /// Idle timeout for queued and persisted sessions. `None` disables
    /// expiry entirely. Evaluated lazily at obtain/eviction time; there is
    /// no background timer.
    pub idle_timeout: Option<Duration>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            bulk_passivate: default_bulk_passivate(),
            idle_timeout: Some(default_idle_timeout()),
        }
    }
}

fn default_capacity() -> usize {
    500
}

fn default_bulk_passivate() -> usize {
    100
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

impl ContainerConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity > 0 && self.bulk_passivate == 0 {
            return Err(ConfigError::Invalid(
                "bulk_passivate must be at least 1 when capacity is non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective batch size for one eviction pass.
    ///
    /// Capacity 0 forces a batch of exactly 1; otherwise the configured
    /// batch is clamped to `1..=capacity`.
    #[must_use]
    pub fn effective_bulk(&self) -> usize {
        if self.capacity == 0 {
            1
        } else {
            self.bulk_passivate.clamp(1, self.capacity)
        }
    }

    /// True if `idle` exceeds the configured timeout.
    #[must_use]
    pub fn is_expired(&self, idle: Duration) -> bool {
        match self.idle_timeout {
            Some(timeout) => idle > timeout,
            None => false,
        }
    }
}
