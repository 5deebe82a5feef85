//! Structured logging for stateroom.
//!
//! The library itself only emits `tracing` events; this module is the
//! opt-in subscriber setup for embedders that don't bring their own.
//!
//! # Usage
//!
//! Initialize once at startup:
//!
//! ```
//! use stateroom_core::logging::{LogConfig, init_logging};
//!
//! init_logging(&LogConfig::default()).unwrap();
//! ```
//!
//! # Correlation fields
//!
//! Events use these field names consistently:
//! - `session`: session key
//! - `error`: failure being absorbed or translated
//! - `count`: batch sizes in eviction passes

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;

/// Output format for log events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-friendly output for interactive use.
    #[default]
    Pretty,
    /// JSON lines for machine consumption.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g. `info`, `stateroom_core=debug`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Set once the global subscriber has been installed.
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// Idempotent: later calls (including from other crates' test harnesses)
/// are no-ops. `RUST_LOG` overrides the configured level when set.
pub fn init_logging(config: &LogConfig) -> Result<(), ConfigError> {
    let configured = EnvFilter::try_new(&config.level)
        .map_err(|err| ConfigError::Invalid(format!("bad log filter: {err}")))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    if LOGGING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format {
        LogFormat::Pretty => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };
    // A foreign subscriber may already be installed; that is fine.
    let _ = LOGGING_INITIALIZED.set(installed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_pretty_info() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn init_is_idempotent() {
        let config = LogConfig::default();
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }

    #[test]
    fn bad_filter_is_rejected() {
        let config = LogConfig {
            level: "====".to_string(),
            format: LogFormat::Pretty,
        };
        assert!(matches!(
            init_logging(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn format_round_trips_through_serde() {
        let json = serde_json::to_string(&LogFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");
        let back: LogFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LogFormat::Json);
    }
}
