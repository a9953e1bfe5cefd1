use crate::bridge::{IPC_REFERENCE_VALUE, MAX_CHANNEL_DEPTH};
use crate::health::DEFAULT_ATTEMPT_BOUND;
use crate::limits::LimitConfig;
use crate::link::LinkTiming;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_HOUSEKEEPING_PERIOD_MS: u64 = 10_000;
const DEFAULT_EDGE_TIMEOUT_MS: u64 = 10;
const DEFAULT_MAX_EDGE_POLLS: u32 = 100;
const DEFAULT_LINK_SETUP_ATTEMPTS: u8 = 5;
const DEFAULT_LINK_TEST_TIMEOUT_MS: u64 = 500;
const DEFAULT_RESET_SETTLE_MS: u64 = 250;
const DEFAULT_ERROR_ACK_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
}

/// Runtime settings. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Validate attempts before a device is declared faulted.
    pub attempt_bound: u8,
    pub housekeeping_period_ms: u64,
    pub edge_timeout_ms: u64,
    pub max_edge_polls: u32,
    pub link_setup_attempts: u8,
    pub link_test_timeout_ms: u64,
    /// Pause after a temperature sensor reset before it is reconfigured.
    pub reset_settle_ms: u64,
    pub error_ack_timeout_ms: u64,
    pub ipc_reference: u8,
    pub channel_depth: usize,
    pub limits: LimitConfig,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            attempt_bound: DEFAULT_ATTEMPT_BOUND,
            housekeeping_period_ms: DEFAULT_HOUSEKEEPING_PERIOD_MS,
            edge_timeout_ms: DEFAULT_EDGE_TIMEOUT_MS,
            max_edge_polls: DEFAULT_MAX_EDGE_POLLS,
            link_setup_attempts: DEFAULT_LINK_SETUP_ATTEMPTS,
            link_test_timeout_ms: DEFAULT_LINK_TEST_TIMEOUT_MS,
            reset_settle_ms: DEFAULT_RESET_SETTLE_MS,
            error_ack_timeout_ms: DEFAULT_ERROR_ACK_TIMEOUT_MS,
            ipc_reference: IPC_REFERENCE_VALUE,
            channel_depth: MAX_CHANNEL_DEPTH,
            limits: LimitConfig::default(),
        }
    }
}

impl PayloadConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.attempt_bound == 0 {
            return Err(ConfigError::Zero { field: "attempt_bound" });
        }
        if self.housekeeping_period_ms == 0 {
            return Err(ConfigError::Zero { field: "housekeeping_period_ms" });
        }
        if self.max_edge_polls == 0 {
            return Err(ConfigError::Zero { field: "max_edge_polls" });
        }
        if self.link_setup_attempts == 0 {
            return Err(ConfigError::Zero { field: "link_setup_attempts" });
        }
        if self.channel_depth == 0 {
            return Err(ConfigError::Zero { field: "channel_depth" });
        }
        Ok(())
    }

    #[must_use]
    pub fn housekeeping_period(&self) -> Duration {
        Duration::from_millis(self.housekeeping_period_ms)
    }

    #[must_use]
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    #[must_use]
    pub fn link_test_timeout(&self) -> Duration {
        Duration::from_millis(self.link_test_timeout_ms)
    }

    #[must_use]
    pub fn error_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.error_ack_timeout_ms)
    }

    #[must_use]
    pub fn link_timing(&self) -> LinkTiming {
        LinkTiming {
            edge_timeout: Duration::from_millis(self.edge_timeout_ms),
            max_polls: self.max_edge_polls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = PayloadConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PayloadConfig::default());
        assert_eq!(config.attempt_bound, 5);
        assert_eq!(config.housekeeping_period(), Duration::from_secs(10));
        assert_eq!(config.ipc_reference, 53);
    }

    #[test]
    fn test_partial_override() {
        let config =
            PayloadConfig::from_json_str(r#"{"attempt_bound": 3, "reset_settle_ms": 0}"#).unwrap();
        assert_eq!(config.attempt_bound, 3);
        assert!(config.reset_settle().is_zero());
        assert_eq!(config.max_edge_polls, 100);
    }

    #[test]
    fn test_zero_bound_rejected() {
        let err = PayloadConfig::from_json_str(r#"{"attempt_bound": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Zero { field: "attempt_bound" }));
    }

    #[test]
    fn test_limits_override() {
        let config = PayloadConfig::from_json_str(
            r#"{"limits": {"current_ma": [{"min": -10.0, "max": 10.0},
                                          {"min": -20.0, "max": 20.0},
                                          {"min": -30.0, "max": 30.0}]}}"#,
        )
        .unwrap();
        assert!((config.limits.current_ma[2].max - 30.0).abs() < f32::EPSILON);
        assert!((config.limits.temperature_c[0].min + 50.0).abs() < f32::EPSILON);
    }
}
