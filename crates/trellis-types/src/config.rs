//! Engine configuration types for Trellis.
//!
//! `EngineConfig` represents the `engine.toml` file that controls retry
//! defaults, timeouts, checkpoint write policy and event bus sizing.

use serde::{Deserialize, Serialize};

use crate::workflow::BackoffConfig;

/// Top-level configuration for the workflow engine.
///
/// Loaded from `{data_dir}/engine.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per node when neither the step nor the workflow sets one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Backoff used when the workflow declares no retry config.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Step timeout when the step declares none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Timeout for delegated decisions when the criterion declares none.
    #[serde(default = "default_oracle_timeout_secs")]
    pub oracle_timeout_secs: u64,

    /// Attempts per checkpoint write before entering degraded mode.
    #[serde(default = "default_checkpoint_write_attempts")]
    pub checkpoint_write_attempts: u32,

    /// Linear backoff step between checkpoint write attempts.
    #[serde(default = "default_checkpoint_backoff_ms")]
    pub checkpoint_backoff_ms: u64,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Upper bound on node executions per workflow.
    #[serde(default = "default_max_transitions")]
    pub max_transitions: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_oracle_timeout_secs() -> u64 {
    30
}

fn default_checkpoint_write_attempts() -> u32 {
    3
}

fn default_checkpoint_backoff_ms() -> u64 {
    50
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_transitions() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            backoff: BackoffConfig::default(),
            default_step_timeout_secs: default_step_timeout_secs(),
            oracle_timeout_secs: default_oracle_timeout_secs(),
            checkpoint_write_attempts: default_checkpoint_write_attempts(),
            checkpoint_backoff_ms: default_checkpoint_backoff_ms(),
            event_capacity: default_event_capacity(),
            max_transitions: default_max_transitions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.default_step_timeout_secs, 300);
        assert_eq!(config.oracle_timeout_secs, 30);
        assert_eq!(config.checkpoint_write_attempts, 3);
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.max_transitions, 1000);
        assert_eq!(
            config.backoff,
            BackoffConfig::Exponential {
                initial_ms: 500,
                factor: 2.0,
                max_ms: 30_000
            }
        );
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
default_max_retries = 5
default_step_timeout_secs = 60
max_transitions = 50

[backoff]
strategy = "fixed"
delay_ms = 250
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_max_retries, 5);
        assert_eq!(config.default_step_timeout_secs, 60);
        assert_eq!(config.max_transitions, 50);
        assert_eq!(config.backoff, BackoffConfig::Fixed { delay_ms: 250 });
        assert_eq!(config.checkpoint_backoff_ms, 50);
    }

    #[test]
    fn test_engine_config_serde_roundtrip() {
        let config = EngineConfig {
            oracle_timeout_secs: 5,
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
