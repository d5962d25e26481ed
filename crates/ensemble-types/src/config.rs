//! Engine configuration types for Ensemble.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default, so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

/// When the engine captures automatic checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// After every completed or skipped step.
    #[default]
    EveryStep,
    /// After completed steps only.
    CompletedOnly,
    /// Never automatically.
    ExplicitOnly,
}

impl CheckpointPolicy {
    pub fn after_completed(self) -> bool {
        matches!(self, CheckpointPolicy::EveryStep | CheckpointPolicy::CompletedOnly)
    }

    pub fn after_skipped(self) -> bool {
        self == CheckpointPolicy::EveryStep
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Token estimate above which a context summary is maintained.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u64,

    /// Number of most recent step summaries included in a context summary.
    #[serde(default = "default_summary_recent_steps")]
    pub summary_recent_steps: usize,

    /// Agent timeout for steps that do not set their own.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Attempts at a conditional write before reporting a conflict.
    #[serde(default = "default_context_write_attempts")]
    pub context_write_attempts: u32,

    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,

    /// Page size used when a caller does not supply one.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    /// Capacity of the live event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_max_context_tokens() -> u64 {
    8_000
}

fn default_summary_recent_steps() -> usize {
    3
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_context_write_attempts() -> u32 {
    3
}

fn default_page_size() -> u32 {
    20
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            summary_recent_steps: default_summary_recent_steps(),
            step_timeout_secs: default_step_timeout_secs(),
            context_write_attempts: default_context_write_attempts(),
            checkpoint_policy: CheckpointPolicy::default(),
            default_page_size: default_page_size(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_context_tokens, 8_000);
        assert_eq!(config.summary_recent_steps, 3);
        assert_eq!(config.step_timeout_secs, 300);
        assert_eq!(config.context_write_attempts, 3);
        assert_eq!(config.checkpoint_policy, CheckpointPolicy::EveryStep);
        assert_eq!(config.default_page_size, 20);
        assert_eq!(config.event_bus_capacity, 1024);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_context_tokens = 2000
step_timeout_secs = 30
checkpoint_policy = "completed_only"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_context_tokens, 2000);
        assert_eq!(config.step_timeout_secs, 30);
        assert_eq!(config.checkpoint_policy, CheckpointPolicy::CompletedOnly);
        assert_eq!(config.summary_recent_steps, 3);
    }

    #[test]
    fn test_checkpoint_policy_cadence() {
        assert!(CheckpointPolicy::EveryStep.after_completed());
        assert!(CheckpointPolicy::EveryStep.after_skipped());
        assert!(CheckpointPolicy::CompletedOnly.after_completed());
        assert!(!CheckpointPolicy::CompletedOnly.after_skipped());
        assert!(!CheckpointPolicy::ExplicitOnly.after_completed());
        assert!(!CheckpointPolicy::ExplicitOnly.after_skipped());
    }
}
