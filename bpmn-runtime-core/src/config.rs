//! Engine configuration, loaded from YAML with every field defaulted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a signal broadcast does when triggering one subscription fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    /// Attempt every matching subscription, then surface the first failure.
    #[default]
    Continue,
    /// Stop at the first failing subscription.
    FailFast,
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Strings longer than this many characters are stored as long strings.
    pub long_string_threshold: usize,
    /// Upper bound on executor steps inside one operation.
    pub max_steps_per_operation: usize,
    pub broadcast_failure_policy: BroadcastPolicy,
    /// Reason recorded when a process instance is deleted without one.
    pub default_delete_reason: String,
    /// When false, no history events are handed to the recorder.
    pub history_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            long_string_threshold: 4000,
            max_steps_per_operation: 10_000,
            broadcast_failure_policy: BroadcastPolicy::Continue,
            default_delete_reason: "Process instance deleted".to_string(),
            history_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Parsing engine config")
    }

    /// Load from a YAML file. Missing keys take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = EngineConfig::from_yaml_str(
            "long_string_threshold: 16\nbroadcast_failure_policy: fail_fast\n",
        )
        .unwrap();
        assert_eq!(cfg.long_string_threshold, 16);
        assert_eq!(cfg.broadcast_failure_policy, BroadcastPolicy::FailFast);
        assert_eq!(cfg.max_steps_per_operation, 10_000);
        assert_eq!(cfg.default_delete_reason, "Process instance deleted");
        assert!(cfg.history_enabled);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        assert!(EngineConfig::from_yaml_str("broadcast_failure_policy: sometimes\n").is_err());
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = EngineConfig::load_from_file(Path::new("/nonexistent/engine.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/engine.yaml"));
    }
}
