//! Scheduler configuration.

#[cfg(feature = "serde")]
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid scheduler config: {0}")]
    Invalid(String),

    #[cfg(feature = "serde")]
    #[error("failed to read scheduler config from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[cfg(feature = "serde")]
    #[error("failed to parse scheduler config: {0}")]
    Parse(#[source] serde_yaml::Error),
}

/// Limits and policies of one [`BehaviorTreeComponent`](crate::BehaviorTreeComponent).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SchedulerConfig {
    /// Maximum number of stacked tree instances. A push beyond it fails the pushing task.
    pub max_instance_depth: usize,

    /// Node visits allowed in a single search before it is abandoned as malformed.
    pub max_search_steps: usize,

    /// Searches processed per tick; bounds chains of instantly finishing tasks.
    pub max_searches_per_tick: usize,

    /// Restart the root tree on the next tick after it finishes.
    pub loop_root: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_instance_depth: 16,
            max_search_steps: 4096,
            max_searches_per_tick: 64,
            loop_root: true,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instance_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_instance_depth must be at least 1".to_string(),
            ));
        }
        if self.max_search_steps == 0 {
            return Err(ConfigError::Invalid(
                "max_search_steps must be at least 1".to_string(),
            ));
        }
        if self.max_searches_per_tick == 0 {
            return Err(ConfigError::Invalid(
                "max_searches_per_tick must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
impl SchedulerConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = SchedulerConfig {
            max_searches_per_tick: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
