//! Migration orchestrator configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration:
//!
//! ```toml
//! check_interval = "24h"
//! queue_capacity = 16
//! sync_state_capacity = 64
//! skip_initial_sync_state = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    /// Minimum interval between two migration checks.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// Bound of the sequencer request queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bound of the sync state channel feeding the trigger.
    #[serde(default = "default_sync_state_capacity")]
    pub sync_state_capacity: usize,

    /// Whether the trigger ignores the first sync state it observes.
    #[serde(default)]
    pub skip_initial_sync_state: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            queue_capacity: default_queue_capacity(),
            sync_state_capacity: default_sync_state_capacity(),
            skip_initial_sync_state: false,
        }
    }
}

impl MigrationConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(ConfigError::Validation(
                "check_interval must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.sync_state_capacity == 0 {
            return Err(ConfigError::Validation(
                "sync_state_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

const fn default_check_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

const fn default_queue_capacity() -> usize {
    16
}

const fn default_sync_state_capacity() -> usize {
    64
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
