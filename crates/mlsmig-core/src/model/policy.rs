//! Backend-sourced feature configuration consumed by the migration.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SupportedProtocol;

/// On/off status of a backend feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// The feature is enabled for the team.
    Enabled,
    /// The feature is disabled for the team.
    Disabled,
}

impl FeatureStatus {
    /// Returns `true` for [`FeatureStatus::Enabled`].
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Time-windowed migration policy.
///
/// Both predicates are conservative: a missing `start_time` means the
/// migration has not started even when the status is enabled, and a missing
/// `end_time` means it never ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPolicy {
    /// Feature status.
    pub status: FeatureStatus,
    /// Instant after which Proteus conversations may be migrated.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Instant after which remaining conversations are force-finalised.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl MigrationPolicy {
    /// Policy assumed when none has been stored yet.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            status: FeatureStatus::Disabled,
            start_time: Some(DateTime::<Utc>::MAX_UTC),
            end_time: Some(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Returns `true` once the migration window has opened.
    #[must_use]
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.status.is_enabled() && self.start_time.is_some_and(|start| now > start)
    }

    /// Returns `true` once the migration window has closed.
    #[must_use]
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.status.is_enabled() && self.end_time.is_some_and(|end| now > end)
    }
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// MLS enablement configuration for the team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlsFeatureConfig {
    /// Feature status.
    pub status: FeatureStatus,
    /// Protocol new conversations should use.
    pub default_protocol: SupportedProtocol,
    /// Protocols the team allows.
    pub supported_protocols: BTreeSet<SupportedProtocol>,
}

impl Default for MlsFeatureConfig {
    fn default() -> Self {
        Self {
            status: FeatureStatus::Disabled,
            default_protocol: SupportedProtocol::Proteus,
            supported_protocols: BTreeSet::from([SupportedProtocol::Proteus]),
        }
    }
}

/// The subset of the backend feature configuration used by the migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfigs {
    /// MLS enablement.
    #[serde(default)]
    pub mls: MlsFeatureConfig,
    /// Migration window.
    #[serde(default)]
    pub mls_migration: MigrationPolicy,
}
