//! Handlers that apply backend feature configuration to local storage.
//!
//! The worker calls both handlers on every run, before any migration
//! decision, so the cached [`MigrationPolicy`] always matches the backend.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CoreFailure, StorageError};
use crate::model::{MigrationPolicy, MlsFeatureConfig, SupportedProtocol};
use crate::ports::{SupportedProtocolsUpdater, UserConfigStore};

/// Applies the MLS enablement configuration.
pub struct MlsConfigHandler {
    user_config: Arc<dyn UserConfigStore>,
    protocols_updater: Arc<dyn SupportedProtocolsUpdater>,
}

impl MlsConfigHandler {
    /// Creates a new handler.
    #[must_use]
    pub fn new(
        user_config: Arc<dyn UserConfigStore>,
        protocols_updater: Arc<dyn SupportedProtocolsUpdater>,
    ) -> Self {
        Self {
            user_config,
            protocols_updater,
        }
    }

    /// Stores the MLS flags and re-evaluates the self user's supported
    /// protocols if the team's protocol set changed.
    pub async fn handle(
        &self,
        config: &MlsFeatureConfig,
        during_slow_sync: bool,
    ) -> Result<(), CoreFailure> {
        let mls_enabled = config.status.is_enabled();
        let previous = match self.user_config.supported_protocols().await {
            Ok(protocols) => protocols,
            Err(StorageError::NotFound { .. }) => BTreeSet::from([SupportedProtocol::Proteus]),
            Err(e) => return Err(e.into()),
        };
        let protocols_changed = previous != config.supported_protocols;

        self.user_config.set_mls_enabled(mls_enabled).await?;
        let default_protocol = if mls_enabled {
            config.default_protocol
        } else {
            SupportedProtocol::Proteus
        };
        self.user_config
            .set_default_protocol(default_protocol)
            .await?;
        self.user_config
            .set_supported_protocols(config.supported_protocols.clone())
            .await?;

        debug!(
            mls_enabled,
            ?default_protocol,
            protocols_changed,
            "Applied MLS feature config"
        );

        if protocols_changed {
            if let Err(e) = self
                .protocols_updater
                .update_supported_protocols(!during_slow_sync)
                .await
            {
                warn!(error = %e, "Failed to update self supported protocols");
            }
        }
        Ok(())
    }
}

/// Applies the MLS migration window.
pub struct MlsMigrationConfigHandler {
    user_config: Arc<dyn UserConfigStore>,
    protocols_updater: Arc<dyn SupportedProtocolsUpdater>,
}

impl MlsMigrationConfigHandler {
    /// Creates a new handler.
    #[must_use]
    pub fn new(
        user_config: Arc<dyn UserConfigStore>,
        protocols_updater: Arc<dyn SupportedProtocolsUpdater>,
    ) -> Self {
        Self {
            user_config,
            protocols_updater,
        }
    }

    /// Persists the migration policy.
    ///
    /// Outside slow sync the self user's supported protocols are re-evaluated,
    /// since the end of the window changes them. During slow sync the
    /// protocol evaluation runs as its own sync step.
    pub async fn handle(
        &self,
        policy: &MigrationPolicy,
        during_slow_sync: bool,
    ) -> Result<(), CoreFailure> {
        self.user_config
            .set_migration_policy(policy.clone())
            .await?;
        debug!(
            status = ?policy.status,
            start_time = ?policy.start_time,
            end_time = ?policy.end_time,
            "Stored MLS migration policy"
        );

        if !during_slow_sync {
            if let Err(e) = self.protocols_updater.update_supported_protocols(true).await {
                warn!(error = %e, "Failed to update self supported protocols");
            }
        }
        Ok(())
    }
}
