//! Migration worker: keeps the policy fresh, then drives the executor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{MigrationError, StorageError};
use crate::feature_config::{MlsConfigHandler, MlsMigrationConfigHandler};
use crate::migrator::{MigrationExecutor, PassReport};
use crate::ports::{FeatureConfigSource, SupportedProtocolsUpdater, UserConfigStore};

/// What a single worker run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationRun {
    /// No migration policy is stored.
    NoPolicy,
    /// The policy exists but the migration window has not opened.
    NotStarted,
    /// The executor ran a migrate pass followed by a finalise pass.
    Completed {
        /// Proteus to Mixed pass.
        migrated: PassReport,
        /// Mixed to MLS pass.
        finalised: PassReport,
        /// Whether the finalise pass ignored readiness because the window
        /// had closed.
        window_closed: bool,
    },
}

/// Entry point the sequencer calls once a run is due.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    /// Syncs feature configuration and runs whatever migration step the
    /// policy currently allows.
    async fn run_migration(&self) -> Result<MigrationRun, MigrationError>;
}

/// Default [`MigrationRunner`].
pub struct MigrationWorker {
    feature_configs: Arc<dyn FeatureConfigSource>,
    user_config: Arc<dyn UserConfigStore>,
    mls_handler: MlsConfigHandler,
    migration_handler: MlsMigrationConfigHandler,
    executor: Arc<dyn MigrationExecutor>,
    clock: Arc<dyn Clock>,
}

impl MigrationWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        feature_configs: Arc<dyn FeatureConfigSource>,
        user_config: Arc<dyn UserConfigStore>,
        protocols_updater: Arc<dyn SupportedProtocolsUpdater>,
        executor: Arc<dyn MigrationExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            mls_handler: MlsConfigHandler::new(user_config.clone(), protocols_updater.clone()),
            migration_handler: MlsMigrationConfigHandler::new(
                user_config.clone(),
                protocols_updater,
            ),
            feature_configs,
            user_config,
            executor,
            clock,
        }
    }

    async fn sync_feature_configs(&self) -> Result<(), MigrationError> {
        let configs = self
            .feature_configs
            .fetch_feature_configs()
            .await
            .map_err(MigrationError::FeatureConfigSync)?;
        self.mls_handler
            .handle(&configs.mls, true)
            .await
            .map_err(MigrationError::FeatureConfigSync)?;
        self.migration_handler
            .handle(&configs.mls_migration, true)
            .await
            .map_err(MigrationError::FeatureConfigSync)?;
        Ok(())
    }
}

#[async_trait]
impl MigrationRunner for MigrationWorker {
    async fn run_migration(&self) -> Result<MigrationRun, MigrationError> {
        self.sync_feature_configs().await?;

        let policy = match self.user_config.migration_policy().await {
            Ok(policy) => policy,
            Err(StorageError::NotFound { .. }) => {
                debug!("No MLS migration policy stored");
                return Ok(MigrationRun::NoPolicy);
            },
            Err(e) => return Err(e.into()),
        };

        if !policy.has_started(self.clock.now()) {
            info!("MLS migration is not enabled");
            return Ok(MigrationRun::NotStarted);
        }

        let migrated = self.executor.migrate_proteus_conversations().await?;
        if migrated.cancelled {
            info!(
                migrated = migrated.transitioned(),
                "MLS migration cancelled before finalising"
            );
            return Err(MigrationError::Cancelled);
        }

        let window_closed = policy.has_ended(self.clock.now());
        let finalised = if window_closed {
            info!("MLS migration window closed, finalising all conversations");
            self.executor.finalise_all_proteus_conversations().await?
        } else {
            self.executor.finalise_proteus_conversations().await?
        };
        if finalised.cancelled {
            info!(
                finalised = finalised.transitioned(),
                "MLS migration cancelled while finalising"
            );
            return Err(MigrationError::Cancelled);
        }

        Ok(MigrationRun::Completed {
            migrated,
            finalised,
            window_closed,
        })
    }
}
