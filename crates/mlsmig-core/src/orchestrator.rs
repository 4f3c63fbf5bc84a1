//! Wires the trigger, sequencer, worker and migrator together.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{ConfigError, MigrationConfig};
use crate::migrator::{Migrator, MigratorPorts};
use crate::model::{SyncState, UserId};
use crate::ports::{
    FeatureConfigSource, MlsClientState, SupportedProtocolsUpdater, TimestampStore,
    UserConfigStore,
};
use crate::sequencer::{MigrationSequencer, SequencerHandle};
use crate::trigger::MigrationTrigger;
use crate::worker::MigrationWorker;

/// Everything the orchestrator needs from the host client.
#[derive(Clone)]
pub struct Collaborators {
    /// The self user, sender of protocol change messages.
    pub self_user_id: UserId,
    /// Collaborators used per conversation.
    pub migrator: MigratorPorts,
    /// Backend feature configuration.
    pub feature_configs: Arc<dyn FeatureConfigSource>,
    /// Cached user configuration.
    pub user_config: Arc<dyn UserConfigStore>,
    /// Self supported protocols re-evaluation.
    pub protocols_updater: Arc<dyn SupportedProtocolsUpdater>,
    /// Rate-limit timestamp storage.
    pub timestamps: Arc<dyn TimestampStore>,
    /// Client MLS predicates.
    pub client_state: Arc<dyn MlsClientState>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// A running orchestrator.
///
/// Sync states pushed into [`Self::sync_states`] drive migration checks.
/// [`Self::sequencer`] gives direct, serialized access for callers that want
/// to force a check.
pub struct MigrationOrchestrator {
    sync_states: mpsc::Sender<SyncState>,
    sequencer: SequencerHandle,
    cancel: CancellationToken,
    trigger_task: JoinHandle<()>,
    sequencer_task: JoinHandle<()>,
}

impl MigrationOrchestrator {
    /// Builds the pipeline and spawns its tasks on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `config` is out of range.
    /// Nothing is spawned in that case.
    pub fn start(
        config: &MigrationConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cancel = CancellationToken::new();

        let migrator = Migrator::new(collaborators.migrator, collaborators.self_user_id)
            .with_cancellation(cancel.child_token());
        let worker = MigrationWorker::new(
            collaborators.feature_configs,
            collaborators.user_config,
            collaborators.protocols_updater,
            Arc::new(migrator),
            collaborators.clock,
        );
        let (sequencer, sequencer_task) = MigrationSequencer::spawn(
            Arc::new(worker),
            collaborators.timestamps,
            config.check_interval,
            config.queue_capacity,
            cancel.child_token(),
        );

        let (sync_states, states) = mpsc::channel(config.sync_state_capacity);
        let trigger_task = MigrationTrigger::new(
            states,
            collaborators.client_state,
            sequencer.clone(),
            config.skip_initial_sync_state,
            cancel.child_token(),
        )
        .spawn();

        info!(
            check_interval = ?config.check_interval,
            "MLS migration orchestrator started"
        );
        Ok(Self {
            sync_states,
            sequencer,
            cancel,
            trigger_task,
            sequencer_task,
        })
    }

    /// Sender for sync state updates.
    #[must_use]
    pub fn sync_states(&self) -> mpsc::Sender<SyncState> {
        self.sync_states.clone()
    }

    /// Handle to the sequencer.
    #[must_use]
    pub const fn sequencer(&self) -> &SequencerHandle {
        &self.sequencer
    }

    /// Stops scheduling new checks, lets an in-flight run stop at the next
    /// conversation boundary and waits for both tasks to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.trigger_task.await {
            warn!(error = %e, "Migration trigger task failed");
        }
        if let Err(e) = self.sequencer_task.await {
            warn!(error = %e, "Migration sequencer task failed");
        }
        info!("MLS migration orchestrator stopped");
    }

    /// Closes the sync state channel and waits until every queued check has
    /// been handled.
    ///
    /// Returns once every clone of [`Self::sync_states`] and
    /// [`Self::sequencer`] handed out earlier has been dropped.
    pub async fn drain(self) {
        let Self {
            sync_states,
            sequencer,
            cancel,
            trigger_task,
            sequencer_task,
        } = self;
        drop(sync_states);
        if let Err(e) = trigger_task.await {
            warn!(error = %e, "Migration trigger task failed");
        }
        drop(sequencer);
        if let Err(e) = sequencer_task.await {
            warn!(error = %e, "Migration sequencer task failed");
        }
        cancel.cancel();
    }
}
