//! Protocol state machine executor.
//!
//! The [`Migrator`] advances a team's group conversations one protocol step
//! per pass:
//!
//! | From      | To    | Operation                                         |
//! |-----------|-------|---------------------------------------------------|
//! | `Proteus` | Mixed | [`MigrationExecutor::migrate_proteus_conversations`] |
//! | `Mixed`   | Mls   | [`MigrationExecutor::finalise_proteus_conversations`] (ready only) |
//! | `Mixed`   | Mls   | [`MigrationExecutor::finalise_all_proteus_conversations`] (after the window) |
//!
//! # Failure Isolation
//!
//! Every conversation is attempted independently. A failed backend call or
//! group establishment is logged, recorded in the [`PassReport`] and the pass
//! continues. Only shared preconditions abort a pass: resolving the self
//! team and listing the conversations to touch. Without them there is no
//! well-defined set of conversations to migrate.
//!
//! # Cancellation
//!
//! The cancellation token is checked before each pass and between
//! conversations. A conversation whose remote call already started always
//! runs to completion. A pass cut short is marked [`PassReport::cancelled`].

mod report;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use report::{AttemptOutcome, ConversationAttempt, PassReport};

use crate::error::{ConversationFailure, MigrationError};
use crate::model::{
    ConversationId, ConversationType, Protocol, ProtocolInfo, ProtocolUpdateOutcome,
    SystemMessage, TeamId, UserId,
};
use crate::ports::{
    CallPresence, ConversationStore, GroupEstablisher, ProtocolUpdater, SelfTeamProvider,
    SystemMessageSink, UserRefresher,
};

/// The three migration operations, as seen by the worker.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Moves the team's Proteus group conversations to Mixed.
    async fn migrate_proteus_conversations(&self) -> Result<PassReport, MigrationError>;

    /// Moves the team's Mixed conversations whose members are ready to MLS.
    async fn finalise_proteus_conversations(&self) -> Result<PassReport, MigrationError>;

    /// Moves every one of the team's Mixed group conversations to MLS.
    async fn finalise_all_proteus_conversations(&self) -> Result<PassReport, MigrationError>;
}

/// Collaborators used by the [`Migrator`].
#[derive(Clone)]
pub struct MigratorPorts {
    /// Resolves the self team.
    pub self_team: Arc<dyn SelfTeamProvider>,
    /// Local conversation store.
    pub conversations: Arc<dyn ConversationStore>,
    /// Remote protocol update.
    pub protocol_updater: Arc<dyn ProtocolUpdater>,
    /// MLS group establishment.
    pub groups: Arc<dyn GroupEstablisher>,
    /// Call subsystem.
    pub calls: Arc<dyn CallPresence>,
    /// System message sink.
    pub system_messages: Arc<dyn SystemMessageSink>,
    /// Other-user cache refresh.
    pub users: Arc<dyn UserRefresher>,
}

/// Executes protocol transitions for the self user's team.
pub struct Migrator {
    ports: MigratorPorts,
    self_user_id: UserId,
    cancel: CancellationToken,
}

impl Migrator {
    /// Creates a migrator acting on behalf of `self_user_id`.
    #[must_use]
    pub fn new(ports: MigratorPorts, self_user_id: UserId) -> Self {
        Self {
            ports,
            self_user_id,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `cancel` to stop long passes between conversations.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn resolve_team(&self) -> Result<TeamId, MigrationError> {
        match self.ports.self_team.self_team_id().await {
            Ok(Some(team_id)) => Ok(team_id),
            Ok(None) => {
                warn!("Self user has no team, nothing to migrate");
                Err(MigrationError::NoTeam)
            },
            Err(e) => {
                warn!(error = %e, "Failed to resolve self team id");
                Err(MigrationError::SelfTeamUnresolved(e))
            },
        }
    }

    /// Moves one conversation to Mixed and establishes its MLS group.
    async fn migrate(&self, id: &ConversationId) -> AttemptOutcome {
        let outcome = match self
            .ports
            .protocol_updater
            .update_protocol_remotely(id, Protocol::Mixed)
            .await
        {
            Ok(outcome) => outcome,
            Err(source) => {
                warn!(conversation_id = %id, error = %source, "Failed to migrate conversation to mixed");
                return AttemptOutcome::Failed(ConversationFailure::ProtocolUpdate {
                    conversation_id: id.clone(),
                    target: Protocol::Mixed,
                    source,
                });
            },
        };

        if outcome.is_changed() {
            self.notify(SystemMessage::ProtocolChanged {
                conversation_id: id.clone(),
                protocol: Protocol::Mixed,
                sender: self.self_user_id.clone(),
            })
            .await;
            if self.ports.calls.has_established_call(id).await {
                self.notify(SystemMessage::ProtocolChangedDuringCall {
                    conversation_id: id.clone(),
                    sender: self.self_user_id.clone(),
                })
                .await;
            }
        }

        if let Err(failure) = self.establish_group(id).await {
            warn!(conversation_id = %id, error = %failure, "Failed to establish MLS group");
            return AttemptOutcome::Failed(failure);
        }

        attempt_outcome(outcome)
    }

    async fn establish_group(&self, id: &ConversationId) -> Result<(), ConversationFailure> {
        let failed = |source| ConversationFailure::GroupEstablishment {
            conversation_id: id.clone(),
            source,
        };

        let info = self
            .ports
            .conversations
            .protocol_info(id)
            .await
            .map_err(|e| failed(e.into()))?;
        let ProtocolInfo::Mixed { group_id } = info else {
            debug!(conversation_id = %id, protocol = %info.protocol(), "Not mixed, skipping group establishment");
            return Ok(());
        };

        let members = self
            .ports
            .conversations
            .members(id)
            .await
            .map_err(|e| failed(e.into()))?;
        self.ports
            .groups
            .establish_group(&group_id, &members, true)
            .await
            .map_err(failed)?;
        debug!(conversation_id = %id, %group_id, members = members.len(), "Established MLS group");
        Ok(())
    }

    /// Moves one conversation to MLS.
    async fn finalise(&self, id: &ConversationId) -> AttemptOutcome {
        match self
            .ports
            .protocol_updater
            .update_protocol_remotely(id, Protocol::Mls)
            .await
        {
            Ok(outcome) => {
                if outcome.is_changed() {
                    self.notify(SystemMessage::ProtocolChanged {
                        conversation_id: id.clone(),
                        protocol: Protocol::Mls,
                        sender: self.self_user_id.clone(),
                    })
                    .await;
                }
                attempt_outcome(outcome)
            },
            Err(source) => {
                warn!(conversation_id = %id, error = %source, "Failed to finalise conversation to mls");
                AttemptOutcome::Failed(ConversationFailure::ProtocolUpdate {
                    conversation_id: id.clone(),
                    target: Protocol::Mls,
                    source,
                })
            },
        }
    }

    /// Empty report for a pass skipped because shutdown was requested.
    fn cancelled_pass(&self, pass: &str, target: Protocol) -> Option<PassReport> {
        if !self.cancel.is_cancelled() {
            return None;
        }
        debug!(pass, "Migration cancelled, skipping pass");
        let mut report = PassReport::new(target);
        report.cancelled = true;
        Some(report)
    }

    async fn finalise_each(&self, ids: Vec<ConversationId>) -> PassReport {
        let mut report = PassReport::new(Protocol::Mls);
        for id in ids {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = self.finalise(&id).await;
            report.record(id, outcome);
        }
        log_pass("finalise", &report);
        report
    }

    async fn notify(&self, message: SystemMessage) {
        let conversation_id = message.conversation_id().clone();
        if let Err(e) = self.ports.system_messages.insert(message).await {
            warn!(%conversation_id, error = %e, "Failed to insert protocol change system message");
        }
    }
}

#[async_trait]
impl MigrationExecutor for Migrator {
    async fn migrate_proteus_conversations(&self) -> Result<PassReport, MigrationError> {
        if let Some(report) = self.cancelled_pass("migrate", Protocol::Mixed) {
            return Ok(report);
        }
        let team_id = self.resolve_team().await?;
        let ids = self
            .ports
            .conversations
            .conversation_ids(ConversationType::Group, Protocol::Proteus, &team_id)
            .await?;
        debug!(%team_id, count = ids.len(), "Migrating proteus conversations");

        let mut report = PassReport::new(Protocol::Mixed);
        for id in ids {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = self.migrate(&id).await;
            report.record(id, outcome);
        }
        log_pass("migrate", &report);
        Ok(report)
    }

    async fn finalise_proteus_conversations(&self) -> Result<PassReport, MigrationError> {
        if let Some(report) = self.cancelled_pass("finalise", Protocol::Mls) {
            return Ok(report);
        }
        if let Err(e) = self.ports.users.refresh_other_users().await {
            warn!(error = %e, "Failed to refresh other users before finalising");
        }
        let team_id = self.resolve_team().await?;
        let ids = self
            .ports
            .conversations
            .team_conversations_ready_to_finalise(&team_id)
            .await?;
        debug!(%team_id, count = ids.len(), "Finalising ready conversations");
        Ok(self.finalise_each(ids).await)
    }

    async fn finalise_all_proteus_conversations(&self) -> Result<PassReport, MigrationError> {
        if let Some(report) = self.cancelled_pass("finalise", Protocol::Mls) {
            return Ok(report);
        }
        let team_id = self.resolve_team().await?;
        let ids = self
            .ports
            .conversations
            .conversation_ids(ConversationType::Group, Protocol::Mixed, &team_id)
            .await?;
        debug!(%team_id, count = ids.len(), "Finalising all mixed conversations");
        Ok(self.finalise_each(ids).await)
    }
}

const fn attempt_outcome(outcome: ProtocolUpdateOutcome) -> AttemptOutcome {
    match outcome {
        ProtocolUpdateOutcome::Changed => AttemptOutcome::Transitioned,
        ProtocolUpdateOutcome::Unchanged => AttemptOutcome::AlreadyAtTarget,
    }
}

fn log_pass(pass: &str, report: &PassReport) {
    info!(
        pass,
        protocol = %report.target,
        attempted = report.attempts.len(),
        transitioned = report.transitioned(),
        already_at_target = report.already_at_target(),
        failed = report.failures().count(),
        cancelled = report.cancelled,
        "Migration pass finished"
    );
}
