//! Collaborator interfaces consumed by the orchestrator.
//!
//! The migration owns no storage and no transport. Everything it reads or
//! writes goes through one of these narrow traits, which the host client
//! implements on top of its conversation store, backend API and crypto
//! layer. [`crate::memory`] provides in-memory implementations.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CoreFailure, StorageError};
use crate::model::{
    ConversationId, ConversationType, FeatureConfigs, GroupId, MigrationPolicy, Protocol,
    ProtocolInfo, ProtocolUpdateOutcome, SupportedProtocol, SystemMessage, TeamId, UserId,
};

/// Persisted key of the rate-limit timestamp.
pub const LAST_MLS_MIGRATION_CHECK: &str = "LAST_MLS_MIGRATION_CHECK";

/// Fetches the backend feature configuration set.
#[async_trait]
pub trait FeatureConfigSource: Send + Sync {
    /// Fetches the current feature configuration from the backend.
    async fn fetch_feature_configs(&self) -> Result<FeatureConfigs, CoreFailure>;
}

/// Locally cached user configuration.
#[async_trait]
pub trait UserConfigStore: Send + Sync {
    /// Stores whether MLS is enabled for this user.
    async fn set_mls_enabled(&self, enabled: bool) -> Result<(), StorageError>;

    /// Reads whether MLS is enabled for this user.
    async fn is_mls_enabled(&self) -> Result<bool, StorageError>;

    /// Stores the default protocol for new conversations.
    async fn set_default_protocol(&self, protocol: SupportedProtocol) -> Result<(), StorageError>;

    /// Reads the protocols the team supports.
    async fn supported_protocols(&self) -> Result<BTreeSet<SupportedProtocol>, StorageError>;

    /// Stores the protocols the team supports.
    async fn set_supported_protocols(
        &self,
        protocols: BTreeSet<SupportedProtocol>,
    ) -> Result<(), StorageError>;

    /// Reads the cached migration policy.
    async fn migration_policy(&self) -> Result<MigrationPolicy, StorageError>;

    /// Stores the migration policy.
    async fn set_migration_policy(&self, policy: MigrationPolicy) -> Result<(), StorageError>;
}

/// Resolves the team of the self user.
#[async_trait]
pub trait SelfTeamProvider: Send + Sync {
    /// Returns the self user's team, or `None` if the user has no team.
    async fn self_team_id(&self) -> Result<Option<TeamId>, CoreFailure>;
}

/// Read access to the local conversation store.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Lists conversations of `kind` on `protocol` owned by `team_id`.
    async fn conversation_ids(
        &self,
        kind: ConversationType,
        protocol: Protocol,
        team_id: &TeamId,
    ) -> Result<Vec<ConversationId>, StorageError>;

    /// Lists team conversations whose members are ready for MLS.
    ///
    /// The readiness predicate is owned by the store.
    async fn team_conversations_ready_to_finalise(
        &self,
        team_id: &TeamId,
    ) -> Result<Vec<ConversationId>, StorageError>;

    /// Reads the protocol details of a conversation.
    async fn protocol_info(&self, id: &ConversationId) -> Result<ProtocolInfo, StorageError>;

    /// Reads the members of a conversation.
    async fn members(&self, id: &ConversationId) -> Result<Vec<UserId>, StorageError>;
}

/// Remote protocol update.
#[async_trait]
pub trait ProtocolUpdater: Send + Sync {
    /// Asks the backend to move `id` to `target`.
    ///
    /// Must be idempotent: updating a conversation already on `target`
    /// returns [`ProtocolUpdateOutcome::Unchanged`]. On
    /// [`ProtocolUpdateOutcome::Changed`] the local store reflects the new
    /// protocol before this returns.
    async fn update_protocol_remotely(
        &self,
        id: &ConversationId,
        target: Protocol,
    ) -> Result<ProtocolUpdateOutcome, CoreFailure>;
}

/// Cryptographic group establishment.
#[async_trait]
pub trait GroupEstablisher: Send + Sync {
    /// Establishes the MLS group for `members`.
    ///
    /// With `allow_partial_member_list`, members without published key
    /// packages are skipped instead of failing the whole operation.
    async fn establish_group(
        &self,
        group_id: &GroupId,
        members: &[UserId],
        allow_partial_member_list: bool,
    ) -> Result<(), CoreFailure>;
}

/// Call subsystem signal.
#[async_trait]
pub trait CallPresence: Send + Sync {
    /// Returns `true` if `id` currently has an established call.
    async fn has_established_call(&self, id: &ConversationId) -> bool;
}

/// Sink for locally visible system messages.
#[async_trait]
pub trait SystemMessageSink: Send + Sync {
    /// Inserts a system message.
    async fn insert(&self, message: SystemMessage) -> Result<(), StorageError>;
}

/// Named persisted instants.
#[async_trait]
pub trait TimestampStore: Send + Sync {
    /// Returns `true` if at least `interval` elapsed since `key` was last
    /// reset, or if it was never set.
    async fn has_passed(&self, key: &str, interval: Duration) -> Result<bool, StorageError>;

    /// Sets `key` to the current instant.
    async fn reset(&self, key: &str) -> Result<(), StorageError>;
}

/// Refreshes the local cache of other users.
#[async_trait]
pub trait UserRefresher: Send + Sync {
    /// Re-fetches every known non-self user from the backend.
    async fn refresh_other_users(&self) -> Result<(), CoreFailure>;
}

/// Client-level MLS predicates consulted by the trigger.
#[async_trait]
pub trait MlsClientState: Send + Sync {
    /// Returns `true` if MLS is enabled for this client.
    async fn is_mls_enabled(&self) -> bool;

    /// Returns `true` if this device registered an MLS-capable client.
    async fn has_registered_mls_client(&self) -> Result<bool, StorageError>;
}

/// Re-evaluates the protocols the self user advertises.
#[async_trait]
pub trait SupportedProtocolsUpdater: Send + Sync {
    /// Recomputes and publishes the self user's supported protocols.
    ///
    /// Returns `true` if the advertised set changed.
    async fn update_supported_protocols(&self, synchronise_users: bool)
    -> Result<bool, CoreFailure>;
}
