//! Error types for migration operations.
//!
//! Collaborators report [`StorageError`] (local persistence) or
//! [`NetworkError`] (backend calls). The orchestrator lifts the few failures
//! that abort a whole run into [`MigrationError`]; failures scoped to one
//! conversation are recorded as [`ConversationFailure`] and never returned as
//! `Err`.

use thiserror::Error;

use crate::model::{ConversationId, Protocol};

/// Local persistence failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested value has never been stored.
    #[error("data not found: {key}")]
    NotFound {
        /// Key or entity that was looked up.
        key: String,
    },

    /// The storage backend failed.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new backend failure.
    #[must_use]
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }

    /// Returns `true` if the value simply does not exist yet.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Backend call failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetworkError {
    /// The backend answered with an unexpected status.
    #[error("server miscommunication ({status}): {label}")]
    ServerMiscommunication {
        /// HTTP status code.
        status: u16,
        /// Backend error label.
        label: String,
    },

    /// No connection to the backend.
    #[error("no network connection")]
    NoConnection,
}

impl NetworkError {
    /// Creates a new server miscommunication error.
    #[must_use]
    pub fn server(status: u16, label: impl Into<String>) -> Self {
        Self::ServerMiscommunication {
            status,
            label: label.into(),
        }
    }
}

/// Failure of a collaborator that can be either local or remote.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreFailure {
    /// Local persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A backend call failed.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// MLS group operation failed.
    #[error("mls failure: {0}")]
    Mls(String),
}

/// Run-level migration failure.
///
/// Only these abort a run. The sequencer does not reset the rate-limit
/// timestamp when a run ends with one of them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MigrationError {
    /// The self user's team could not be resolved.
    #[error("self team id unresolved: {0}")]
    SelfTeamUnresolved(CoreFailure),

    /// The self user does not belong to a team.
    #[error("self user does not belong to a team")]
    NoTeam,

    /// Fetching or applying the backend feature configuration failed.
    #[error("feature config sync failed: {0}")]
    FeatureConfigSync(CoreFailure),

    /// A shared storage read or write failed.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// The sequencer task is no longer running.
    #[error("migration sequencer stopped")]
    SequencerStopped,

    /// Shutdown was requested before the run finished.
    #[error("migration run cancelled")]
    Cancelled,
}

/// Reason a single conversation could not be advanced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConversationFailure {
    /// The remote protocol update call failed.
    #[error("failed to update {conversation_id} to {target}: {source}")]
    ProtocolUpdate {
        /// Affected conversation.
        conversation_id: ConversationId,
        /// Requested protocol.
        target: Protocol,
        /// Underlying failure.
        source: CoreFailure,
    },

    /// Establishing the MLS group failed.
    #[error("failed to establish group for {conversation_id}: {source}")]
    GroupEstablishment {
        /// Affected conversation.
        conversation_id: ConversationId,
        /// Underlying failure.
        source: CoreFailure,
    },
}

impl ConversationFailure {
    /// Returns the conversation the failure belongs to.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::ProtocolUpdate {
                conversation_id, ..
            }
            | Self::GroupEstablishment {
                conversation_id, ..
            } => conversation_id,
        }
    }
}
