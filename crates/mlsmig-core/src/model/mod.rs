//! Domain model for conversation protocol migration.
//!
//! This module defines the identifiers, protocol states and signals that flow
//! between the trigger, the sequencer and the migrator. Everything here is
//! plain data: no I/O, no clocks.
//!
//! # Protocol Ordering
//!
//! Conversation protocols form a strict chain:
//!
//! ```text
//! Proteus ──▶ Mixed ──▶ Mls
//! ```
//!
//! A conversation never moves backwards along this chain. [`Protocol::rank`]
//! exposes the order so callers can assert monotonicity.

mod policy;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use policy::{FeatureConfigs, FeatureStatus, MigrationPolicy, MlsFeatureConfig};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from any string-like value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Qualified conversation identifier.
    ConversationId
);
string_id!(
    /// Qualified user identifier.
    UserId
);
string_id!(
    /// Team identifier.
    TeamId
);
string_id!(
    /// MLS group identifier of a conversation.
    GroupId
);
string_id!(
    /// Device client identifier.
    ClientId
);

/// End-to-end encryption protocol of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Pairwise sessions, pre-migration.
    Proteus,
    /// Transitional: both pairwise and group-keyed delivery are accepted.
    Mixed,
    /// Group-keyed sessions, fully migrated.
    Mls,
}

impl Protocol {
    /// Position of the protocol in the migration chain.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Proteus => 0,
            Self::Mixed => 1,
            Self::Mls => 2,
        }
    }

    /// Returns `true` if moving from `self` to `target` does not go backwards.
    ///
    /// Staying on the same protocol is allowed; the remote update reports it
    /// as unchanged.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        target.rank() >= self.rank()
    }

    /// Returns the protocol name as used in logs and system messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proteus => "proteus",
            Self::Mixed => "mixed",
            Self::Mls => "mls",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocols a user or team may advertise.
///
/// `Mixed` is a conversation-level transitional state and never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportedProtocol {
    /// Pairwise protocol.
    Proteus,
    /// Group-keyed protocol.
    Mls,
}

/// Kind of conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    /// Multi-member group conversation; the only kind touched by migration.
    Group,
    /// One-on-one conversation.
    OneOnOne,
    /// The self conversation.
    SelfConversation,
    /// Pending connection request.
    Connection,
}

/// Protocol details of a single conversation as stored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolInfo {
    /// Pairwise only; there is no MLS group yet.
    Proteus,
    /// Transitional state with an MLS group to establish.
    Mixed {
        /// Group backing the MLS side of the conversation.
        group_id: GroupId,
    },
    /// Fully migrated.
    Mls {
        /// Group backing the conversation.
        group_id: GroupId,
    },
}

impl ProtocolInfo {
    /// Returns the protocol this info describes.
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::Proteus => Protocol::Proteus,
            Self::Mixed { .. } => Protocol::Mixed,
            Self::Mls { .. } => Protocol::Mls,
        }
    }
}

/// Result of a remote protocol update call.
///
/// The distinction matters: only [`ProtocolUpdateOutcome::Changed`] produces a
/// user-visible system message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolUpdateOutcome {
    /// The backend moved the conversation to the requested protocol.
    Changed,
    /// The conversation already was on (or past) the requested protocol.
    Unchanged,
}

impl ProtocolUpdateOutcome {
    /// Returns `true` if the protocol actually changed.
    #[must_use]
    pub const fn is_changed(self) -> bool {
        matches!(self, Self::Changed)
    }
}

/// Connectivity and liveness state reported by the incremental sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Sync failed and is waiting to retry.
    Failed,
    /// Waiting for network connectivity.
    Waiting,
    /// Slow sync in progress.
    SlowSync,
    /// Gathering events that accumulated while offline.
    GatheringPendingEvents,
    /// Connected and processing events in real time.
    Live,
}

impl SyncState {
    /// Returns `true` for [`SyncState::Live`].
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

/// Locally visible system message produced by the migrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SystemMessage {
    /// The conversation protocol changed.
    ProtocolChanged {
        /// Conversation whose protocol changed.
        conversation_id: ConversationId,
        /// The protocol the conversation moved to.
        protocol: Protocol,
        /// User the change is attributed to.
        sender: UserId,
    },
    /// The conversation protocol changed while a call was ongoing.
    ProtocolChangedDuringCall {
        /// Conversation whose protocol changed.
        conversation_id: ConversationId,
        /// User the change is attributed to.
        sender: UserId,
    },
}

impl SystemMessage {
    /// Returns the conversation this message belongs to.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::ProtocolChanged {
                conversation_id, ..
            }
            | Self::ProtocolChangedDuringCall {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// A self-user device as seen by protocol support evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfClient {
    /// Client identifier.
    pub id: ClientId,
    /// Whether the client has been active recently.
    pub is_active: bool,
    /// Whether the backend reports the client as MLS capable.
    pub is_mls_capable: bool,
}
