//! Scripted client scenarios.
//!
//! A scenario describes a self user, their team's conversations, the backend
//! feature configuration and a list of sessions. Each session is one client
//! process lifetime: the orchestrator starts, observes the session's sync
//! states, drains its queue and stops. Persistent state (conversations,
//! timestamps, user config) carries over between sessions.
//!
//! ```toml
//! now = "2026-03-01T12:00:00Z"
//! self_user = "alice@wire.test"
//! team = "team-wire"
//!
//! [feature_configs.mls_migration]
//! status = "enabled"
//! start_time = "2026-02-28T00:00:00Z"
//!
//! [[conversations]]
//! id = "design"
//! protocol = "proteus"
//! members = ["bob@wire.test"]
//!
//! [[sessions]]
//! sync = ["waiting", "slow_sync", "live"]
//!
//! [[sessions]]
//! after = "25h"
//! sync = ["live"]
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mlsmig_core::memory::ConversationRecord;
use mlsmig_core::model::{ClientId, ConversationType, FeatureConfigs, GroupId, SelfClient};
use mlsmig_core::{ConversationId, Protocol, SyncState, TeamId, UserId};
use serde::Deserialize;

/// A scenario file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Wall-clock instant the first session starts at.
    pub now: DateTime<Utc>,
    /// The self user.
    pub self_user: UserId,
    /// The self user's team. Absent for users without a team.
    #[serde(default)]
    pub team: Option<TeamId>,
    /// This device's client id.
    #[serde(default = "default_current_client")]
    pub current_client: ClientId,
    /// Whether MLS is enabled on this client.
    #[serde(default = "default_true")]
    pub mls_enabled: bool,
    /// Whether this device registered an MLS client.
    #[serde(default = "default_true")]
    pub mls_client_registered: bool,
    /// Backend feature configuration.
    #[serde(default)]
    pub feature_configs: FeatureConfigs,
    /// Every client of the self user, as reported by the backend.
    #[serde(default)]
    pub self_clients: Vec<SelfClient>,
    /// Conversations in the local store.
    #[serde(default)]
    pub conversations: Vec<ConversationSpec>,
    /// Client sessions, in order.
    pub sessions: Vec<Session>,
}

/// One conversation in the local store.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationSpec {
    /// Conversation id.
    pub id: ConversationId,
    /// Conversation kind.
    #[serde(default = "default_kind")]
    pub kind: ConversationType,
    /// Current protocol.
    pub protocol: Protocol,
    /// Owning team. Defaults to the self user's team; `""` means no team.
    #[serde(default)]
    pub team: Option<TeamId>,
    /// Members.
    #[serde(default)]
    pub members: Vec<UserId>,
    /// Whether every member is ready for MLS.
    #[serde(default)]
    pub ready: bool,
    /// Whether a call is established.
    #[serde(default)]
    pub call: bool,
    /// Whether the backend rejects protocol updates for this conversation.
    #[serde(default)]
    pub fail_update: bool,
}

/// One client process lifetime.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Session {
    /// Time elapsed since the previous session.
    #[serde(default, with = "humantime_serde")]
    pub after: Option<Duration>,
    /// Sync states observed during the session.
    pub sync: Vec<SyncState>,
    /// Whether the backend feature config fetch fails during the session.
    #[serde(default)]
    pub feature_config_offline: bool,
}

impl Scenario {
    /// Loads a scenario from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid scenario {}", path.display()))
    }

    /// Parses a scenario from TOML.
    pub fn from_toml(content: &str) -> Result<Self> {
        let scenario: Self = toml::from_str(content)?;
        anyhow::ensure!(!scenario.sessions.is_empty(), "scenario has no sessions");
        Ok(scenario)
    }

    /// Builds the conversation records for the in-memory store.
    #[must_use]
    pub fn conversation_records(&self) -> Vec<ConversationRecord> {
        self.conversations
            .iter()
            .map(|spec| {
                let team_id = match &spec.team {
                    Some(team) if team.as_str().is_empty() => None,
                    Some(team) => Some(team.clone()),
                    None => self.team.clone(),
                };
                ConversationRecord {
                    id: spec.id.clone(),
                    kind: spec.kind,
                    team_id,
                    protocol: spec.protocol,
                    group_id: GroupId::new(format!("group-{}", spec.id)),
                    members: spec.members.clone(),
                    ready_to_finalise: spec.ready,
                    has_established_call: spec.call,
                }
            })
            .collect()
    }

    /// Ids of the conversations whose updates should fail.
    pub fn failing_conversations(&self) -> impl Iterator<Item = &ConversationId> {
        self.conversations
            .iter()
            .filter(|spec| spec.fail_update)
            .map(|spec| &spec.id)
    }
}

fn default_current_client() -> ClientId {
    ClientId::new("current")
}

const fn default_true() -> bool {
    true
}

const fn default_kind() -> ConversationType {
    ConversationType::Group
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
