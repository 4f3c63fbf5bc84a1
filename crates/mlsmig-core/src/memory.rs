//! In-memory collaborator implementations.
//!
//! These back the integration tests and the `mlsmig` scenario runner. They
//! keep the same contracts as production collaborators (idempotent remote
//! updates, monotonic protocols, not-found on unset keys) and add knobs for
//! injecting failures and inspecting what the orchestrator did.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::clock::Clock;
use crate::error::{CoreFailure, NetworkError, StorageError};
use crate::model::{
    ConversationId, ConversationType, FeatureConfigs, GroupId, MigrationPolicy, Protocol,
    ProtocolInfo, ProtocolUpdateOutcome, SupportedProtocol, SystemMessage, TeamId, UserId,
};
use crate::ports::{
    CallPresence, ConversationStore, FeatureConfigSource, GroupEstablisher, MlsClientState,
    ProtocolUpdater, SelfTeamProvider, SupportedProtocolsUpdater, SystemMessageSink,
    TimestampStore, UserConfigStore, UserRefresher,
};

const MLS_ENABLED_KEY: &str = "MLS_ENABLED";
const DEFAULT_PROTOCOL_KEY: &str = "DEFAULT_PROTOCOL";
const SUPPORTED_PROTOCOLS_KEY: &str = "SUPPORTED_PROTOCOLS";
const MLS_MIGRATION_KEY: &str = "MLS_MIGRATION";

// =============================================================================
// User config
// =============================================================================

/// Key-value user configuration with JSON-encoded values.
#[derive(Debug, Default)]
pub struct InMemoryUserConfigStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
    fail_writes: AtomicBool,
}

impl InMemoryUserConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with a backend error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns the stored default protocol, if any.
    #[must_use]
    pub fn default_protocol(&self) -> Option<SupportedProtocol> {
        self.get(DEFAULT_PROTOCOL_KEY).ok()
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StorageError> {
        let values = self.values.lock().expect("lock poisoned");
        let value = values
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(key))?;
        serde_json::from_value(value).map_err(|e| StorageError::backend(e.to_string()))
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::backend(format!("write rejected for {key}")));
        }
        let value = serde_json::to_value(value).map_err(|e| StorageError::backend(e.to_string()))?;
        self.values
            .lock()
            .expect("lock poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl UserConfigStore for InMemoryUserConfigStore {
    async fn set_mls_enabled(&self, enabled: bool) -> Result<(), StorageError> {
        self.put(MLS_ENABLED_KEY, &enabled)
    }

    async fn is_mls_enabled(&self) -> Result<bool, StorageError> {
        self.get(MLS_ENABLED_KEY)
    }

    async fn set_default_protocol(&self, protocol: SupportedProtocol) -> Result<(), StorageError> {
        self.put(DEFAULT_PROTOCOL_KEY, &protocol)
    }

    async fn supported_protocols(&self) -> Result<BTreeSet<SupportedProtocol>, StorageError> {
        self.get(SUPPORTED_PROTOCOLS_KEY)
    }

    async fn set_supported_protocols(
        &self,
        protocols: BTreeSet<SupportedProtocol>,
    ) -> Result<(), StorageError> {
        self.put(SUPPORTED_PROTOCOLS_KEY, &protocols)
    }

    async fn migration_policy(&self) -> Result<MigrationPolicy, StorageError> {
        self.get(MLS_MIGRATION_KEY)
    }

    async fn set_migration_policy(&self, policy: MigrationPolicy) -> Result<(), StorageError> {
        self.put(MLS_MIGRATION_KEY, &policy)
    }
}

// =============================================================================
// Feature configs
// =============================================================================

/// Feature config source returning a preset response.
#[derive(Debug)]
pub struct StaticFeatureConfigSource {
    response: Mutex<Result<FeatureConfigs, CoreFailure>>,
    fetches: AtomicUsize,
}

impl StaticFeatureConfigSource {
    /// Creates a source that returns `configs`.
    #[must_use]
    pub fn new(configs: FeatureConfigs) -> Self {
        Self {
            response: Mutex::new(Ok(configs)),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Replaces the configuration returned by subsequent fetches.
    pub fn set_configs(&self, configs: FeatureConfigs) {
        *self.response.lock().expect("lock poisoned") = Ok(configs);
    }

    /// Makes subsequent fetches fail with `failure`.
    pub fn set_failure(&self, failure: CoreFailure) {
        *self.response.lock().expect("lock poisoned") = Err(failure);
    }

    /// Number of fetches performed so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureConfigSource for StaticFeatureConfigSource {
    async fn fetch_feature_configs(&self) -> Result<FeatureConfigs, CoreFailure> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.response.lock().expect("lock poisoned").clone()
    }
}

// =============================================================================
// Self team
// =============================================================================

/// Self team provider with a fixed answer.
#[derive(Debug, Clone)]
pub struct FixedSelfTeam(Result<Option<TeamId>, CoreFailure>);

impl FixedSelfTeam {
    /// The self user belongs to `team_id`.
    #[must_use]
    pub const fn team(team_id: TeamId) -> Self {
        Self(Ok(Some(team_id)))
    }

    /// The self user has no team.
    #[must_use]
    pub const fn none() -> Self {
        Self(Ok(None))
    }

    /// Resolving the team fails with `failure`.
    #[must_use]
    pub const fn failing(failure: CoreFailure) -> Self {
        Self(Err(failure))
    }
}

#[async_trait]
impl SelfTeamProvider for FixedSelfTeam {
    async fn self_team_id(&self) -> Result<Option<TeamId>, CoreFailure> {
        self.0.clone()
    }
}

// =============================================================================
// Conversations
// =============================================================================

/// A conversation as held by [`InMemoryConversationStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Conversation kind.
    pub kind: ConversationType,
    /// Owning team.
    pub team_id: Option<TeamId>,
    /// Current protocol.
    pub protocol: Protocol,
    /// MLS group identifier used once the conversation leaves Proteus.
    pub group_id: GroupId,
    /// Member list.
    pub members: Vec<UserId>,
    /// Whether every member is ready for MLS.
    pub ready_to_finalise: bool,
    /// Whether a call is currently established.
    pub has_established_call: bool,
}

impl ConversationRecord {
    /// Creates a team group conversation on `protocol`.
    #[must_use]
    pub fn team_group(id: &str, team_id: &TeamId, protocol: Protocol) -> Self {
        Self {
            id: ConversationId::new(id),
            kind: ConversationType::Group,
            team_id: Some(team_id.clone()),
            protocol,
            group_id: GroupId::new(format!("group-{id}")),
            members: Vec::new(),
            ready_to_finalise: false,
            has_established_call: false,
        }
    }

    /// Sets the member list.
    #[must_use]
    pub fn with_members(mut self, members: Vec<UserId>) -> Self {
        self.members = members;
        self
    }

    /// Marks the conversation as ready to finalise.
    #[must_use]
    pub fn ready(mut self) -> Self {
        self.ready_to_finalise = true;
        self
    }

    /// Marks the conversation as having an established call.
    #[must_use]
    pub fn with_call(mut self) -> Self {
        self.has_established_call = true;
        self
    }

    fn protocol_info(&self) -> ProtocolInfo {
        match self.protocol {
            Protocol::Proteus => ProtocolInfo::Proteus,
            Protocol::Mixed => ProtocolInfo::Mixed {
                group_id: self.group_id.clone(),
            },
            Protocol::Mls => ProtocolInfo::Mls {
                group_id: self.group_id.clone(),
            },
        }
    }
}

/// A remote protocol update attempt observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCall {
    /// Conversation the update targeted.
    pub conversation_id: ConversationId,
    /// Requested protocol.
    pub target: Protocol,
}

#[derive(Debug, Default)]
struct ConversationState {
    records: Vec<ConversationRecord>,
    failing_updates: HashSet<ConversationId>,
    update_calls: Vec<UpdateCall>,
    history: HashMap<ConversationId, Vec<Protocol>>,
}

/// Conversation store that also plays the backend for protocol updates and
/// the call subsystem for call presence.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    state: Mutex<ConversationState>,
}

impl InMemoryConversationStore {
    /// Creates a store holding `records`, in listing order.
    #[must_use]
    pub fn new(records: Vec<ConversationRecord>) -> Self {
        let history = records
            .iter()
            .map(|record| (record.id.clone(), vec![record.protocol]))
            .collect();
        Self {
            state: Mutex::new(ConversationState {
                records,
                history,
                ..ConversationState::default()
            }),
        }
    }

    /// Makes remote updates for `id` fail.
    pub fn fail_updates_for(&self, id: &ConversationId) {
        self.state
            .lock()
            .expect("lock poisoned")
            .failing_updates
            .insert(id.clone());
    }

    /// Returns the current protocol of `id`.
    #[must_use]
    pub fn protocol_of(&self, id: &ConversationId) -> Option<Protocol> {
        self.state
            .lock()
            .expect("lock poisoned")
            .records
            .iter()
            .find(|record| &record.id == id)
            .map(|record| record.protocol)
    }

    /// Returns every protocol `id` has been on, oldest first.
    #[must_use]
    pub fn protocol_history(&self, id: &ConversationId) -> Vec<Protocol> {
        self.state
            .lock()
            .expect("lock poisoned")
            .history
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns every remote update attempt, in call order.
    #[must_use]
    pub fn update_calls(&self) -> Vec<UpdateCall> {
        self.state.lock().expect("lock poisoned").update_calls.clone()
    }

    /// Returns a snapshot of every record.
    #[must_use]
    pub fn records(&self) -> Vec<ConversationRecord> {
        self.state.lock().expect("lock poisoned").records.clone()
    }

    fn with_record<T>(
        &self,
        id: &ConversationId,
        f: impl FnOnce(&ConversationRecord) -> T,
    ) -> Result<T, StorageError> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .records
            .iter()
            .find(|record| &record.id == id)
            .map(f)
            .ok_or_else(|| StorageError::not_found(id.to_string()))
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn conversation_ids(
        &self,
        kind: ConversationType,
        protocol: Protocol,
        team_id: &TeamId,
    ) -> Result<Vec<ConversationId>, StorageError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .records
            .iter()
            .filter(|record| {
                record.kind == kind
                    && record.protocol == protocol
                    && record.team_id.as_ref() == Some(team_id)
            })
            .map(|record| record.id.clone())
            .collect())
    }

    async fn team_conversations_ready_to_finalise(
        &self,
        team_id: &TeamId,
    ) -> Result<Vec<ConversationId>, StorageError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .records
            .iter()
            .filter(|record| {
                record.kind == ConversationType::Group
                    && record.protocol == Protocol::Mixed
                    && record.team_id.as_ref() == Some(team_id)
                    && record.ready_to_finalise
            })
            .map(|record| record.id.clone())
            .collect())
    }

    async fn protocol_info(&self, id: &ConversationId) -> Result<ProtocolInfo, StorageError> {
        self.with_record(id, ConversationRecord::protocol_info)
    }

    async fn members(&self, id: &ConversationId) -> Result<Vec<UserId>, StorageError> {
        self.with_record(id, |record| record.members.clone())
    }
}

#[async_trait]
impl ProtocolUpdater for InMemoryConversationStore {
    async fn update_protocol_remotely(
        &self,
        id: &ConversationId,
        target: Protocol,
    ) -> Result<ProtocolUpdateOutcome, CoreFailure> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.update_calls.push(UpdateCall {
            conversation_id: id.clone(),
            target,
        });
        if state.failing_updates.contains(id) {
            return Err(NetworkError::server(500, "internal-error").into());
        }

        let record = state
            .records
            .iter_mut()
            .find(|record| &record.id == id)
            .ok_or_else(|| NetworkError::server(404, "no-conversation"))?;
        if record.protocol == target || !record.protocol.can_transition_to(target) {
            return Ok(ProtocolUpdateOutcome::Unchanged);
        }
        record.protocol = target;
        state.history.entry(id.clone()).or_default().push(target);
        Ok(ProtocolUpdateOutcome::Changed)
    }
}

#[async_trait]
impl CallPresence for InMemoryConversationStore {
    async fn has_established_call(&self, id: &ConversationId) -> bool {
        self.with_record(id, |record| record.has_established_call)
            .unwrap_or(false)
    }
}

// =============================================================================
// Groups
// =============================================================================

/// A group establishment request observed by [`RecordingGroupEstablisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishCall {
    /// Group to establish.
    pub group_id: GroupId,
    /// Members passed in.
    pub members: Vec<UserId>,
    /// Whether partial establishment was allowed.
    pub allow_partial_member_list: bool,
}

/// Group establisher that records requests.
#[derive(Debug, Default)]
pub struct RecordingGroupEstablisher {
    calls: Mutex<Vec<EstablishCall>>,
    fail: AtomicBool,
}

impl RecordingGroupEstablisher {
    /// Creates an establisher that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent establishment fail.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Returns the recorded requests.
    #[must_use]
    pub fn calls(&self) -> Vec<EstablishCall> {
        self.calls.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl GroupEstablisher for RecordingGroupEstablisher {
    async fn establish_group(
        &self,
        group_id: &GroupId,
        members: &[UserId],
        allow_partial_member_list: bool,
    ) -> Result<(), CoreFailure> {
        self.calls.lock().expect("lock poisoned").push(EstablishCall {
            group_id: group_id.clone(),
            members: members.to_vec(),
            allow_partial_member_list,
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreFailure::Mls("key package claim failed".into()));
        }
        Ok(())
    }
}

// =============================================================================
// System messages
// =============================================================================

/// System message sink that keeps every message.
#[derive(Debug, Default)]
pub struct InMemorySystemMessages {
    messages: Mutex<Vec<SystemMessage>>,
}

impl InMemorySystemMessages {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every inserted message, in insertion order.
    #[must_use]
    pub fn messages(&self) -> Vec<SystemMessage> {
        self.messages.lock().expect("lock poisoned").clone()
    }

    /// Returns the messages inserted for `id`.
    #[must_use]
    pub fn messages_for(&self, id: &ConversationId) -> Vec<SystemMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.conversation_id() == id)
            .collect()
    }
}

#[async_trait]
impl SystemMessageSink for InMemorySystemMessages {
    async fn insert(&self, message: SystemMessage) -> Result<(), StorageError> {
        self.messages.lock().expect("lock poisoned").push(message);
        Ok(())
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Named instants measured against an injected clock.
#[derive(Debug)]
pub struct InMemoryTimestampStore {
    clock: Arc<dyn Clock>,
    instants: Mutex<HashMap<String, DateTime<Utc>>>,
    fail: AtomicBool,
}

impl InMemoryTimestampStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            instants: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent read and write fail.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Returns the stored instant for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.instants.lock().expect("lock poisoned").get(key).copied()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::backend("timestamp store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl TimestampStore for InMemoryTimestampStore {
    async fn has_passed(&self, key: &str, interval: Duration) -> Result<bool, StorageError> {
        self.check()?;
        let Some(last) = self.get(key) else {
            return Ok(true);
        };
        let interval = chrono::Duration::from_std(interval)
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(self.clock.now() - last >= interval)
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.instants
            .lock()
            .expect("lock poisoned")
            .insert(key.to_string(), self.clock.now());
        Ok(())
    }
}

// =============================================================================
// Users and client state
// =============================================================================

/// User refresher that counts refreshes.
#[derive(Debug, Default)]
pub struct CountingUserRefresher {
    refreshes: AtomicUsize,
}

impl CountingUserRefresher {
    /// Creates a new refresher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refreshes performed.
    #[must_use]
    pub fn count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserRefresher for CountingUserRefresher {
    async fn refresh_other_users(&self) -> Result<(), CoreFailure> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Client MLS predicates that can be flipped at runtime.
#[derive(Debug)]
pub struct StaticMlsClientState {
    mls_enabled: AtomicBool,
    mls_client_registered: AtomicBool,
}

impl StaticMlsClientState {
    /// Creates the predicates with the given values.
    #[must_use]
    pub const fn new(mls_enabled: bool, mls_client_registered: bool) -> Self {
        Self {
            mls_enabled: AtomicBool::new(mls_enabled),
            mls_client_registered: AtomicBool::new(mls_client_registered),
        }
    }

    /// Sets the MLS-enabled predicate.
    pub fn set_mls_enabled(&self, enabled: bool) {
        self.mls_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Sets the MLS-client-registered predicate.
    pub fn set_mls_client_registered(&self, registered: bool) {
        self.mls_client_registered.store(registered, Ordering::SeqCst);
    }
}

#[async_trait]
impl MlsClientState for StaticMlsClientState {
    async fn is_mls_enabled(&self) -> bool {
        self.mls_enabled.load(Ordering::SeqCst)
    }

    async fn has_registered_mls_client(&self) -> Result<bool, StorageError> {
        Ok(self.mls_client_registered.load(Ordering::SeqCst))
    }
}

/// Supported protocols updater that records the `synchronise_users` flag of
/// each call.
#[derive(Debug, Default)]
pub struct RecordingProtocolsUpdater {
    calls: Mutex<Vec<bool>>,
}

impl RecordingProtocolsUpdater {
    /// Creates a new updater.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<bool> {
        self.calls.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl SupportedProtocolsUpdater for RecordingProtocolsUpdater {
    async fn update_supported_protocols(
        &self,
        synchronise_users: bool,
    ) -> Result<bool, CoreFailure> {
        self.calls
            .lock()
            .expect("lock poisoned")
            .push(synchronise_users);
        Ok(false)
    }
}
