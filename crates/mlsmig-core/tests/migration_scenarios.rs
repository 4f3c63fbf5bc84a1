//! End-to-end migration scenarios over in-memory collaborators.
//!
//! Each test drives the real sequencer, worker and migrator. Only the
//! collaborators behind the port traits are in-memory.
//!
//! ```bash
//! cargo test -p mlsmig-core --test migration_scenarios
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mlsmig_core::clock::ManualClock;
use mlsmig_core::memory::{
    ConversationRecord, CountingUserRefresher, FixedSelfTeam, InMemoryConversationStore,
    InMemorySystemMessages, InMemoryTimestampStore, InMemoryUserConfigStore,
    RecordingGroupEstablisher, RecordingProtocolsUpdater, StaticFeatureConfigSource,
};
use mlsmig_core::model::{FeatureConfigs, GroupId};
use mlsmig_core::ports::{GroupEstablisher, LAST_MLS_MIGRATION_CHECK};
use mlsmig_core::{
    AttemptOutcome, ConversationId, CoreFailure, FeatureStatus, MigrationError,
    MigrationPolicy, MigrationRun, MigrationSequencer, MigrationWorker, Migrator, MigratorPorts,
    NetworkError, Protocol, SequencerHandle, SystemMessage, TeamId, UpdateOutcome, UserId,
};
use tokio_util::sync::CancellationToken;

const SELF_USER: &str = "self@wire.test";
const CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

struct Harness {
    clock: Arc<ManualClock>,
    source: Arc<StaticFeatureConfigSource>,
    conversations: Arc<InMemoryConversationStore>,
    messages: Arc<InMemorySystemMessages>,
    timestamps: Arc<InMemoryTimestampStore>,
    sequencer: SequencerHandle,
}

impl Harness {
    fn new(policy: MigrationPolicy, records: Vec<ConversationRecord>) -> Self {
        Self::with_self_team(policy, records, FixedSelfTeam::team(team()))
    }

    fn with_self_team(
        policy: MigrationPolicy,
        records: Vec<ConversationRecord>,
        self_team: FixedSelfTeam,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(now()));
        let source = Arc::new(StaticFeatureConfigSource::new(FeatureConfigs {
            mls_migration: policy,
            ..FeatureConfigs::default()
        }));
        let conversations = Arc::new(InMemoryConversationStore::new(records));
        let messages = Arc::new(InMemorySystemMessages::new());
        let timestamps = Arc::new(InMemoryTimestampStore::new(clock.clone()));

        let migrator = Migrator::new(
            MigratorPorts {
                self_team: Arc::new(self_team),
                conversations: conversations.clone(),
                protocol_updater: conversations.clone(),
                groups: Arc::new(RecordingGroupEstablisher::new()),
                calls: conversations.clone(),
                system_messages: messages.clone(),
                users: Arc::new(CountingUserRefresher::new()),
            },
            UserId::new(SELF_USER),
        );
        let worker = MigrationWorker::new(
            source.clone(),
            Arc::new(InMemoryUserConfigStore::new()),
            Arc::new(RecordingProtocolsUpdater::new()),
            Arc::new(migrator),
            clock.clone(),
        );
        let (sequencer, _task) = MigrationSequencer::spawn(
            Arc::new(worker),
            timestamps.clone(),
            CHECK_INTERVAL,
            8,
            CancellationToken::new(),
        );

        Self {
            clock,
            source,
            conversations,
            messages,
            timestamps,
            sequencer,
        }
    }

    async fn update(&self) -> UpdateOutcome {
        self.sequencer.update().await.expect("sequencer running")
    }

    fn protocol(&self, id: &str) -> Option<Protocol> {
        self.conversations.protocol_of(&ConversationId::new(id))
    }
}

fn now() -> DateTime<Utc> {
    "2026-03-01T12:00:00Z".parse().unwrap()
}

fn yesterday() -> DateTime<Utc> {
    now() - chrono::Duration::days(1)
}

fn team() -> TeamId {
    TeamId::new("team-wire")
}

fn policy(start_time: Option<DateTime<Utc>>, end_time: Option<DateTime<Utc>>) -> MigrationPolicy {
    MigrationPolicy {
        status: FeatureStatus::Enabled,
        start_time,
        end_time,
    }
}

fn completed(outcome: UpdateOutcome) -> (mlsmig_core::PassReport, mlsmig_core::PassReport, bool) {
    match outcome {
        UpdateOutcome::Ran(MigrationRun::Completed {
            migrated,
            finalised,
            window_closed,
        }) => (migrated, finalised, window_closed),
        other => panic!("expected a completed run, got {other:?}"),
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn scenario_a_proteus_conversation_becomes_mixed() {
    let h = Harness::new(
        policy(Some(yesterday()), None),
        vec![ConversationRecord::team_group("c1", &team(), Protocol::Proteus)],
    );

    let (migrated, _, window_closed) = completed(h.update().await);

    assert!(!window_closed);
    assert_eq!(migrated.transitioned(), 1);
    assert_eq!(h.protocol("c1"), Some(Protocol::Mixed));
    assert_eq!(
        h.messages.messages(),
        vec![SystemMessage::ProtocolChanged {
            conversation_id: ConversationId::new("c1"),
            protocol: Protocol::Mixed,
            sender: UserId::new(SELF_USER),
        }]
    );
}

#[tokio::test]
async fn scenario_b_transition_during_call_adds_call_notice() {
    let h = Harness::new(
        policy(Some(yesterday()), None),
        vec![ConversationRecord::team_group("c1", &team(), Protocol::Proteus).with_call()],
    );

    h.update().await;

    let messages = h.messages.messages();
    assert_eq!(messages.len(), 2);
    assert!(matches!(messages[0], SystemMessage::ProtocolChanged { .. }));
    assert!(matches!(
        messages[1],
        SystemMessage::ProtocolChangedDuringCall { .. }
    ));
}

#[tokio::test]
async fn scenario_c_closed_window_forces_unready_conversation_to_mls() {
    let h = Harness::new(
        policy(Some(yesterday()), Some(yesterday())),
        vec![ConversationRecord::team_group("c1", &team(), Protocol::Mixed)],
    );

    let (_, finalised, window_closed) = completed(h.update().await);

    assert!(window_closed);
    assert_eq!(finalised.transitioned(), 1);
    assert_eq!(h.protocol("c1"), Some(Protocol::Mls));
}

#[tokio::test]
async fn scenario_c_open_window_skips_unready_conversation() {
    let future = now() + chrono::Duration::days(30);
    for end_time in [None, Some(future)] {
        let h = Harness::new(
            policy(Some(yesterday()), end_time),
            vec![ConversationRecord::team_group("c1", &team(), Protocol::Mixed)],
        );

        let (_, finalised, window_closed) = completed(h.update().await);

        assert!(!window_closed);
        assert!(finalised.attempts.is_empty());
        assert_eq!(h.protocol("c1"), Some(Protocol::Mixed));
    }
}

#[tokio::test]
async fn scenario_d_feature_config_failure_leaves_everything_untouched() {
    let h = Harness::new(
        policy(Some(yesterday()), None),
        vec![ConversationRecord::team_group("c1", &team(), Protocol::Proteus)],
    );
    h.source
        .set_failure(CoreFailure::Network(NetworkError::NoConnection));

    let outcome = h.update().await;

    assert!(matches!(
        outcome,
        UpdateOutcome::WorkerFailed(MigrationError::FeatureConfigSync(_))
    ));
    assert_eq!(h.timestamps.get(LAST_MLS_MIGRATION_CHECK), None);
    assert!(h.conversations.update_calls().is_empty());
    assert_eq!(h.protocol("c1"), Some(Protocol::Proteus));
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn missing_start_time_never_migrates() {
    let h = Harness::new(
        policy(None, None),
        vec![ConversationRecord::team_group("c1", &team(), Protocol::Proteus)],
    );

    let outcome = h.update().await;

    assert_eq!(outcome, UpdateOutcome::Ran(MigrationRun::NotStarted));
    assert!(h.conversations.update_calls().is_empty());
}

#[tokio::test]
async fn open_ended_window_never_finalises_all() {
    let h = Harness::new(
        policy(Some(yesterday()), None),
        vec![
            ConversationRecord::team_group("c1", &team(), Protocol::Proteus),
            ConversationRecord::team_group("c2", &team(), Protocol::Mixed),
        ],
    );

    for _ in 0..3 {
        let (_, _, window_closed) = completed(h.update().await);
        assert!(!window_closed);
        h.clock.advance(chrono::Duration::days(365));
    }
    assert_eq!(h.protocol("c2"), Some(Protocol::Mixed));
}

#[tokio::test]
async fn failing_conversation_does_not_block_the_others() {
    let records = (1..=5)
        .map(|i| ConversationRecord::team_group(&format!("c{i}"), &team(), Protocol::Proteus))
        .collect();
    let h = Harness::new(policy(Some(yesterday()), None), records);
    h.conversations
        .fail_updates_for(&ConversationId::new("c3"));

    let (migrated, _, _) = completed(h.update().await);

    assert_eq!(migrated.attempts.len(), 5);
    assert_eq!(migrated.transitioned(), 4);
    assert!(matches!(
        migrated.outcome_of(&ConversationId::new("c3")),
        Some(AttemptOutcome::Failed(_))
    ));
    for id in ["c1", "c2", "c4", "c5"] {
        assert_eq!(h.protocol(id), Some(Protocol::Mixed), "{id}");
    }
    assert!(h.timestamps.get(LAST_MLS_MIGRATION_CHECK).is_some());
}

#[tokio::test]
async fn repeated_runs_do_not_duplicate_messages() {
    let h = Harness::new(
        policy(Some(yesterday()), None),
        vec![ConversationRecord::team_group("c1", &team(), Protocol::Proteus)],
    );

    h.update().await;
    h.clock.advance(chrono::Duration::days(2));
    let (migrated, _, _) = completed(h.update().await);

    assert!(migrated.attempts.is_empty());
    assert_eq!(h.messages.messages_for(&ConversationId::new("c1")).len(), 1);
}

#[tokio::test]
async fn protocols_only_move_forward() {
    let h = Harness::new(
        policy(Some(yesterday()), Some(now() + chrono::Duration::days(1))),
        vec![
            ConversationRecord::team_group("c1", &team(), Protocol::Proteus),
            ConversationRecord::team_group("c2", &team(), Protocol::Mixed).ready(),
            ConversationRecord::team_group("c3", &team(), Protocol::Mls),
        ],
    );

    h.update().await;
    h.clock.advance(chrono::Duration::days(2));
    h.update().await;

    for id in ["c1", "c2", "c3"] {
        let history = h.conversations.protocol_history(&ConversationId::new(id));
        assert!(
            history.windows(2).all(|w| w[0].rank() < w[1].rank()),
            "{id}: {history:?}"
        );
        assert_eq!(h.protocol(id), Some(Protocol::Mls), "{id}");
    }
}

#[tokio::test]
async fn triggers_within_interval_make_no_backend_calls() {
    let h = Harness::new(
        policy(Some(yesterday()), None),
        vec![ConversationRecord::team_group("c1", &team(), Protocol::Proteus)],
    );

    h.update().await;
    let calls = h.conversations.update_calls().len();
    h.clock.advance(chrono::Duration::hours(23));
    let outcome = h.update().await;

    assert_eq!(outcome, UpdateOutcome::RateLimited);
    assert_eq!(h.source.fetch_count(), 1);
    assert_eq!(h.conversations.update_calls().len(), calls);
}

#[tokio::test]
async fn triggers_past_interval_both_call_backend() {
    let h = Harness::new(policy(Some(yesterday()), None), Vec::new());

    h.update().await;
    h.clock.advance(chrono::Duration::hours(25));
    h.update().await;

    assert_eq!(h.source.fetch_count(), 2);
}

#[tokio::test]
async fn unresolved_team_is_retried_on_next_trigger() {
    let h = Harness::with_self_team(
        policy(Some(yesterday()), None),
        vec![ConversationRecord::team_group("c1", &team(), Protocol::Proteus)],
        FixedSelfTeam::failing(CoreFailure::Network(NetworkError::NoConnection)),
    );

    let first = h.update().await;
    let second = h.update().await;

    assert!(matches!(
        first,
        UpdateOutcome::WorkerFailed(MigrationError::SelfTeamUnresolved(_))
    ));
    assert!(matches!(second, UpdateOutcome::WorkerFailed(_)));
    assert_eq!(h.source.fetch_count(), 2);
    assert_eq!(h.timestamps.get(LAST_MLS_MIGRATION_CHECK), None);
}

/// Establishes groups, then requests shutdown after the first one.
struct CancellingEstablisher {
    cancel: CancellationToken,
}

#[async_trait]
impl GroupEstablisher for CancellingEstablisher {
    async fn establish_group(
        &self,
        _group_id: &GroupId,
        _members: &[UserId],
        _allow_partial_member_list: bool,
    ) -> Result<(), CoreFailure> {
        self.cancel.cancel();
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_mid_pass_keeps_the_check_due() {
    let clock = Arc::new(ManualClock::new(now()));
    let source = Arc::new(StaticFeatureConfigSource::new(FeatureConfigs {
        mls_migration: policy(Some(yesterday()), Some(yesterday())),
        ..FeatureConfigs::default()
    }));
    let conversations = Arc::new(InMemoryConversationStore::new(vec![
        ConversationRecord::team_group("c1", &team(), Protocol::Proteus),
        ConversationRecord::team_group("c2", &team(), Protocol::Proteus),
        ConversationRecord::team_group("mixed", &team(), Protocol::Mixed),
    ]));
    let timestamps = Arc::new(InMemoryTimestampStore::new(clock.clone()));
    let users = Arc::new(CountingUserRefresher::new());
    let migration_cancel = CancellationToken::new();

    let migrator = Migrator::new(
        MigratorPorts {
            self_team: Arc::new(FixedSelfTeam::team(team())),
            conversations: conversations.clone(),
            protocol_updater: conversations.clone(),
            groups: Arc::new(CancellingEstablisher {
                cancel: migration_cancel.clone(),
            }),
            calls: conversations.clone(),
            system_messages: Arc::new(InMemorySystemMessages::new()),
            users: users.clone(),
        },
        UserId::new(SELF_USER),
    )
    .with_cancellation(migration_cancel);
    let worker = MigrationWorker::new(
        source,
        Arc::new(InMemoryUserConfigStore::new()),
        Arc::new(RecordingProtocolsUpdater::new()),
        Arc::new(migrator),
        clock.clone(),
    );
    let (sequencer, _task) = MigrationSequencer::spawn(
        Arc::new(worker),
        timestamps.clone(),
        CHECK_INTERVAL,
        8,
        CancellationToken::new(),
    );

    let outcome = sequencer.update().await.unwrap();

    assert_eq!(
        outcome,
        UpdateOutcome::WorkerFailed(MigrationError::Cancelled)
    );
    assert_eq!(
        conversations.protocol_of(&ConversationId::new("c1")),
        Some(Protocol::Mixed)
    );
    assert_eq!(
        conversations.protocol_of(&ConversationId::new("c2")),
        Some(Protocol::Proteus)
    );
    // The finalise pass never started.
    assert_eq!(
        conversations.protocol_of(&ConversationId::new("mixed")),
        Some(Protocol::Mixed)
    );
    assert_eq!(users.count(), 0);
    assert_eq!(timestamps.get(LAST_MLS_MIGRATION_CHECK), None);
}
