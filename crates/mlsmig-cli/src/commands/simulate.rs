//! `mlsmig simulate`: run a scenario through the orchestrator.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mlsmig_core::clock::ManualClock;
use mlsmig_core::memory::{
    CountingUserRefresher, FixedSelfTeam, InMemoryConversationStore, InMemorySystemMessages,
    InMemoryTimestampStore, InMemoryUserConfigStore, RecordingGroupEstablisher,
    StaticFeatureConfigSource, StaticMlsClientState,
};
use mlsmig_core::model::SupportedProtocol;
use mlsmig_core::ports::LAST_MLS_MIGRATION_CHECK;
use mlsmig_core::{
    Collaborators, ConversationId, CoreFailure, MigrationConfig, MigrationOrchestrator,
    MigratorPorts, NetworkError, Protocol, SystemMessage,
};
use serde::Serialize;
use tracing::info;

use crate::scenario::Scenario;
use crate::supported_protocols::SelfProtocolsAdvertiser;

/// Final state of a simulated client.
#[derive(Debug, Serialize)]
pub struct Summary {
    /// Conversations, in store order.
    pub conversations: Vec<ConversationSummary>,
    /// Inserted system messages, in insertion order.
    pub system_messages: Vec<SystemMessage>,
    /// Remote protocol update calls issued.
    pub protocol_updates: usize,
    /// Feature config fetches issued.
    pub feature_config_fetches: usize,
    /// Group establishment requests issued.
    pub group_establishments: usize,
    /// Protocols the self user advertises.
    pub advertised_protocols: Option<BTreeSet<SupportedProtocol>>,
    /// Last successful migration check.
    pub last_check: Option<DateTime<Utc>>,
}

/// One conversation's protocol trail.
#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: ConversationId,
    /// Current protocol.
    pub protocol: Protocol,
    /// Protocols held, oldest first.
    pub history: Vec<Protocol>,
}

/// Runs `scenario_path` and prints the summary.
pub fn run(config: &MigrationConfig, scenario_path: &Path, json: bool) -> Result<()> {
    let scenario = Scenario::from_file(scenario_path)?;
    let summary = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(simulate(config, &scenario))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

/// Plays every session of `scenario` against fresh orchestrators sharing
/// one set of in-memory stores.
pub async fn simulate(config: &MigrationConfig, scenario: &Scenario) -> Result<Summary> {
    let clock = Arc::new(ManualClock::new(scenario.now));
    let source = Arc::new(StaticFeatureConfigSource::new(
        scenario.feature_configs.clone(),
    ));
    let user_config = Arc::new(InMemoryUserConfigStore::new());
    let conversations = Arc::new(InMemoryConversationStore::new(
        scenario.conversation_records(),
    ));
    for id in scenario.failing_conversations() {
        conversations.fail_updates_for(id);
    }
    let groups = Arc::new(RecordingGroupEstablisher::new());
    let messages = Arc::new(InMemorySystemMessages::new());
    let timestamps = Arc::new(InMemoryTimestampStore::new(clock.clone()));
    let client_state = Arc::new(StaticMlsClientState::new(
        scenario.mls_enabled,
        scenario.mls_client_registered,
    ));
    let advertiser = Arc::new(SelfProtocolsAdvertiser::new(
        user_config.clone(),
        client_state.clone(),
        clock.clone(),
        scenario.self_clients.clone(),
        scenario.current_client.clone(),
    ));
    let self_team = scenario
        .team
        .clone()
        .map_or_else(FixedSelfTeam::none, FixedSelfTeam::team);

    let collaborators = Collaborators {
        self_user_id: scenario.self_user.clone(),
        migrator: MigratorPorts {
            self_team: Arc::new(self_team),
            conversations: conversations.clone(),
            protocol_updater: conversations.clone(),
            groups: groups.clone(),
            calls: conversations.clone(),
            system_messages: messages.clone(),
            users: Arc::new(CountingUserRefresher::new()),
        },
        feature_configs: source.clone(),
        user_config,
        protocols_updater: advertiser.clone(),
        timestamps: timestamps.clone(),
        client_state,
        clock: clock.clone(),
    };

    for (index, session) in scenario.sessions.iter().enumerate() {
        if let Some(after) = session.after {
            clock.advance(
                chrono::Duration::from_std(after).context("session gap out of range")?,
            );
        }
        if session.feature_config_offline {
            source.set_failure(CoreFailure::Network(NetworkError::NoConnection));
        } else {
            source.set_configs(scenario.feature_configs.clone());
        }

        info!(session = index + 1, states = ?session.sync, "Starting session");
        let orchestrator = MigrationOrchestrator::start(config, collaborators.clone())
            .context("invalid migration configuration")?;
        let sync_states = orchestrator.sync_states();
        for state in &session.sync {
            sync_states
                .send(*state)
                .await
                .context("migration trigger stopped")?;
        }
        drop(sync_states);
        orchestrator.drain().await;
    }

    Ok(Summary {
        conversations: conversations
            .records()
            .into_iter()
            .map(|record| ConversationSummary {
                history: conversations.protocol_history(&record.id),
                id: record.id,
                protocol: record.protocol,
            })
            .collect(),
        system_messages: messages.messages(),
        protocol_updates: conversations.update_calls().len(),
        feature_config_fetches: source.fetch_count(),
        group_establishments: groups.calls().len(),
        advertised_protocols: advertiser.advertised(),
        last_check: timestamps.get(LAST_MLS_MIGRATION_CHECK),
    })
}

fn print_summary(summary: &Summary) {
    println!("Conversations:");
    for conversation in &summary.conversations {
        let trail = conversation
            .history
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        println!(
            "  {:<24} {:<8} ({trail})",
            conversation.id.as_str(),
            conversation.protocol.as_str()
        );
    }

    println!("System messages:");
    if summary.system_messages.is_empty() {
        println!("  (none)");
    }
    for message in &summary.system_messages {
        match message {
            SystemMessage::ProtocolChanged {
                conversation_id,
                protocol,
                sender,
            } => println!("  {conversation_id}: {sender} changed protocol to {protocol}"),
            SystemMessage::ProtocolChangedDuringCall {
                conversation_id,
                sender,
            } => println!("  {conversation_id}: {sender} changed protocol during a call"),
        }
    }

    println!("Backend:");
    println!("  feature config fetches: {}", summary.feature_config_fetches);
    println!("  protocol updates:       {}", summary.protocol_updates);
    println!("  group establishments:   {}", summary.group_establishments);
    if let Some(protocols) = &summary.advertised_protocols {
        println!("  advertised protocols:   {protocols:?}");
    }
    match summary.last_check {
        Some(at) => println!("  last migration check:   {}", at.to_rfc3339()),
        None => println!("  last migration check:   never"),
    }
}
