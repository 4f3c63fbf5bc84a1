//! Property tests over arbitrary sequences of migration passes.
//!
//! ```bash
//! cargo test -p mlsmig-core --test protocol_properties
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use mlsmig_core::memory::{
    ConversationRecord, CountingUserRefresher, FixedSelfTeam, InMemoryConversationStore,
    InMemorySystemMessages, RecordingGroupEstablisher,
};
use mlsmig_core::{
    ConversationId, MigrationExecutor, Migrator, MigratorPorts, Protocol, SystemMessage, TeamId,
    UserId,
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Pass {
    Migrate,
    Finalise,
    FinaliseAll,
}

#[derive(Debug, Clone)]
struct Conversation {
    protocol: Protocol,
    ready: bool,
    with_call: bool,
    failing: bool,
}

fn arb_protocol() -> impl Strategy<Value = Protocol> {
    prop_oneof![
        Just(Protocol::Proteus),
        Just(Protocol::Mixed),
        Just(Protocol::Mls),
    ]
}

fn arb_conversation() -> impl Strategy<Value = Conversation> {
    (
        arb_protocol(),
        any::<bool>(),
        any::<bool>(),
        prop::bool::weighted(0.2),
    )
        .prop_map(|(protocol, ready, with_call, failing)| Conversation {
            protocol,
            ready,
            with_call,
            failing,
        })
}

fn arb_pass() -> impl Strategy<Value = Pass> {
    prop_oneof![
        Just(Pass::Migrate),
        Just(Pass::Finalise),
        Just(Pass::FinaliseAll),
    ]
}

/// Protocol a conversation should end on after `passes`.
fn expected_protocol(conversation: &Conversation, passes: &[Pass]) -> Protocol {
    if conversation.failing {
        return conversation.protocol;
    }
    passes
        .iter()
        .fold(conversation.protocol, |protocol, pass| match (pass, protocol) {
            (Pass::Migrate, Protocol::Proteus) => Protocol::Mixed,
            (Pass::Finalise, Protocol::Mixed) if conversation.ready => Protocol::Mls,
            (Pass::FinaliseAll, Protocol::Mixed) => Protocol::Mls,
            (_, protocol) => protocol,
        })
}

struct Run {
    store: Arc<InMemoryConversationStore>,
    messages: Arc<InMemorySystemMessages>,
}

fn run_passes(conversations: &[Conversation], passes: &[Pass]) -> Run {
    let team = TeamId::new("team");
    let records = conversations
        .iter()
        .enumerate()
        .map(|(index, conversation)| {
            let mut record =
                ConversationRecord::team_group(&format!("c{index}"), &team, conversation.protocol);
            if conversation.ready {
                record = record.ready();
            }
            if conversation.with_call {
                record = record.with_call();
            }
            record
        })
        .collect();
    let store = Arc::new(InMemoryConversationStore::new(records));
    for (index, conversation) in conversations.iter().enumerate() {
        if conversation.failing {
            store.fail_updates_for(&ConversationId::new(format!("c{index}")));
        }
    }
    let messages = Arc::new(InMemorySystemMessages::new());
    let migrator = Migrator::new(
        MigratorPorts {
            self_team: Arc::new(FixedSelfTeam::team(team)),
            conversations: store.clone(),
            protocol_updater: store.clone(),
            groups: Arc::new(RecordingGroupEstablisher::new()),
            calls: store.clone(),
            system_messages: messages.clone(),
            users: Arc::new(CountingUserRefresher::new()),
        },
        UserId::new("self"),
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        for pass in passes {
            match pass {
                Pass::Migrate => migrator.migrate_proteus_conversations().await.unwrap(),
                Pass::Finalise => migrator.finalise_proteus_conversations().await.unwrap(),
                Pass::FinaliseAll => migrator
                    .finalise_all_proteus_conversations()
                    .await
                    .unwrap(),
            };
        }
    });

    Run { store, messages }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Protocols only ever move forward, one step at a time.
    #[test]
    fn prop_protocol_history_is_strictly_increasing(
        conversations in prop::collection::vec(arb_conversation(), 1..8),
        passes in prop::collection::vec(arb_pass(), 0..8),
    ) {
        let run = run_passes(&conversations, &passes);
        for index in 0..conversations.len() {
            let history = run
                .store
                .protocol_history(&ConversationId::new(format!("c{index}")));
            for step in history.windows(2) {
                prop_assert_eq!(step[1].rank(), step[0].rank() + 1);
            }
        }
    }

    /// Each conversation ends where the pass sequence says it should.
    #[test]
    fn prop_final_protocol_follows_passes(
        conversations in prop::collection::vec(arb_conversation(), 1..8),
        passes in prop::collection::vec(arb_pass(), 0..8),
    ) {
        let run = run_passes(&conversations, &passes);
        for (index, conversation) in conversations.iter().enumerate() {
            let id = ConversationId::new(format!("c{index}"));
            prop_assert_eq!(
                run.store.protocol_of(&id),
                Some(expected_protocol(conversation, &passes))
            );
        }
    }

    /// A protocol change is announced once, and only for changes that happened.
    #[test]
    fn prop_protocol_changes_are_announced_once(
        conversations in prop::collection::vec(arb_conversation(), 1..8),
        passes in prop::collection::vec(arb_pass(), 0..8),
    ) {
        let run = run_passes(&conversations, &passes);
        let mut announced: HashMap<(ConversationId, Protocol), usize> = HashMap::new();
        for message in run.messages.messages() {
            if let SystemMessage::ProtocolChanged { conversation_id, protocol, .. } = message {
                *announced.entry((conversation_id, protocol)).or_default() += 1;
            }
        }

        for ((id, protocol), count) in &announced {
            prop_assert_eq!(*count, 1);
            let history = run.store.protocol_history(id);
            prop_assert!(history.iter().skip(1).any(|step| step == protocol));
        }
        for index in 0..conversations.len() {
            let id = ConversationId::new(format!("c{index}"));
            for protocol in run.store.protocol_history(&id).into_iter().skip(1) {
                prop_assert!(announced.contains_key(&(id.clone(), protocol)));
            }
        }
    }
}
