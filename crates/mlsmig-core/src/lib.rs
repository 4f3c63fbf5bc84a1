//! # mlsmig-core
//!
//! Orchestrates the migration of a team's conversations from Proteus to MLS.
//!
//! Three components run in a fixed pipeline:
//!
//! - [`MigrationTrigger`] watches the sync state stream and queues a check on
//!   every entry into [`SyncState::Live`] while MLS is usable on this client.
//! - [`MigrationSequencer`] runs queued checks one at a time, skipping those
//!   that arrive within the configured interval of the last successful one.
//! - [`MigrationWorker`] refreshes the backend feature configuration and then
//!   asks the [`Migrator`] to advance conversations by one protocol step.
//!
//! ## Protocol State Machine
//!
//! ```text
//! Proteus --migrate--> Mixed --finalise (ready)--> Mls
//!                            --finalise all (window closed)--> Mls
//! ```
//!
//! Transitions never go backwards. A failure on one conversation is recorded
//! in the [`PassReport`] and never stops the others.
//!
//! ## Collaborators
//!
//! Storage, transport, crypto and the call subsystem stay outside this crate
//! behind the traits in [`ports`]. The [`memory`] module implements all of
//! them in memory for tests and simulations.

pub mod clock;
pub mod config;
pub mod error;
pub mod feature_config;
pub mod memory;
pub mod migrator;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod protocols;
pub mod sequencer;
pub mod trigger;
pub mod worker;

pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, MigrationConfig};
pub use error::{ConversationFailure, CoreFailure, MigrationError, NetworkError, StorageError};
pub use migrator::{AttemptOutcome, MigrationExecutor, Migrator, MigratorPorts, PassReport};
pub use model::{
    ConversationId, ConversationType, FeatureStatus, MigrationPolicy, Protocol, SyncState,
    SystemMessage, TeamId, UserId,
};
pub use orchestrator::{Collaborators, MigrationOrchestrator};
pub use sequencer::{MigrationSequencer, SequencerHandle, UpdateOutcome};
pub use trigger::{LiveTransitionFilter, MigrationTrigger};
pub use worker::{MigrationRun, MigrationRunner, MigrationWorker};
