//! Reacts to sync state changes by queueing migration checks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::SyncState;
use crate::ports::MlsClientState;
use crate::sequencer::SequencerHandle;

/// Stateful filter passing only transitions into [`SyncState::Live`].
///
/// Repeated states are dropped (distinct until changed). With `skip_initial`
/// the first observed state is dropped too, so a client that is already live
/// when the trigger starts waits for the next reconnect.
#[derive(Debug, Clone)]
pub struct LiveTransitionFilter {
    previous: Option<SyncState>,
    skip_initial: bool,
}

impl LiveTransitionFilter {
    /// Creates a filter that has seen nothing yet.
    #[must_use]
    pub const fn new(skip_initial: bool) -> Self {
        Self {
            previous: None,
            skip_initial,
        }
    }

    /// Feeds `state` and returns `true` if it is an entry into Live.
    pub fn accept(&mut self, state: SyncState) -> bool {
        let previous = self.previous.replace(state);
        match previous {
            Some(previous) if previous == state => false,
            None if self.skip_initial => false,
            _ => state.is_live(),
        }
    }
}

/// Task queueing a sequencer run on every entry into Live while MLS is
/// usable on this client.
pub struct MigrationTrigger {
    states: mpsc::Receiver<SyncState>,
    client: Arc<dyn MlsClientState>,
    sequencer: SequencerHandle,
    filter: LiveTransitionFilter,
    cancel: CancellationToken,
}

impl MigrationTrigger {
    /// Creates a trigger reading from `states`.
    #[must_use]
    pub fn new(
        states: mpsc::Receiver<SyncState>,
        client: Arc<dyn MlsClientState>,
        sequencer: SequencerHandle,
        skip_initial_state: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            states,
            client,
            sequencer,
            filter: LiveTransitionFilter::new(skip_initial_state),
            cancel,
        }
    }

    /// Spawns [`Self::run`] on the current runtime.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until cancelled, until the state publisher goes away, or until
    /// the sequencer stops.
    pub async fn run(mut self) {
        loop {
            let state = tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    debug!("Migration trigger cancelled");
                    break;
                }

                state = self.states.recv() => match state {
                    Some(state) => state,
                    None => {
                        debug!("Sync state publisher closed");
                        break;
                    }
                },
            };

            if !self.filter.accept(state) || !self.may_migrate().await {
                continue;
            }

            match self.sequencer.enqueue() {
                Ok(true) => debug!("Sync is live, queued MLS migration check"),
                Ok(false) => debug!("Sync is live, MLS migration check already pending"),
                Err(e) => {
                    warn!(error = %e, "Migration sequencer unavailable, stopping trigger");
                    break;
                },
            }
        }
    }

    async fn may_migrate(&self) -> bool {
        if !self.client.is_mls_enabled().await {
            debug!("MLS disabled, not checking migration");
            return false;
        }
        match self.client.has_registered_mls_client().await {
            Ok(true) => true,
            Ok(false) => {
                debug!("No MLS client registered, not checking migration");
                false
            },
            Err(e) => {
                warn!(error = %e, "Failed to read MLS client registration");
                false
            },
        }
    }
}
