//! Rate-limited, serialized access to the migration worker.
//!
//! The sequencer is a single tokio task owning the receiving end of a bounded
//! request queue. Every request, whether it comes from the trigger or from a
//! direct [`SequencerHandle::update`] call, is taken off the queue and handled
//! to completion before the next one is read. Two runs therefore never
//! interleave their backend calls.
//!
//! A run is due when [`LAST_MLS_MIGRATION_CHECK`] is older than the configured
//! check interval. The timestamp is reset only after the worker returns
//! without a run-level error, so a failed or cancelled run is retried on the
//! next request instead of one interval later.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MigrationError;
use crate::ports::{LAST_MLS_MIGRATION_CHECK, TimestampStore};
use crate::worker::{MigrationRun, MigrationRunner};

/// Result of one sequencer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The check interval has not elapsed; nothing was called.
    RateLimited,
    /// The worker ran; the rate-limit timestamp was reset.
    Ran(MigrationRun),
    /// The worker failed or was cancelled part way; the rate-limit
    /// timestamp was left untouched.
    WorkerFailed(MigrationError),
}

type Reply = oneshot::Sender<Result<UpdateOutcome, MigrationError>>;

pub(crate) struct UpdateRequest {
    reply: Option<Reply>,
}

/// Cloneable handle to a running sequencer.
#[derive(Debug, Clone)]
pub struct SequencerHandle {
    requests: mpsc::Sender<UpdateRequest>,
}

impl SequencerHandle {
    /// Queues a run and waits for its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Storage`] if the rate-limit timestamp could
    /// not be read or written, and [`MigrationError::SequencerStopped`] if the
    /// sequencer task is gone.
    pub async fn update(&self) -> Result<UpdateOutcome, MigrationError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(UpdateRequest { reply: Some(tx) })
            .await
            .map_err(|_| MigrationError::SequencerStopped)?;
        rx.await.map_err(|_| MigrationError::SequencerStopped)?
    }

    /// Queues a run without waiting for it. The sequencer logs the outcome.
    ///
    /// Never blocks. Returns `false` when the queue is full; the pending
    /// requests already cover this one, since queued runs are rate limited
    /// against each other.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::SequencerStopped`] if the sequencer task is
    /// gone.
    pub fn enqueue(&self) -> Result<bool, MigrationError> {
        match self.requests.try_send(UpdateRequest { reply: None }) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(MigrationError::SequencerStopped),
        }
    }

    /// Returns `true` once the sequencer task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Handle whose requests land in the returned receiver instead of a
    /// running sequencer.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<UpdateRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { requests: tx }, rx)
    }
}

/// The single consumer of the request queue.
pub struct MigrationSequencer {
    runner: Arc<dyn MigrationRunner>,
    timestamps: Arc<dyn TimestampStore>,
    check_interval: Duration,
    requests: mpsc::Receiver<UpdateRequest>,
    cancel: CancellationToken,
}

impl MigrationSequencer {
    /// Spawns the sequencer task and returns its handle.
    ///
    /// The task exits when `cancel` fires or every handle is dropped. A run
    /// already in progress at that point completes first. The queue always
    /// holds at least one request.
    pub fn spawn(
        runner: Arc<dyn MigrationRunner>,
        timestamps: Arc<dyn TimestampStore>,
        check_interval: Duration,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> (SequencerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let sequencer = Self {
            runner,
            timestamps,
            check_interval,
            requests: rx,
            cancel,
        };
        let task = tokio::spawn(sequencer.run());
        (SequencerHandle { requests: tx }, task)
    }

    async fn run(mut self) {
        debug!(check_interval = ?self.check_interval, "Migration sequencer started");
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    debug!("Migration sequencer cancelled");
                    break;
                }

                request = self.requests.recv() => {
                    let Some(request) = request else {
                        debug!("All sequencer handles dropped");
                        break;
                    };
                    let result = self.update().await;
                    match request.reply {
                        Some(reply) => {
                            // The caller may have stopped waiting.
                            let _ = reply.send(result);
                        },
                        None => log_outcome(&result),
                    }
                }
            }
        }
        debug!("Migration sequencer stopped");
    }

    async fn update(&self) -> Result<UpdateOutcome, MigrationError> {
        let due = self
            .timestamps
            .has_passed(LAST_MLS_MIGRATION_CHECK, self.check_interval)
            .await?;
        if !due {
            debug!("MLS migration check not due yet");
            return Ok(UpdateOutcome::RateLimited);
        }

        match self.runner.run_migration().await {
            Ok(run) => {
                self.timestamps.reset(LAST_MLS_MIGRATION_CHECK).await?;
                Ok(UpdateOutcome::Ran(run))
            },
            Err(MigrationError::Cancelled) => {
                info!("MLS migration run cancelled, check stays due");
                Ok(UpdateOutcome::WorkerFailed(MigrationError::Cancelled))
            },
            Err(e) => {
                warn!(error = %e, "MLS migration run failed");
                Ok(UpdateOutcome::WorkerFailed(e))
            },
        }
    }
}

fn log_outcome(result: &Result<UpdateOutcome, MigrationError>) {
    match result {
        Ok(UpdateOutcome::RateLimited) => {},
        Ok(UpdateOutcome::Ran(run)) => match run {
            MigrationRun::NoPolicy | MigrationRun::NotStarted => {
                debug!(?run, "MLS migration check finished without action");
            },
            MigrationRun::Completed {
                migrated,
                finalised,
                window_closed,
            } => info!(
                migrated = migrated.transitioned(),
                finalised = finalised.transitioned(),
                failed = migrated.failures().count() + finalised.failures().count(),
                window_closed,
                "MLS migration run completed"
            ),
        },
        // Logged where it happened.
        Ok(UpdateOutcome::WorkerFailed(_)) => {},
        Err(e) => warn!(error = %e, "MLS migration check failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryTimestampStore;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: bool,
    }

    impl CountingRunner {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MigrationRunner for CountingRunner {
        async fn run_migration(&self) -> Result<MigrationRun, MigrationError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(MigrationError::NoTeam);
            }
            Ok(MigrationRun::NotStarted)
        }
    }

    struct Arrangement {
        clock: Arc<ManualClock>,
        timestamps: Arc<InMemoryTimestampStore>,
        runner: Arc<CountingRunner>,
        handle: SequencerHandle,
        task: JoinHandle<()>,
        cancel: CancellationToken,
    }

    fn arrange(runner: CountingRunner) -> Arrangement {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let timestamps = Arc::new(InMemoryTimestampStore::new(clock.clone()));
        let runner = Arc::new(runner);
        let cancel = CancellationToken::new();
        let (handle, task) = MigrationSequencer::spawn(
            runner.clone(),
            timestamps.clone(),
            DAY,
            4,
            cancel.clone(),
        );
        Arrangement {
            clock,
            timestamps,
            runner,
            handle,
            task,
            cancel,
        }
    }

    #[tokio::test]
    async fn second_update_within_interval_is_rate_limited() {
        let a = arrange(CountingRunner::default());

        let first = a.handle.update().await.unwrap();
        let second = a.handle.update().await.unwrap();

        assert_eq!(first, UpdateOutcome::Ran(MigrationRun::NotStarted));
        assert_eq!(second, UpdateOutcome::RateLimited);
        assert_eq!(a.runner.runs(), 1);
    }

    #[tokio::test]
    async fn update_after_interval_runs_again() {
        let a = arrange(CountingRunner::default());

        a.handle.update().await.unwrap();
        a.clock.advance(chrono::Duration::hours(24));
        let second = a.handle.update().await.unwrap();

        assert!(matches!(second, UpdateOutcome::Ran(_)));
        assert_eq!(a.runner.runs(), 2);
    }

    #[tokio::test]
    async fn failed_run_leaves_timestamp_untouched() {
        let a = arrange(CountingRunner::failing());

        let first = a.handle.update().await.unwrap();
        assert_eq!(first, UpdateOutcome::WorkerFailed(MigrationError::NoTeam));
        assert_eq!(a.timestamps.get(LAST_MLS_MIGRATION_CHECK), None);

        a.handle.update().await.unwrap();
        assert_eq!(a.runner.runs(), 2);
    }

    #[tokio::test]
    async fn timestamp_storage_failure_is_returned() {
        let a = arrange(CountingRunner::default());
        a.timestamps.fail(true);

        let err = a.handle.update().await.unwrap_err();
        assert!(matches!(err, MigrationError::Storage(_)));
        assert_eq!(a.runner.runs(), 0);
    }

    #[tokio::test]
    async fn concurrent_updates_never_overlap() {
        let a = arrange(CountingRunner::failing());

        let updates = (0..3).map(|_| {
            let handle = a.handle.clone();
            tokio::spawn(async move { handle.update().await })
        });
        for update in updates.collect::<Vec<_>>() {
            update.await.unwrap().unwrap();
        }

        assert_eq!(a.runner.runs(), 3);
        assert_eq!(a.runner.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueued_request_runs_in_background() {
        let a = arrange(CountingRunner::default());

        assert!(a.handle.enqueue().unwrap());
        // Requests are handled in order, so this one observes the first.
        let second = a.handle.update().await.unwrap();

        assert_eq!(second, UpdateOutcome::RateLimited);
        assert_eq!(a.runner.runs(), 1);
    }

    #[tokio::test]
    async fn cancelled_sequencer_rejects_updates() {
        let a = arrange(CountingRunner::default());

        a.cancel.cancel();
        a.task.await.unwrap();

        assert!(a.handle.is_closed());
        let err = a.handle.update().await.unwrap_err();
        assert_eq!(err, MigrationError::SequencerStopped);
    }

    #[tokio::test]
    async fn full_queue_merges_requests() {
        let (handle, mut requests) = SequencerHandle::detached(2);

        assert!(handle.enqueue().unwrap());
        assert!(handle.enqueue().unwrap());
        assert!(!handle.enqueue().unwrap());

        assert!(requests.try_recv().is_ok());
        assert!(requests.try_recv().is_ok());
        assert!(requests.try_recv().is_err());

        drop(requests);
        assert_eq!(handle.enqueue(), Err(MigrationError::SequencerStopped));
    }

    #[tokio::test]
    async fn zero_capacity_queue_still_accepts_requests() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let runner = Arc::new(CountingRunner::default());
        let (handle, _task) = MigrationSequencer::spawn(
            runner.clone(),
            Arc::new(InMemoryTimestampStore::new(clock)),
            DAY,
            0,
            CancellationToken::new(),
        );

        assert!(matches!(handle.update().await.unwrap(), UpdateOutcome::Ran(_)));
        assert_eq!(runner.runs(), 1);
    }
}
