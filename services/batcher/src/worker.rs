//! Periodic batch worker.
//!
//! Starts a batch against one target every interval until shutdown. Batches
//! run concurrently, so a new one can start while earlier ones are still in
//! flight.

use std::sync::Arc;
use std::time::Duration;

use fleet_transport::Transport;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, instrument, warn};

use crate::batch::{Batch, BatchState};
use crate::error::BatchError;
use crate::scheduler::BatchScheduler;

/// Batch outcomes seen by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Batches that could not be planned or tracked at all.
    pub errors: u64,
}

impl BatchStats {
    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.timed_out + self.errors
    }

    fn record(&mut self, joined: Result<Result<Batch, BatchError>, JoinError>) {
        match joined {
            Ok(Ok(batch)) => match batch.state() {
                BatchState::AllCompleted => self.completed += 1,
                BatchState::PartialFailure => self.failed += 1,
                BatchState::TimedOut => self.timed_out += 1,
                BatchState::Planned | BatchState::Dispatched => {
                    warn!(batch_id = %batch.id, state = %batch.state(), "Batch returned unfinished");
                    self.errors += 1;
                }
            },
            Ok(Err(e)) => {
                error!(error = %e, "Batch failed");
                self.errors += 1;
            }
            Err(e) => {
                if e.is_panic() {
                    error!(error = %e, "Batch task panicked");
                }
                self.errors += 1;
            }
        }
    }
}

/// Runs batches against one target.
pub struct BatchWorker<T: Transport + Clone + 'static> {
    scheduler: Arc<BatchScheduler<T>>,
    target: String,
    interval: Duration,
    continuous: bool,
    max_batches: Option<u64>,
}

impl<T: Transport + Clone + 'static> BatchWorker<T> {
    /// A worker that runs one batch. See [`continuous`](Self::continuous).
    pub fn new(scheduler: Arc<BatchScheduler<T>>, target: impl Into<String>) -> Self {
        let interval = scheduler.config().batch_interval();
        Self {
            scheduler,
            target: target.into(),
            interval,
            continuous: false,
            max_batches: None,
        }
    }

    /// Keep starting batches every interval.
    #[must_use]
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Stop starting batches after `max`.
    #[must_use]
    pub fn with_max_batches(mut self, max: Option<u64>) -> Self {
        self.max_batches = max;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn limit(&self) -> Option<u64> {
        if self.continuous {
            self.max_batches
        } else {
            Some(1)
        }
    }

    /// Runs until shutdown, or until the batch limit is reached and every
    /// batch finished. Batches in flight at shutdown are abandoned; their
    /// processes run out and release their RAM on exit.
    #[instrument(skip_all, fields(target = %self.target))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> BatchStats {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            continuous = self.continuous,
            "Starting batch worker"
        );

        let mut stats = BatchStats::default();
        let mut tasks = JoinSet::new();
        let mut started = 0u64;
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let may_start = self.limit().map_or(true, |limit| started < limit);
            if !may_start && tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = interval.tick(), if may_start => {
                    let scheduler = Arc::clone(&self.scheduler);
                    let target = self.target.clone();
                    tasks.spawn(async move { scheduler.run(&target).await });
                    started += 1;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    stats.record(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(in_flight = tasks.len(), "Batch worker shutting down");
                        break;
                    }
                }
            }
        }

        tasks.shutdown().await;
        info!(
            completed = stats.completed,
            failed = stats.failed,
            timed_out = stats.timed_out,
            errors = stats.errors,
            "Batch worker stopped"
        );
        stats
    }
}
