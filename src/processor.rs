//! Background reindex processor.
//!
//! A long-running cooperative task that drains the reindex queue in
//! batches. Each iteration runs under a wall-clock deadline through a
//! linked cancellation token; expiry counts as `Timeout` and feeds the
//! consecutive-failure backoff (`base × 2^min(n,6)`, capped at five
//! minutes). Healthy iterations poll on a jittered interval. State
//! transitions are published on a watch channel for the health monitor;
//! fatal index corruption parks the processor in `Faulted`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReindexConfig;
use crate::coordinator::IndexCoordinator;
use crate::error::{IndexError, Result};
use crate::model::{IndexUpdateResult, ReindexReason};
use crate::queue::{EntryOutcome, QueueEntry, ReindexQueue};
use crate::store::Clock;

const MAX_BACKOFF: Duration = Duration::from_secs(300);
const MAX_JITTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Starting,
    Running,
    Paused,
    Stopped,
    Faulted,
}

pub struct ReindexProcessor {
    coordinator: Arc<IndexCoordinator>,
    queue: Arc<ReindexQueue>,
    config: ReindexConfig,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<ProcessorState>,
    pause_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl ReindexProcessor {
    pub fn new(
        coordinator: Arc<IndexCoordinator>,
        queue: Arc<ReindexQueue>,
        config: ReindexConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProcessorState::Starting);
        let (pause_tx, _) = watch::channel(false);
        Self {
            coordinator,
            queue,
            config,
            clock,
            state_tx,
            pause_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> watch::Receiver<ProcessorState> {
        self.state_tx.subscribe()
    }

    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until shutdown. Spawn on the runtime:
    /// `tokio::spawn(async move { processor.run().await })`.
    pub async fn run(&self) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval().as_secs(),
            "reindex processor starting"
        );
        self.set_state(ProcessorState::Starting);
        let mut consecutive_failures: u32 = 0;
        self.set_state(ProcessorState::Running);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if *self.pause_tx.borrow() {
                self.set_state(ProcessorState::Paused);
                if !self.wait_for_resume().await {
                    break;
                }
                self.set_state(ProcessorState::Running);
            }

            let iteration_cancel = self.shutdown.child_token();
            let outcome = tokio::time::timeout(
                self.config.iteration_timeout(),
                self.run_iteration(&iteration_cancel),
            )
            .await;

            match outcome {
                Ok(Ok(processed)) => {
                    if processed > 0 {
                        debug!(processed, "reindex iteration finished");
                    }
                    consecutive_failures = 0;
                }
                Ok(Err(err)) if err.is_fatal() => {
                    error!(error = %err, "reindex processor faulted");
                    self.set_state(ProcessorState::Faulted);
                    return;
                }
                Ok(Err(IndexError::Canceled)) => {
                    // Shutdown observed mid-iteration; the loop exits on
                    // the next check without counting a failure.
                }
                Ok(Err(err)) => {
                    consecutive_failures += 1;
                    warn!(error = %err, consecutive_failures, "reindex iteration failed");
                }
                Err(_) => {
                    iteration_cancel.cancel();
                    consecutive_failures += 1;
                    warn!(
                        timeout_secs = self.config.iteration_timeout().as_secs(),
                        consecutive_failures, "reindex iteration timed out"
                    );
                }
            }

            let delay = if consecutive_failures > 0 {
                self.failure_backoff(consecutive_failures)
            } else {
                self.jittered_poll_interval()
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ProcessorState::Stopped);
        info!("reindex processor stopped");
    }

    /// One batch: oldest unprocessed entries, handled serially, outcomes
    /// saved once at the end.
    async fn run_iteration(&self, cancel: &CancellationToken) -> Result<usize> {
        let batch = self.queue.next_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut outcomes: Vec<(i64, EntryOutcome)> = Vec::with_capacity(batch.len());
        for entry in &batch {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.process_entry(entry, cancel).await?;
            outcomes.push((entry.id, outcome));
        }

        let processed = outcomes.len();
        self.queue
            .apply_outcomes(&outcomes, self.clock.utc_now())
            .await?;
        Ok(processed)
    }

    async fn process_entry(
        &self,
        entry: &QueueEntry,
        cancel: &CancellationToken,
    ) -> Result<EntryOutcome> {
        let Ok(file_id) = Uuid::parse_str(&entry.file_id) else {
            warn!(entry = entry.id, file_id = %entry.file_id, "dropping reindex entry with invalid file id");
            return Ok(EntryOutcome::Processed);
        };
        let reason = ReindexReason::parse(&entry.reason).unwrap_or(ReindexReason::ExternalRequest);

        match self.coordinator.reindex(file_id, reason, cancel).await {
            Ok(IndexUpdateResult::Succeeded)
            | Ok(IndexUpdateResult::NoChanges)
            | Ok(IndexUpdateResult::NotFound) => Ok(EntryOutcome::Processed),
            Ok(IndexUpdateResult::Failed(message)) => {
                Ok(self.retry_or_drop(entry, &message))
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(IndexError::Canceled) => Err(IndexError::Canceled),
            Err(err) => Ok(self.retry_or_drop(entry, &err.to_string())),
        }
    }

    fn retry_or_drop(&self, entry: &QueueEntry, message: &str) -> EntryOutcome {
        if entry.retry_count + 1 >= self.config.max_retries_per_entry {
            error!(
                entry = entry.id,
                file_id = %entry.file_id,
                retries = entry.retry_count,
                error = message,
                "reindex entry exhausted its retry budget and was dropped"
            );
            EntryOutcome::Processed
        } else {
            warn!(entry = entry.id, file_id = %entry.file_id, error = message, "reindex entry failed, will retry");
            EntryOutcome::Retry
        }
    }

    /// Waits for resume or shutdown; false means shutdown.
    async fn wait_for_resume(&self) -> bool {
        let mut pause_rx = self.pause_tx.subscribe();
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            if !*pause_rx.borrow() {
                return true;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn failure_backoff(&self, failures: u32) -> Duration {
        failure_backoff(self.config.error_backoff_base(), failures)
    }

    fn jittered_poll_interval(&self) -> Duration {
        let interval = self.config.poll_interval();
        let cap = jitter_cap(interval);
        if cap.is_zero() {
            return interval;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
        interval + Duration::from_millis(jitter_ms)
    }

    fn set_state(&self, state: ProcessorState) {
        let _ = self.state_tx.send(state);
    }
}

/// `base × 2^min(n, 6)`, capped at five minutes.
fn failure_backoff(base: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(6));
    (base * factor).min(MAX_BACKOFF)
}

/// Jitter budget: at most 10% of the interval, never more than 5 seconds.
fn jitter_cap(interval: Duration) -> Duration {
    (interval / 10).min(MAX_JITTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_backoff_doubles_and_caps() {
        let base = Duration::from_secs(30);
        assert_eq!(failure_backoff(base, 1), Duration::from_secs(60));
        assert_eq!(failure_backoff(base, 2), Duration::from_secs(120));
        assert_eq!(failure_backoff(base, 3), Duration::from_secs(240));
        // Capped at five minutes from the fourth consecutive failure on.
        assert_eq!(failure_backoff(base, 4), Duration::from_secs(300));
        assert_eq!(failure_backoff(base, 10), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_a_tenth_of_the_interval() {
        assert_eq!(jitter_cap(Duration::from_secs(15)), Duration::from_millis(1500));
        assert_eq!(jitter_cap(Duration::from_secs(120)), Duration::from_secs(5));
    }
}
