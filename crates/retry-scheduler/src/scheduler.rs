//! One pass over the retry backlog.

use crate::{EscalationNotifier, SchedulerError, SchedulerResult};
use broadmail_dispatcher::{DispatchError, Dispatcher};
use delivery_queue_database::{DatabaseError, DatabaseResult, DeliveryRecord};
use relay_config_and_utils::Config;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedulerConfig {
    /// Attempts after which a failing record is given up and escalated.
    pub max_retry_count: u32,
}

impl RetrySchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retry_count: config.max_retry_count,
        }
    }
}

/// Counts for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub escalated: usize,
    /// Attempts another scheduler saved first; not counted here.
    pub skipped: usize,
}

impl std::fmt::Display for TickReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "selected={} succeeded={} failed={} escalated={} skipped={}",
            self.selected, self.succeeded, self.failed, self.escalated, self.skipped
        )
    }
}

/// Replays queued calls and escalates the ones that run out of attempts.
///
/// Only one tick runs at a time per scheduler. Schedulers sharing a database
/// may select the same record; the store saves one attempt per retry count and
/// the loser skips the record.
pub struct RetryScheduler {
    dispatcher: Arc<Dispatcher>,
    notifier: EscalationNotifier,
    config: RetrySchedulerConfig,
    running: Mutex<()>,
}

impl RetryScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, notifier: EscalationNotifier, config: RetrySchedulerConfig) -> Self {
        Self {
            dispatcher,
            notifier,
            config,
            running: Mutex::new(()),
        }
    }

    /// Replay every retryable record once, oldest first, one at a time.
    ///
    /// Fails with [`SchedulerError::TickInProgress`] if another tick is running,
    /// and with a store error if the backlog cannot be read. Failures on a
    /// single record are logged and the tick moves on.
    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| SchedulerError::TickInProgress)?;

        let max_retry_count = self.config.max_retry_count;
        let backlog = self.dispatcher.store().select_retryable(max_retry_count).await?;

        let mut report = TickReport {
            selected: backlog.len(),
            ..TickReport::default()
        };
        debug!(selected = report.selected, max_retry_count, "Starting retry tick");

        for mut record in backlog {
            let persisted = match self.dispatcher.retry(&mut record).await {
                Ok(outcome) if outcome.success => {
                    report.succeeded += 1;
                    true
                }
                Ok(_) => {
                    report.failed += 1;
                    true
                }
                Err(DispatchError::Store(DatabaseError::Conflict(reason))) => {
                    report.skipped += 1;
                    debug!(record_id = %record.id(), %reason, "Attempt already recorded by another tick");
                    false
                }
                Err(e @ (DispatchError::NothingToReplay(_) | DispatchError::CorruptRequest { .. })) => {
                    match self.record_unreplayable(&mut record, &e).await {
                        Ok(()) => {
                            report.failed += 1;
                            true
                        }
                        Err(DatabaseError::Conflict(reason)) => {
                            report.skipped += 1;
                            debug!(record_id = %record.id(), %reason, "Attempt already recorded by another tick");
                            false
                        }
                        Err(err) => {
                            report.failed += 1;
                            warn!(record_id = %record.id(), error = %err, "Failed to save retry attempt");
                            false
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(record_id = %record.id(), error = %e, "Retry attempt failed");
                    false
                }
            };

            // Records that could not be saved come back next tick with their
            // old count, so they are only escalated once persisted.
            if persisted && record.is_exhausted(max_retry_count) {
                self.notifier.notify(&record).await;
                report.escalated += 1;
            }
        }

        info!(
            selected = report.selected,
            succeeded = report.succeeded,
            failed = report.failed,
            escalated = report.escalated,
            skipped = report.skipped,
            "Retry tick complete"
        );
        Ok(report)
    }

    /// Count an attempt for a record whose stored request cannot be replayed,
    /// so it still reaches the retry limit.
    async fn record_unreplayable(&self, record: &mut DeliveryRecord, cause: &DispatchError) -> DatabaseResult<()> {
        warn!(record_id = %record.id(), error = %cause, "Queued call cannot be replayed");
        let previous_retry_count = record.retry_count();
        record.record_unsent_attempt(self.dispatcher.clock().now(), cause.to_string());
        self.dispatcher.store().save_attempt(record, previous_retry_count).await
    }
}
