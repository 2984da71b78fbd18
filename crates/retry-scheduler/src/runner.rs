//! Periodic trigger for [`RetryScheduler::tick`].

use crate::{RetryScheduler, SchedulerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runs a tick every `period` until told to stop.
///
/// The first tick fires immediately. A tick that overruns the period delays
/// the next one instead of causing a burst of catch-up ticks.
pub struct RetryRunner {
    scheduler: Arc<RetryScheduler>,
    period: Duration,
}

impl RetryRunner {
    pub fn new(scheduler: Arc<RetryScheduler>, period: Duration) -> Self {
        Self { scheduler, period }
    }

    /// Loop until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// A tick in progress is allowed to finish before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(period_secs = self.period.as_secs(), "Retry runner started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scheduler.tick().await {
                        Ok(report) => debug!(%report, "Scheduled tick finished"),
                        Err(SchedulerError::TickInProgress) => {
                            debug!("Previous tick still running, skipping");
                        }
                        Err(e) => warn!(error = %e, "Scheduled tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Retry runner stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
