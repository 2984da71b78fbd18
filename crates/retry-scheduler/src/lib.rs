//! Periodic replay of queued Broadmail calls.
//!
//! [`RetryScheduler::tick`] replays the retry backlog once, oldest first, and
//! hands records that used up their retry budget to the
//! [`EscalationNotifier`]. [`RetryRunner`] drives ticks on a fixed interval.

mod error;
mod escalation;
mod runner;
mod scheduler;

pub use error::{MailError, SchedulerError, SchedulerResult};
pub use escalation::{
    EscalationNotifier, LogMailer, Mailer, OperatorAlert, OperatorContact, SpoolMailer,
    DEFAULT_SENDER,
};
pub use runner::RetryRunner;
pub use scheduler::{RetryScheduler, RetrySchedulerConfig, TickReport};
