//! Error types for the retry scheduler.

use delivery_queue_database::DatabaseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("A retry tick is already running")]
    TickInProgress,

    #[error("Queue store error: {0}")]
    Store(#[from] DatabaseError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Failure to hand an operator alert to the mail transport.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("Mail spool I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid mail header {name}: line breaks are not allowed")]
    InvalidHeader { name: &'static str },
}
