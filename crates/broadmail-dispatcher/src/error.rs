//! Error types for the dispatcher.
//!
//! Remote failures are not errors here: they are classified into a
//! [`CallOutcome`](crate::CallOutcome). These variants cover local faults only.

use delivery_queue_database::DatabaseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Queue store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Invalid API base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Delivery record {0} has no request to replay")]
    NothingToReplay(String),

    #[error("Stored request of delivery record {id} cannot be decoded: {reason}")]
    CorruptRequest { id: String, reason: String },
}

pub type DispatchResult<T> = Result<T, DispatchError>;
