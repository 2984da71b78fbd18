//! Delivery queue model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of the most recent attempt of a queued call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// The remote endpoint answered with HTTP 200.
    Success,
    /// The call failed below the HTTP layer (DNS, connect, timeout).
    NetworkError,
    /// The remote endpoint answered with anything other than HTTP 200.
    ServerError,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ServerError => "SERVER_ERROR",
        }
    }

    /// Parse a persisted status. Unknown values are rejected rather than
    /// defaulted, since a wrong default could hide or resurrect a record.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(Self::Success),
            "NETWORK_ERROR" => Some(Self::NetworkError),
            "SERVER_ERROR" => Some(Self::ServerError),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized request descriptor kept so a failed call can be replayed.
///
/// The queue stores and returns it verbatim. Only the dispatcher knows how to
/// encode and decode it.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplayPayload(String);

impl ReplayPayload {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// The payload carries the API credential, so it never shows up in Debug output.
impl std::fmt::Debug for ReplayPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReplayPayload({} bytes)", self.0.len())
    }
}

/// A call that failed at least once, kept for replay and as an audit trail.
///
/// Records are never deleted. A record leaves the retry backlog either by
/// reaching [`DeliveryStatus::Success`], which clears its request, or by
/// exhausting the retry budget.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    id: String,
    created_at: DateTime<Utc>,
    retry_count: u32,
    last_retry_at: Option<DateTime<Utc>>,
    status: DeliveryStatus,
    error_message: String,
    #[serde(skip)]
    request: Option<ReplayPayload>,
}

impl DeliveryRecord {
    /// Create the record for the first failure of a fresh call.
    pub fn first_failure(
        created_at: DateTime<Utc>,
        status: DeliveryStatus,
        error_message: impl Into<String>,
        request: ReplayPayload,
    ) -> Self {
        debug_assert!(!status.is_success(), "a successful call never creates a record");
        Self {
            id: Uuid::new_v4().to_string(),
            created_at,
            retry_count: 0,
            last_retry_at: None,
            status,
            error_message: error_message.into(),
            request: Some(request),
        }
    }

    /// Rebuild a record from its persisted columns.
    pub(crate) fn from_parts(
        id: String,
        created_at: DateTime<Utc>,
        retry_count: u32,
        last_retry_at: Option<DateTime<Utc>>,
        status: DeliveryStatus,
        error_message: String,
        request: Option<ReplayPayload>,
    ) -> Self {
        Self {
            id,
            created_at,
            retry_count,
            last_retry_at,
            status,
            error_message,
            request,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_retry_at(&self) -> Option<DateTime<Utc>> {
        self.last_retry_at
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn request(&self) -> Option<&ReplayPayload> {
        self.request.as_ref()
    }

    /// Record the outcome of one replay.
    ///
    /// Bumps the retry count by one whatever the outcome. On success the
    /// request is cleared and the error message emptied.
    pub fn record_attempt(
        &mut self,
        at: DateTime<Utc>,
        status: DeliveryStatus,
        error_message: impl Into<String>,
    ) {
        self.last_retry_at = Some(at);
        self.retry_count = self.retry_count.saturating_add(1);
        self.status = status;
        if status.is_success() {
            self.error_message.clear();
            self.request = None;
        } else {
            self.error_message = error_message.into();
        }
    }

    /// Record a replay that never reached the network.
    ///
    /// The attempt still counts against the retry budget; status and request
    /// are left as they were.
    pub fn record_unsent_attempt(&mut self, at: DateTime<Utc>, error_message: impl Into<String>) {
        self.last_retry_at = Some(at);
        self.retry_count = self.retry_count.saturating_add(1);
        self.error_message = error_message.into();
    }

    /// Still failing and under the retry budget.
    pub fn is_retryable(&self, max_retry_count: u32) -> bool {
        !self.status.is_success() && self.retry_count < max_retry_count
    }

    /// Still failing with the retry budget used up.
    pub fn is_exhausted(&self, max_retry_count: u32) -> bool {
        !self.status.is_success() && self.retry_count >= max_retry_count
    }
}

/// Number of records per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub success: u64,
    pub network_error: u64,
    pub server_error: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.success + self.network_error + self.server_error
    }

    pub(crate) fn add(&mut self, status: DeliveryStatus, count: u64) {
        match status {
            DeliveryStatus::Success => self.success += count,
            DeliveryStatus::NetworkError => self.network_error += count,
            DeliveryStatus::ServerError => self.server_error += count,
        }
    }
}
