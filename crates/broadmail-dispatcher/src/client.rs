//! HTTP transport for form posts to the Broadmail API.
//!
//! Transport failures carry a numeric code in the libcurl numbering, so error
//! messages read the same as the existing audit trail, e.g.
//! `tcp connect error: Connection refused (os error 111)(errno=7)`.

use crate::{DispatchResult, DispatcherConfig};
use delivery_queue_database::DeliveryStatus;
use tracing::debug;

/// Numeric codes attached to transport failures.
pub mod errno {
    pub const COULDNT_RESOLVE_HOST: u32 = 6;
    pub const COULDNT_CONNECT: u32 = 7;
    pub const OPERATION_TIMEDOUT: u32 = 28;
    pub const SEND_ERROR: u32 = 55;
    pub const RECV_ERROR: u32 = 56;
}

/// The only HTTP status treated as delivered.
const SUCCESS_STATUS: u16 = 200;

/// A failure below the HTTP response layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    code: u32,
    message: String,
}

impl TransportFailure {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Classify an error returned while sending the request.
    fn from_send_error(err: reqwest::Error) -> Self {
        // Drop the URL first: it contains the credential.
        let err = err.without_url();
        let message = error_chain(&err);
        let code = if err.is_timeout() {
            errno::OPERATION_TIMEDOUT
        } else if err.is_connect() {
            if message.contains("dns error") {
                errno::COULDNT_RESOLVE_HOST
            } else {
                errno::COULDNT_CONNECT
            }
        } else if err.is_body() || err.is_decode() {
            errno::RECV_ERROR
        } else {
            errno::SEND_ERROR
        };
        Self { code, message }
    }

    /// Classify an error returned while reading the response body.
    fn from_receive_error(err: reqwest::Error) -> Self {
        let err = err.without_url();
        let code = if err.is_timeout() {
            errno::OPERATION_TIMEDOUT
        } else {
            errno::RECV_ERROR
        };
        Self {
            code,
            message: error_chain(&err),
        }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(errno={})", self.message, self.code)
    }
}

/// Raw result of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResponse {
    /// The server answered. `body` is empty when it could not be read on a
    /// non-200 answer.
    Completed { status: u16, body: String },
    Failed(TransportFailure),
}

impl TransportResponse {
    /// Classify: transport failure first, then anything but 200.
    pub fn delivery_status(&self) -> DeliveryStatus {
        match self {
            Self::Failed(_) => DeliveryStatus::NetworkError,
            Self::Completed { status, .. } if *status == SUCCESS_STATUS => DeliveryStatus::Success,
            Self::Completed { .. } => DeliveryStatus::ServerError,
        }
    }

    /// Message stored on the delivery record; empty on success.
    pub fn error_message(&self) -> String {
        match self {
            Self::Failed(failure) => failure.to_string(),
            Self::Completed { status, .. } if *status == SUCCESS_STATUS => String::new(),
            Self::Completed { status, .. } => format!("server replied: {}", status),
        }
    }
}

/// Thin wrapper over a configured [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &DispatcherConfig) -> DispatchResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self { client })
    }

    /// POST `fields` form-encoded to `url`.
    pub async fn post_form(&self, url: &str, fields: &[(String, String)]) -> TransportResponse {
        let response = match self.client.post(url).form(fields).send().await {
            Ok(response) => response,
            Err(e) => return TransportResponse::Failed(TransportFailure::from_send_error(e)),
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => {
                debug!(status, body_len = body.len(), "Received response");
                TransportResponse::Completed { status, body }
            }
            Err(e) if status == SUCCESS_STATUS => {
                TransportResponse::Failed(TransportFailure::from_receive_error(e))
            }
            Err(e) => {
                debug!(status, error = %e.without_url(), "Failed to read error response body");
                TransportResponse::Completed {
                    status,
                    body: String::new(),
                }
            }
        }
    }
}

/// Render an error and its sources on one line.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
