//! Outbound calls to the Broadmail HTTP API.
//!
//! The [`Dispatcher`] performs one call, classifies the outcome as
//! `SUCCESS`, `NETWORK_ERROR` or `SERVER_ERROR`, and queues failed fresh calls
//! for replay. [`BroadmailApi`] adds the typed form calls on top.
//!
//! ```ignore
//! let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::from_config(&config), store, clock)?);
//! let api = BroadmailApi::new(dispatcher, config.credential().map(str::to_string));
//! let outcome = api.subscribe("a@b.com", vec![]).await?;
//! ```

mod api;
mod client;
mod clock;
mod dispatcher;
mod error;
mod request;

pub use api::{BroadmailApi, FORM_ENDPOINT, OVERWRITE_FIELD, RECIPIENT_ID_FIELD};
pub use client::{errno, HttpTransport, TransportFailure, TransportResponse};
pub use clock::{Clock, SystemClock, TestClock};
pub use dispatcher::{missing_credential_message, CallOutcome, Dispatcher, DispatcherConfig};
pub use error::{DispatchError, DispatchResult};
pub use request::RequestDescriptor;
