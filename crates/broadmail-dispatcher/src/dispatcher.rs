//! Dispatch and replay of Broadmail API calls.

use crate::{
    Clock, DispatchError, DispatchResult, HttpTransport, RequestDescriptor, TransportResponse,
};
use delivery_queue_database::{DeliveryRecord, DeliveryStatus, QueueStore};
use relay_config_and_utils::Config;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Transport settings for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Base URL of the HTTP API, without the endpoint path.
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Upper bound for the whole exchange, body included.
    pub request_timeout: Duration,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.api_base_url.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            user_agent: config.user_agent.clone(),
            accept_invalid_certs: config.accept_invalid_certs,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What the caller of a dispatch sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallOutcome {
    pub success: bool,
    /// Response body on success, diagnostic otherwise.
    pub message: String,
    pub endpoint: String,
}

impl CallOutcome {
    fn delivered(endpoint: &str, body: String) -> Self {
        Self {
            success: true,
            message: body,
            endpoint: endpoint.to_string(),
        }
    }

    fn failed(endpoint: &str, message: String) -> Self {
        Self {
            success: false,
            message,
            endpoint: endpoint.to_string(),
        }
    }
}

/// Diagnostic returned when a call has no credential to send.
pub fn missing_credential_message(method: &str) -> String {
    format!(
        "API not configured, authorization code is missing for method \"{}\".",
        method
    )
}

/// Performs API calls and keeps failed ones in the delivery queue.
pub struct Dispatcher {
    transport: HttpTransport,
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    base_url: Url,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
    ) -> DispatchResult<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| DispatchError::InvalidBaseUrl(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DispatchError::InvalidBaseUrl(config.base_url));
        }
        let transport = HttpTransport::new(&config)?;
        Ok(Self {
            transport,
            store,
            clock,
            base_url,
        })
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Perform a fresh call.
    ///
    /// Without a credential nothing is sent and nothing is queued. A remote
    /// failure creates one delivery record holding the full request, credential
    /// included, so the call can be replayed later.
    pub async fn submit(&self, request: RequestDescriptor) -> DispatchResult<CallOutcome> {
        let Some(url) = request.target_url(&self.base_url) else {
            let message = missing_credential_message(request.method());
            warn!(endpoint = %request.endpoint(), method = %request.method(), "{}", message);
            return Ok(CallOutcome::failed(request.endpoint(), message));
        };

        let response = self.send(&request, &url).await;
        let status = response.delivery_status();

        match response {
            TransportResponse::Completed { body, .. } if status.is_success() => {
                Ok(CallOutcome::delivered(request.endpoint(), body))
            }
            response => {
                let message = response.error_message();
                let record = DeliveryRecord::first_failure(
                    self.clock.now(),
                    status,
                    message.clone(),
                    request.encode()?,
                );
                self.store.create(&record).await?;
                info!(
                    record_id = %record.id(),
                    endpoint = %request.endpoint(),
                    method = %request.method(),
                    status = %status,
                    "Queued failed call for retry"
                );
                Ok(CallOutcome::failed(request.endpoint(), message))
            }
        }
    }

    /// Replay a queued call and persist the updated record.
    ///
    /// The attempt is saved only if the stored record still has the retry
    /// count read by the caller; otherwise the store reports a conflict and
    /// the attempt belongs to whoever saved first.
    ///
    /// Every replay that reaches this point counts as one attempt, including a
    /// replay that cannot be sent for lack of a credential. Records without a
    /// request or with an unreadable one are returned as errors untouched.
    pub async fn retry(&self, record: &mut DeliveryRecord) -> DispatchResult<CallOutcome> {
        let payload = record
            .request()
            .ok_or_else(|| DispatchError::NothingToReplay(record.id().to_string()))?;
        let request = RequestDescriptor::decode(payload).map_err(|e| DispatchError::CorruptRequest {
            id: record.id().to_string(),
            reason: e.to_string(),
        })?;

        let attempted_at = self.clock.now();
        let previous_retry_count = record.retry_count();

        let Some(url) = request.target_url(&self.base_url) else {
            let message = missing_credential_message(request.method());
            warn!(
                record_id = %record.id(),
                endpoint = %request.endpoint(),
                method = %request.method(),
                "{}",
                message
            );
            record.record_unsent_attempt(attempted_at, message.clone());
            self.store.save_attempt(record, previous_retry_count).await?;
            return Ok(CallOutcome::failed(request.endpoint(), message));
        };

        let response = self.send(&request, &url).await;
        let status = response.delivery_status();
        let message = response.error_message();

        record.record_attempt(attempted_at, status, message.clone());
        self.store.save_attempt(record, previous_retry_count).await?;

        debug!(
            record_id = %record.id(),
            retry_count = record.retry_count(),
            status = %status,
            "Replayed queued call"
        );

        match response {
            TransportResponse::Completed { body, .. } if status.is_success() => {
                Ok(CallOutcome::delivered(request.endpoint(), body))
            }
            _ => Ok(CallOutcome::failed(request.endpoint(), message)),
        }
    }

    async fn send(&self, request: &RequestDescriptor, url: &Url) -> TransportResponse {
        let redacted = request.redacted_url(&self.base_url);
        debug!(
            url = %redacted,
            fields = ?request.fields().iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            "Calling Broadmail API"
        );

        let response = self.transport.post_form(url.as_str(), request.fields()).await;

        match (&response, response.delivery_status()) {
            (_, DeliveryStatus::Success) => {}
            (TransportResponse::Failed(failure), _) => {
                warn!(url = %redacted, code = failure.code(), error = %failure.message(), "Broadmail API unreachable");
            }
            (TransportResponse::Completed { status, body }, _) => {
                warn!(url = %redacted, status, "Broadmail API rejected call");
                debug!(url = %redacted, body = %body, "Rejected call response body");
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestClock;
    use chrono::{TimeZone, Utc};
    use delivery_queue_database::{AsyncDatabase, ReplayPayload, SqliteQueueStore};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<SqliteQueueStore>,
        clock: TestClock,
    }

    async fn harness(base_url: &str) -> Harness {
        let store = Arc::new(SqliteQueueStore::new(AsyncDatabase::open_in_memory().await.unwrap()));
        let clock = TestClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let config = DispatcherConfig {
            base_url: base_url.to_string(),
            request_timeout: Duration::from_secs(5),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(config, store.clone(), Arc::new(clock.clone())).unwrap();
        Harness {
            dispatcher,
            store,
            clock,
        }
    }

    fn subscribe(credential: Option<&str>) -> RequestDescriptor {
        RequestDescriptor::new("form", "subscribe")
            .with_credential(credential.map(str::to_string))
            .field("bmRecipientId", "a@b.com")
    }

    async fn mount(server: &MockServer, status: u16, body: &str) {
        Mock::given(method("POST"))
            .and(path("/form/X/subscribe"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_success_returns_body_and_queues_nothing() {
        let server = MockServer::start().await;
        mount(&server, 200, "ok").await;
        let h = harness(&server.uri()).await;

        let outcome = h.dispatcher.submit(subscribe(Some("X"))).await.unwrap();

        assert_eq!(
            outcome,
            CallOutcome {
                success: true,
                message: "ok".to_string(),
                endpoint: "form".to_string()
            }
        );
        assert!(h.store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_credential_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let h = harness(&server.uri()).await;

        let outcome = h.dispatcher.submit(subscribe(None)).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.message.contains("authorization code is missing"));
        assert!(outcome.message.contains("\"subscribe\""));
        assert!(h.store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_creates_record() {
        let server = MockServer::start().await;
        mount(&server, 500, "boom").await;
        let h = harness(&server.uri()).await;

        let outcome = h.dispatcher.submit(subscribe(Some("X"))).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message, "server replied: 500");

        let records = h.store.list_all().await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.retry_count(), 0);
        assert_eq!(record.status(), DeliveryStatus::ServerError);
        assert_eq!(record.error_message(), "server replied: 500");
        assert_eq!(record.created_at(), h.clock.now());

        let stored = RequestDescriptor::decode(record.request().unwrap()).unwrap();
        assert_eq!(stored, subscribe(Some("X")));
    }

    #[tokio::test]
    async fn test_network_error_creates_record_with_errno() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let h = harness(&format!("http://127.0.0.1:{}", port)).await;

        let outcome = h.dispatcher.submit(subscribe(Some("X"))).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.ends_with("(errno=7)"));

        let records = h.store.list_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status(), DeliveryStatus::NetworkError);
        assert_eq!(records[0].error_message(), outcome.message);
    }

    #[tokio::test]
    async fn test_retry_success_clears_request() {
        let server = MockServer::start().await;
        mount(&server, 200, "ok").await;
        let h = harness(&server.uri()).await;

        let mut record = DeliveryRecord::first_failure(
            h.clock.now(),
            DeliveryStatus::ServerError,
            "server replied: 503",
            subscribe(Some("X")).encode().unwrap(),
        );
        h.store.create(&record).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(10));

        let outcome = h.dispatcher.retry(&mut record).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.message, "ok");

        let stored = h.store.get(record.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), DeliveryStatus::Success);
        assert_eq!(stored.retry_count(), 1);
        assert_eq!(stored.last_retry_at(), Some(h.clock.now()));
        assert!(stored.request().is_none());
        assert_eq!(stored.error_message(), "");
        assert_eq!(h.store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_failure_updates_in_place() {
        let server = MockServer::start().await;
        mount(&server, 404, "").await;
        let h = harness(&server.uri()).await;

        let mut record = DeliveryRecord::first_failure(
            h.clock.now(),
            DeliveryStatus::NetworkError,
            "dns error(errno=6)",
            subscribe(Some("X")).encode().unwrap(),
        );
        h.store.create(&record).await.unwrap();

        let outcome = h.dispatcher.retry(&mut record).await.unwrap();
        assert!(!outcome.success);

        let all = h.store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status(), DeliveryStatus::ServerError);
        assert_eq!(all[0].error_message(), "server replied: 404");
        assert_eq!(all[0].retry_count(), 1);
        assert!(all[0].request().is_some());
    }

    #[tokio::test]
    async fn test_retry_without_credential_counts_attempt() {
        let server = MockServer::start().await;
        let h = harness(&server.uri()).await;

        let mut record = DeliveryRecord::first_failure(
            h.clock.now(),
            DeliveryStatus::ServerError,
            "server replied: 500",
            subscribe(None).encode().unwrap(),
        );
        h.store.create(&record).await.unwrap();

        let outcome = h.dispatcher.retry(&mut record).await.unwrap();
        assert!(!outcome.success);

        let stored = h.store.get(record.id()).await.unwrap().unwrap();
        assert_eq!(stored.retry_count(), 1);
        assert_eq!(stored.status(), DeliveryStatus::ServerError);
        assert!(stored.error_message().contains("authorization code is missing"));
        assert!(stored.request().is_some());
    }

    #[tokio::test]
    async fn test_retry_rejects_delivered_and_corrupt_records() {
        let server = MockServer::start().await;
        let h = harness(&server.uri()).await;

        let mut delivered = DeliveryRecord::first_failure(
            h.clock.now(),
            DeliveryStatus::ServerError,
            "server replied: 500",
            subscribe(Some("X")).encode().unwrap(),
        );
        delivered.record_attempt(h.clock.now(), DeliveryStatus::Success, "");
        let err = h.dispatcher.retry(&mut delivered).await.unwrap_err();
        assert!(matches!(err, DispatchError::NothingToReplay(_)));
        assert_eq!(delivered.retry_count(), 1);

        let mut corrupt = DeliveryRecord::first_failure(
            h.clock.now(),
            DeliveryStatus::ServerError,
            "server replied: 500",
            ReplayPayload::new("{broken"),
        );
        let err = h.dispatcher.retry(&mut corrupt).await.unwrap_err();
        assert!(matches!(err, DispatchError::CorruptRequest { .. }));
        assert_eq!(corrupt.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_credential_is_sent_as_one_encoded_segment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form/a%2Fb%3Fc%23d/subscribe"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(&server.uri()).await;

        let outcome = h.dispatcher.submit(subscribe(Some("a/b?c#d"))).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_unusable_base_url_is_rejected() {
        let store = Arc::new(SqliteQueueStore::new(AsyncDatabase::open_in_memory().await.unwrap()));
        for base_url in ["not a url", "mailto:ops@example.com"] {
            let config = DispatcherConfig {
                base_url: base_url.to_string(),
                ..DispatcherConfig::default()
            };
            let result = Dispatcher::new(config, store.clone(), Arc::new(crate::SystemClock));
            assert!(matches!(result, Err(DispatchError::InvalidBaseUrl(_))), "{base_url}");
        }
    }

    #[tokio::test]
    async fn test_stale_replay_is_a_conflict() {
        let server = MockServer::start().await;
        mount(&server, 500, "").await;
        let h = harness(&server.uri()).await;

        let record = DeliveryRecord::first_failure(
            h.clock.now(),
            DeliveryStatus::ServerError,
            "server replied: 500",
            subscribe(Some("X")).encode().unwrap(),
        );
        h.store.create(&record).await.unwrap();

        let mut first = record.clone();
        let mut second = record.clone();
        h.dispatcher.retry(&mut first).await.unwrap();
        let err = h.dispatcher.retry(&mut second).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Store(delivery_queue_database::DatabaseError::Conflict(_))
        ));

        let stored = h.store.get(record.id()).await.unwrap().unwrap();
        assert_eq!(stored.retry_count(), 1);
    }
}
