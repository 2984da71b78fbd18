//! The queue store boundary.

use crate::{queries, AsyncDatabase, DatabaseResult, DeliveryRecord, StatusCounts};
use async_trait::async_trait;
use tracing::debug;

/// Durable storage for delivery records.
///
/// The dispatcher writes records on first failure and after each replay; the
/// scheduler reads the retry backlog. Every write is durable once the call
/// returns.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new record.
    async fn create(&self, record: &DeliveryRecord) -> DatabaseResult<()>;

    /// Overwrite an existing record. Fails with `NotFound` for unknown ids.
    async fn update(&self, record: &DeliveryRecord) -> DatabaseResult<()>;

    /// Persist a replay attempt made on a record read at `previous_retry_count`.
    ///
    /// Fails with `Conflict` when another writer recorded an attempt first, so
    /// two ticks racing on one record count it once.
    async fn save_attempt(&self, record: &DeliveryRecord, previous_retry_count: u32) -> DatabaseResult<()>;

    /// Records not yet delivered with `retry_count < max_retry_count`, oldest first.
    async fn select_retryable(&self, max_retry_count: u32) -> DatabaseResult<Vec<DeliveryRecord>>;

    async fn get(&self, id: &str) -> DatabaseResult<Option<DeliveryRecord>>;

    async fn list_all(&self) -> DatabaseResult<Vec<DeliveryRecord>>;

    async fn count_by_status(&self) -> DatabaseResult<StatusCounts>;
}

/// [`QueueStore`] backed by SQLite.
#[derive(Clone)]
pub struct SqliteQueueStore {
    db: AsyncDatabase,
}

impl SqliteQueueStore {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    pub fn path(&self) -> &str {
        self.db.path()
    }

    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.db.health_check().await
    }

    /// Close the underlying connection. Calls through any clone fail afterwards.
    pub async fn close(&self) -> DatabaseResult<()> {
        self.db.clone().close().await
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn create(&self, record: &DeliveryRecord) -> DatabaseResult<()> {
        let record = record.clone();
        debug!(id = %record.id(), status = %record.status(), "Queueing delivery record");
        self.db
            .call(move |conn| queries::insert_record(conn, &record))
            .await
    }

    async fn update(&self, record: &DeliveryRecord) -> DatabaseResult<()> {
        let record = record.clone();
        debug!(
            id = %record.id(),
            status = %record.status(),
            retry_count = record.retry_count(),
            "Updating delivery record"
        );
        self.db
            .call(move |conn| queries::update_record(conn, &record))
            .await
    }

    async fn save_attempt(&self, record: &DeliveryRecord, previous_retry_count: u32) -> DatabaseResult<()> {
        let record = record.clone();
        debug!(
            id = %record.id(),
            status = %record.status(),
            retry_count = record.retry_count(),
            "Saving replay attempt"
        );
        self.db
            .call(move |conn| queries::save_attempt(conn, &record, previous_retry_count))
            .await
    }

    async fn select_retryable(&self, max_retry_count: u32) -> DatabaseResult<Vec<DeliveryRecord>> {
        self.db
            .call(move |conn| queries::select_retryable(conn, max_retry_count))
            .await
    }

    async fn get(&self, id: &str) -> DatabaseResult<Option<DeliveryRecord>> {
        let id = id.to_string();
        self.db.call(move |conn| queries::get_record(conn, &id)).await
    }

    async fn list_all(&self) -> DatabaseResult<Vec<DeliveryRecord>> {
        self.db.call(queries::list_records).await
    }

    async fn count_by_status(&self) -> DatabaseResult<StatusCounts> {
        self.db.call(queries::count_by_status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DatabaseError, DeliveryStatus, ReplayPayload};
    use chrono::Utc;
    use tempfile::tempdir;

    fn failure(message: &str) -> DeliveryRecord {
        DeliveryRecord::first_failure(
            Utc::now(),
            DeliveryStatus::ServerError,
            message,
            ReplayPayload::new(r#"{"method":"updateFields"}"#),
        )
    }

    #[tokio::test]
    async fn test_records_survive_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.sqlite");

        let record = failure("server replied: 503");
        {
            let store = SqliteQueueStore::new(AsyncDatabase::open(&path).await.unwrap());
            store.create(&record).await.unwrap();
        }

        let store = SqliteQueueStore::new(AsyncDatabase::open(&path).await.unwrap());
        let backlog = store.select_retryable(5).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id(), record.id());
        assert_eq!(backlog[0].error_message(), "server replied: 503");
    }

    #[tokio::test]
    async fn test_update_moves_record_out_of_backlog() {
        let store = SqliteQueueStore::new(AsyncDatabase::open_in_memory().await.unwrap());
        let mut record = failure("server replied: 500");
        store.create(&record).await.unwrap();

        record.record_attempt(Utc::now(), DeliveryStatus::Success, "");
        store.update(&record).await.unwrap();

        assert!(store.select_retryable(5).await.unwrap().is_empty());
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status(), DeliveryStatus::Success);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.success, 1);
    }

    #[tokio::test]
    async fn test_get_by_id() {
        let store = SqliteQueueStore::new(AsyncDatabase::open_in_memory().await.unwrap());
        let record = failure("server replied: 404");
        store.create(&record).await.unwrap();

        let loaded = store.get(record.id()).await.unwrap().unwrap();
        assert_eq!(loaded.error_message(), "server replied: 404");
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_racing_attempts_across_handles_count_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.sqlite");
        let a = SqliteQueueStore::new(AsyncDatabase::open(&path).await.unwrap());
        let b = SqliteQueueStore::new(AsyncDatabase::open(&path).await.unwrap());

        let record = failure("server replied: 500");
        a.create(&record).await.unwrap();

        let mut seen_by_a = a.select_retryable(3).await.unwrap().remove(0);
        let mut seen_by_b = b.select_retryable(3).await.unwrap().remove(0);
        seen_by_a.record_attempt(Utc::now(), DeliveryStatus::ServerError, "server replied: 500");
        seen_by_b.record_attempt(Utc::now(), DeliveryStatus::ServerError, "server replied: 500");

        a.save_attempt(&seen_by_a, 0).await.unwrap();
        let err = b.save_attempt(&seen_by_b, 0).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
        assert_eq!(b.get(record.id()).await.unwrap().unwrap().retry_count(), 1);
    }

    #[tokio::test]
    async fn test_health_check_and_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.sqlite");
        let store = SqliteQueueStore::new(AsyncDatabase::open(&path).await.unwrap());
        assert!(store.path().ends_with("queue.sqlite"));
        store.health_check().await.unwrap();

        store.close().await.unwrap();
        assert!(store.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let store = SqliteQueueStore::new(AsyncDatabase::open_in_memory().await.unwrap());
        let record = failure("server replied: 500");
        store.create(&record).await.unwrap();
        assert!(store.create(&record).await.is_err());
    }
}
