//! Durable delivery queue for the Broadmail relay.
//!
//! This crate provides:
//! - [`DeliveryRecord`]: the persisted unit of undelivered work
//! - [`QueueStore`]: the persistence boundary used by the dispatcher and scheduler
//! - [`SqliteQueueStore`]: the SQLite implementation, backed by [`AsyncDatabase`]
//!
//! The store never interprets the replayable request it keeps for each record;
//! it is carried as an opaque [`ReplayPayload`].
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let store = SqliteQueueStore::new(db);
//! let backlog = store.select_retryable(5).await?;
//! ```

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;
mod store;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::{DeliveryRecord, DeliveryStatus, ReplayPayload, StatusCounts};
pub use store::{QueueStore, SqliteQueueStore};
