//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_delivery_records(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: delivery records and the retry backlog index.
///
/// `request_json` is the empty string once a record has been delivered.
fn migrate_v1_delivery_records(conn: &Connection) -> DatabaseResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "
        CREATE TABLE delivery_records (
            id TEXT PRIMARY KEY NOT NULL,
            created_at TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            last_retry_at TEXT,
            error_status TEXT NOT NULL
                CHECK (error_status IN ('SUCCESS', 'NETWORK_ERROR', 'SERVER_ERROR')),
            error_message TEXT NOT NULL DEFAULT '',
            request_json TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX idx_delivery_records_backlog
            ON delivery_records (error_status, retry_count);
        CREATE INDEX idx_delivery_records_created_at
            ON delivery_records (created_at);
        ",
    )?;
    record_migration(&tx, 1, "delivery_records")?;
    tx.commit()?;
    Ok(())
}
