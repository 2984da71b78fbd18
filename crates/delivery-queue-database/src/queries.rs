//! SQL for the `delivery_records` table.
//!
//! Free functions over a borrowed connection, run inside
//! [`AsyncDatabase::call`](crate::AsyncDatabase::call).

use crate::{DatabaseError, DatabaseResult, DeliveryRecord, DeliveryStatus, ReplayPayload, StatusCounts};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const RECORD_COLUMNS: &str =
    "id, created_at, retry_count, last_retry_at, error_status, error_message, request_json";

/// Insert a new record.
pub fn insert_record(conn: &Connection, record: &DeliveryRecord) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO delivery_records (id, created_at, retry_count, last_retry_at, error_status, error_message, request_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.id(),
            format_datetime(record.created_at()),
            record.retry_count(),
            record.last_retry_at().map(format_datetime),
            record.status().as_str(),
            record.error_message(),
            request_column(record),
        ],
    )?;
    Ok(())
}

/// Overwrite the mutable fields of an existing record.
pub fn update_record(conn: &Connection, record: &DeliveryRecord) -> DatabaseResult<()> {
    let changed = conn.execute(
        "UPDATE delivery_records
         SET retry_count = ?2, last_retry_at = ?3, error_status = ?4, error_message = ?5, request_json = ?6
         WHERE id = ?1",
        params![
            record.id(),
            record.retry_count(),
            record.last_retry_at().map(format_datetime),
            record.status().as_str(),
            record.error_message(),
            request_column(record),
        ],
    )?;

    if changed == 0 {
        return Err(DatabaseError::NotFound(format!(
            "delivery record {}",
            record.id()
        )));
    }
    Ok(())
}

/// Persist a replay attempt only if nobody else recorded one since the record
/// was read.
///
/// `previous_retry_count` is the count the caller saw before the attempt. If
/// the stored count moved on, another writer already claimed this attempt and
/// the call fails with `Conflict`; an unknown id is still `NotFound`.
pub fn save_attempt(
    conn: &Connection,
    record: &DeliveryRecord,
    previous_retry_count: u32,
) -> DatabaseResult<()> {
    let changed = conn.execute(
        "UPDATE delivery_records
         SET retry_count = ?2, last_retry_at = ?3, error_status = ?4, error_message = ?5, request_json = ?6
         WHERE id = ?1 AND retry_count = ?7",
        params![
            record.id(),
            record.retry_count(),
            record.last_retry_at().map(format_datetime),
            record.status().as_str(),
            record.error_message(),
            request_column(record),
            previous_retry_count,
        ],
    )?;

    if changed == 0 {
        let exists = conn
            .query_row(
                "SELECT 1 FROM delivery_records WHERE id = ?1",
                [record.id()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        return Err(if exists {
            DatabaseError::Conflict(format!(
                "delivery record {} no longer at retry count {}",
                record.id(),
                previous_retry_count
            ))
        } else {
            DatabaseError::NotFound(format!("delivery record {}", record.id()))
        });
    }
    Ok(())
}

/// Records still failing with fewer than `max_retry_count` attempts, oldest first.
pub fn select_retryable(conn: &Connection, max_retry_count: u32) -> DatabaseResult<Vec<DeliveryRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RECORD_COLUMNS} FROM delivery_records
         WHERE error_status != ?1 AND retry_count < ?2
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt
        .query_map(params![DeliveryStatus::Success.as_str(), max_retry_count], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Get a record by id.
pub fn get_record(conn: &Connection, id: &str) -> DatabaseResult<Option<DeliveryRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RECORD_COLUMNS} FROM delivery_records WHERE id = ?1"
    ))?;
    Ok(stmt.query_row([id], row_to_record).optional()?)
}

/// Every record in insertion order.
pub fn list_records(conn: &Connection) -> DatabaseResult<Vec<DeliveryRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RECORD_COLUMNS} FROM delivery_records ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt
        .query_map([], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Number of records per status.
pub fn count_by_status(conn: &Connection) -> DatabaseResult<StatusCounts> {
    let mut stmt = conn.prepare_cached(
        "SELECT error_status, COUNT(*) FROM delivery_records GROUP BY error_status",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        let status = DeliveryStatus::parse(&status)
            .ok_or_else(|| DatabaseError::InvalidData(format!("unknown delivery status {status:?}")))?;
        counts.add(status, count.max(0) as u64);
    }
    Ok(counts)
}

fn request_column(record: &DeliveryRecord) -> &str {
    record.request().map(ReplayPayload::as_str).unwrap_or("")
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DeliveryRecord> {
    let status_text: String = row.get(4)?;
    let status = DeliveryStatus::parse(&status_text).ok_or_else(|| {
        conversion_error(4, format!("unknown delivery status {status_text:?}"))
    })?;

    let request: String = row.get(6)?;
    let request = (!request.is_empty()).then(|| ReplayPayload::new(request));

    let last_retry_at = row
        .get::<_, Option<String>>(3)?
        .map(|s| parse_datetime(3, &s))
        .transpose()?;

    Ok(DeliveryRecord::from_parts(
        row.get(0)?,
        parse_datetime(1, &row.get::<_, String>(1)?)?,
        row.get(2)?,
        last_retry_at,
        status,
        row.get(5)?,
        request,
    ))
}

/// Timestamps are stored as RFC 3339 UTC with microseconds so text order
/// matches chronological order.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(column: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, format!("invalid timestamp {s:?}: {e}")))
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(DatabaseError::InvalidData(message)),
    )
}
