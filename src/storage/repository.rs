use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::date_util::{from_storage_timestamp, to_storage_timestamp};
use crate::soap::transactions::{LineItem, TransactionRecord};
use crate::sync::{SyncReport, SyncState, SyncWindow};

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

// ── Sync State ─────────────────────────────────────────────────────

pub fn get_sync_state(conn: &Connection) -> Result<SyncState, rusqlite::Error> {
    conn.query_row(
        "SELECT high_water_mark, in_progress_begin, in_progress_end, in_progress_sequence, updated_at
         FROM sync_state WHERE id = 1",
        [],
        |row| {
            let begin = timestamp_column(row, 1)?;
            let end = timestamp_column(row, 2)?;
            let sequence: Option<u32> = row.get(3)?;
            let in_progress = match (begin, end, sequence) {
                (Some(begin), Some(end), Some(sequence)) => Some(SyncWindow { begin, end, sequence }),
                _ => None,
            };
            Ok(SyncState {
                high_water_mark: timestamp_column(row, 0)?,
                in_progress,
                updated_at: row.get(4)?,
            })
        },
    )
    .optional()
    .map(Option::unwrap_or_default)
}

/// Record the window about to be fetched, so an interrupted run can be spotted.
pub fn set_in_progress(conn: &Connection, window: &SyncWindow) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO sync_state (id, in_progress_begin, in_progress_end, in_progress_sequence, updated_at)
             VALUES (1, ?1, ?2, ?3, {NOW})
             ON CONFLICT(id) DO UPDATE SET
                in_progress_begin = excluded.in_progress_begin,
                in_progress_end = excluded.in_progress_end,
                in_progress_sequence = excluded.in_progress_sequence,
                updated_at = excluded.updated_at"
        ),
        params![
            to_storage_timestamp(&window.begin),
            to_storage_timestamp(&window.end),
            window.sequence,
        ],
    )?;
    Ok(())
}

pub fn clear_in_progress(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "UPDATE sync_state SET
                in_progress_begin = NULL, in_progress_end = NULL, in_progress_sequence = NULL,
                updated_at = {NOW}
             WHERE id = 1"
        ),
        [],
    )?;
    Ok(())
}

/// Move the high-water mark to `end` unless it is already later.
/// Returns the mark as stored afterwards.
pub fn advance_high_water_mark(
    conn: &Connection,
    end: &DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO sync_state (id, high_water_mark, updated_at) VALUES (1, ?1, {NOW})
             ON CONFLICT(id) DO UPDATE SET
                high_water_mark = CASE
                    WHEN sync_state.high_water_mark IS NULL OR sync_state.high_water_mark < excluded.high_water_mark
                    THEN excluded.high_water_mark
                    ELSE sync_state.high_water_mark
                END,
                updated_at = excluded.updated_at"
        ),
        params![to_storage_timestamp(end)],
    )?;
    conn.query_row(
        "SELECT high_water_mark FROM sync_state WHERE id = 1",
        [],
        |row| timestamp_column(row, 0),
    )
}

// ── Transactions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Insert or overwrite a transaction by its identity key.
pub fn upsert_transaction(
    conn: &Connection,
    record: &TransactionRecord,
) -> Result<UpsertOutcome, rusqlite::Error> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM transactions WHERE record_key = ?1",
            params![record.record_key],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    let line_items = serde_json::to_string(&record.line_items)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    conn.execute(
        "INSERT INTO transactions (
            record_key, transaction_id, transaction_date, transaction_type, card_number,
            invoice, location_id, location_name, location_city, location_state,
            location_address, location_latitude, location_longitude, net_total,
            funded_total, settle_amount, disc_amount, carrier_id, line_items
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
         ON CONFLICT(record_key) DO UPDATE SET
            transaction_id = excluded.transaction_id,
            transaction_date = excluded.transaction_date,
            transaction_type = excluded.transaction_type,
            card_number = excluded.card_number,
            invoice = excluded.invoice,
            location_id = excluded.location_id,
            location_name = excluded.location_name,
            location_city = excluded.location_city,
            location_state = excluded.location_state,
            location_address = excluded.location_address,
            location_latitude = excluded.location_latitude,
            location_longitude = excluded.location_longitude,
            net_total = excluded.net_total,
            funded_total = excluded.funded_total,
            settle_amount = excluded.settle_amount,
            disc_amount = excluded.disc_amount,
            carrier_id = excluded.carrier_id,
            line_items = excluded.line_items",
        params![
            record.record_key,
            record.transaction_id,
            record.transaction_date.as_ref().map(to_storage_timestamp),
            record.transaction_type,
            record.card_number,
            record.invoice,
            record.location_id,
            record.location_name,
            record.location_city,
            record.location_state,
            record.location_address,
            record.location_latitude,
            record.location_longitude,
            record.net_total,
            record.funded_total,
            record.settle_amount,
            record.disc_amount,
            record.carrier_id,
            line_items,
        ],
    )?;

    Ok(if exists {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    })
}

const TRANSACTION_COLUMNS: &str = "record_key, transaction_id, transaction_date, transaction_type, card_number,
    invoice, location_id, location_name, location_city, location_state, location_address,
    location_latitude, location_longitude, net_total, funded_total, settle_amount,
    disc_amount, carrier_id, line_items";

fn transaction_from_row(row: &Row<'_>) -> Result<TransactionRecord, rusqlite::Error> {
    let line_items_json: String = row.get(18)?;
    let line_items: Vec<LineItem> = serde_json::from_str(&line_items_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(18, Type::Text, Box::new(e)))?;
    Ok(TransactionRecord {
        record_key: row.get(0)?,
        transaction_id: row.get(1)?,
        transaction_date: timestamp_column(row, 2)?,
        transaction_type: row.get(3)?,
        card_number: row.get(4)?,
        invoice: row.get(5)?,
        location_id: row.get(6)?,
        location_name: row.get(7)?,
        location_city: row.get(8)?,
        location_state: row.get(9)?,
        location_address: row.get(10)?,
        location_latitude: row.get(11)?,
        location_longitude: row.get(12)?,
        net_total: row.get(13)?,
        funded_total: row.get(14)?,
        settle_amount: row.get(15)?,
        disc_amount: row.get(16)?,
        carrier_id: row.get(17)?,
        line_items,
    })
}

/// All transactions in stable order: by transaction date (undated last), then key.
pub fn list_transactions(conn: &Connection) -> Result<Vec<TransactionRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions
         ORDER BY transaction_date IS NULL, transaction_date, record_key"
    ))?;
    let rows = stmt.query_map([], transaction_from_row)?;
    rows.collect()
}

pub fn get_transaction(
    conn: &Connection,
    record_key: &str,
) -> Result<Option<TransactionRecord>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE record_key = ?1"),
        params![record_key],
        transaction_from_row,
    )
    .optional()
}

pub fn count_transactions(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
}

/// Earliest and latest transaction dates in the dataset.
pub fn transaction_date_range(
    conn: &Connection,
) -> Result<(Option<String>, Option<String>), rusqlite::Error> {
    conn.query_row(
        "SELECT MIN(transaction_date), MAX(transaction_date) FROM transactions",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

// ── Sync Windows ───────────────────────────────────────────────────

pub fn insert_sync_window(
    conn: &Connection,
    job_id: Option<i64>,
    window: &SyncWindow,
    inserted: u64,
    updated: u64,
    skipped: u64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO sync_windows (
                job_id, sequence, window_begin, window_end,
                records_inserted, records_updated, records_skipped, committed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, {NOW})"
        ),
        params![
            job_id,
            window.sequence,
            to_storage_timestamp(&window.begin),
            to_storage_timestamp(&window.end),
            inserted as i64,
            updated as i64,
            skipped as i64,
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct CommittedWindow {
    pub job_id: Option<i64>,
    pub window: SyncWindow,
    pub records_inserted: i64,
    pub records_updated: i64,
    pub records_skipped: i64,
    pub committed_at: String,
}

pub fn list_sync_windows(conn: &Connection) -> Result<Vec<CommittedWindow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT job_id, sequence, window_begin, window_end,
                records_inserted, records_updated, records_skipped, committed_at
         FROM sync_windows ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CommittedWindow {
            job_id: row.get(0)?,
            window: SyncWindow {
                sequence: row.get(1)?,
                begin: required_timestamp(row, 2)?,
                end: required_timestamp(row, 3)?,
            },
            records_inserted: row.get(4)?,
            records_updated: row.get(5)?,
            records_skipped: row.get(6)?,
            committed_at: row.get(7)?,
        })
    })?;
    rows.collect()
}

// ── Sync Jobs ──────────────────────────────────────────────────────

pub fn insert_sync_job(
    conn: &Connection,
    dry_run: bool,
    range_start: Option<&str>,
    range_end: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO sync_jobs (status, dry_run, started_at, range_start, range_end)
             VALUES ('running', ?1, {NOW}, ?2, ?3)"
        ),
        params![dry_run, range_start, range_end],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_sync_job(
    conn: &Connection,
    job_id: i64,
    report: &SyncReport,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "UPDATE sync_jobs SET
                status = ?2, completed_at = {NOW},
                windows_processed = ?3, records_merged = ?4,
                records_updated = ?5, records_skipped = ?6,
                failure_kind = ?7, error_message = ?8
             WHERE id = ?1"
        ),
        params![
            job_id,
            report.status.as_str(),
            report.windows_processed,
            report.records_merged as i64,
            report.records_updated as i64,
            report.records_skipped as i64,
            report.failure_kind.map(|k| k.to_string()),
            report.error,
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: i64,
    pub status: String,
    pub dry_run: bool,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub windows_processed: i64,
    pub records_merged: i64,
    pub records_updated: i64,
    pub records_skipped: i64,
    pub failure_kind: Option<String>,
    pub error_message: Option<String>,
}

pub fn last_sync_job(conn: &Connection) -> Result<Option<SyncJob>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, status, dry_run, started_at, completed_at, windows_processed,
                records_merged, records_updated, records_skipped, failure_kind, error_message
         FROM sync_jobs ORDER BY id DESC LIMIT 1",
        [],
        |row| {
            Ok(SyncJob {
                id: row.get(0)?,
                status: row.get(1)?,
                dry_run: row.get(2)?,
                started_at: row.get(3)?,
                completed_at: row.get(4)?,
                windows_processed: row.get(5)?,
                records_merged: row.get(6)?,
                records_updated: row.get(7)?,
                records_skipped: row.get(8)?,
                failure_kind: row.get(9)?,
                error_message: row.get(10)?,
            })
        },
    )
    .optional()
}

// ── Helpers ────────────────────────────────────────────────────────

fn timestamp_column(row: &Row<'_>, idx: usize) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        from_storage_timestamp(&s).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                format!("invalid timestamp {s:?}").into(),
            )
        })
    })
    .transpose()
}

fn required_timestamp(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    timestamp_column(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        "timestamp".to_string(),
        Type::Null,
    ))
}
