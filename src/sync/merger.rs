use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::soap::transactions::TransactionRecord;
use crate::storage::repository::{self, UpsertOutcome};
use crate::storage::Database;
use crate::sync::SyncWindow;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
    /// High-water mark after the merge (projected, for a dry run).
    pub high_water_mark: Option<DateTime<Utc>>,
}

/// Collapse repeated keys within one batch, keeping the last delivery of each
/// key at the position where the key first appeared.
pub fn dedup_last_wins(records: Vec<TransactionRecord>) -> Vec<TransactionRecord> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<TransactionRecord> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(&record.record_key) {
            Some(&idx) => out[idx] = record,
            None => {
                positions.insert(record.record_key.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Merge one window's records into the dataset.
///
/// Upserts, the high-water mark advance, clearing the in-progress marker and
/// the `sync_windows` audit row share a single transaction: either all of
/// them land or none do. A dry run performs the same work and rolls it back.
pub async fn merge(
    db: &Database,
    job_id: Option<i64>,
    window: &SyncWindow,
    records: Vec<TransactionRecord>,
    skipped: u64,
    dry_run: bool,
) -> Result<MergeOutcome> {
    let window = *window;
    let records = dedup_last_wins(records);

    let outcome = db
        .writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let mut outcome = MergeOutcome::default();
            for record in &records {
                match repository::upsert_transaction(&tx, record)? {
                    UpsertOutcome::Inserted => outcome.inserted += 1,
                    UpsertOutcome::Updated => outcome.updated += 1,
                }
            }
            outcome.high_water_mark = repository::advance_high_water_mark(&tx, &window.end)?;
            repository::clear_in_progress(&tx)?;
            repository::insert_sync_window(
                &tx,
                job_id,
                &window,
                outcome.inserted,
                outcome.updated,
                skipped,
            )?;
            if dry_run {
                tx.rollback()?;
            } else {
                tx.commit()?;
            }
            Ok::<MergeOutcome, rusqlite::Error>(outcome)
        })
        .await?;

    log::debug!(
        "{} window {window}: {} inserted, {} updated, {} skipped",
        if dry_run { "Dry-run merged" } else { "Merged" },
        outcome.inserted,
        outcome.updated,
        skipped
    );
    Ok(outcome)
}
