pub mod client;
pub mod config;
pub mod date_util;
pub mod error;
pub mod export;
pub mod soap;
pub mod storage;
pub mod sync;

use std::path::{Path, PathBuf};

use serde::Serialize;

pub use client::{HttpTransport, SessionClient, Transport};
pub use config::FuelSyncConfig;
pub use error::{Error, FailureKind, Result};
pub use export::ExportFormat;
pub use soap::transactions::{LineItem, TransactionRecord};
pub use storage::Database;
pub use sync::{
    MergeOutcome, NoopProgress, SyncOptions, SyncProgress, SyncReport, SyncState, SyncStatus,
    SyncWindow,
};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::SyncJob;

use storage::repository;
use sync::orchestrator;

/// Main entry point: a configured dataset plus the means to sync it.
pub struct FuelSync {
    db: Database,
    config: FuelSyncConfig,
}

/// Snapshot of the local dataset for `fuelsync status`.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    pub database_path: PathBuf,
    pub transaction_count: i64,
    pub earliest_transaction: Option<String>,
    pub latest_transaction: Option<String>,
    pub state: SyncState,
    pub last_job: Option<SyncJob>,
}

impl FuelSync {
    pub fn new(db: Database, config: FuelSyncConfig) -> Self {
        Self { db, config }
    }

    /// Open the database named by `storage.database_path`.
    pub async fn open(config: FuelSyncConfig) -> Result<Self> {
        let db = Database::open_at(&config.storage.database_path).await?;
        Ok(Self::new(db, config))
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &FuelSyncConfig {
        &self.config
    }

    // ── Sync ───────────────────────────────────────────────────────

    /// Sync against the live service over HTTP.
    pub async fn sync(&self, options: &SyncOptions, progress: &dyn SyncProgress) -> Result<SyncReport> {
        let mut client = SessionClient::from_config(&self.config)?;
        self.sync_with(&mut client, options, progress).await
    }

    /// Sync through a caller-supplied session client.
    pub async fn sync_with<T: Transport>(
        &self,
        client: &mut SessionClient<T>,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<SyncReport> {
        orchestrator::run(&self.db, client, &self.config, options, progress).await
    }

    // ── Dataset ────────────────────────────────────────────────────

    pub async fn status(&self) -> Result<DatasetStatus> {
        let (transaction_count, (earliest, latest), state, last_job) = self
            .db
            .reader()
            .call(|conn| {
                Ok::<_, rusqlite::Error>((
                    repository::count_transactions(conn)?,
                    repository::transaction_date_range(conn)?,
                    repository::get_sync_state(conn)?,
                    repository::last_sync_job(conn)?,
                ))
            })
            .await?;
        Ok(DatasetStatus {
            database_path: self.config.storage.database_path.clone(),
            transaction_count,
            earliest_transaction: earliest,
            latest_transaction: latest,
            state,
            last_job,
        })
    }

    /// All merged transactions, ordered by transaction date then key.
    pub async fn transactions(&self) -> Result<Vec<TransactionRecord>> {
        let records = self
            .db
            .reader()
            .call(|conn| repository::list_transactions(conn))
            .await?;
        Ok(records)
    }

    /// Export the dataset using `storage.compression`. Returns the written
    /// path and the number of records.
    pub async fn export(&self, format: ExportFormat, path: &Path) -> Result<(PathBuf, usize)> {
        let records = self.transactions().await?;
        let written = export::export_to_file(&records, format, self.config.storage.compression, path)?;
        Ok((written, records.len()))
    }
}
