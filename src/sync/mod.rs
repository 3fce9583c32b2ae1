pub mod merger;
pub mod orchestrator;
pub mod planner;
pub mod rate_limit;

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::{Error, FailureKind};

pub use merger::MergeOutcome;

/// Options controlling a sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Start from this date instead of the persisted high-water mark.
    pub since: Option<NaiveDate>,
    /// Stop at this instant instead of the current time.
    pub until: Option<DateTime<Utc>>,
    /// Fetch and count, but leave the dataset and sync state untouched.
    pub dry_run: bool,
}

/// A half-open `[begin, end)` range of transaction time, fetched as one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// 1-based position within its run.
    pub sequence: u32,
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [{}, {})",
            self.sequence,
            self.begin.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Persisted progress of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
    /// End of the last committed window. Never moves backwards.
    pub high_water_mark: Option<DateTime<Utc>>,
    /// Window that was being fetched when the last run stopped, if it never committed.
    pub in_progress: Option<SyncWindow>,
    pub updated_at: Option<String>,
}

/// Report returned after a sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub dry_run: bool,
    pub windows_processed: u32,
    pub records_merged: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub high_water_mark: Option<DateTime<Utc>>,
    pub failed_window: Option<SyncWindow>,
    pub failure_kind: Option<FailureKind>,
    pub error: Option<String>,
}

impl SyncReport {
    pub fn new(dry_run: bool, high_water_mark: Option<DateTime<Utc>>) -> Self {
        Self {
            status: SyncStatus::Success,
            dry_run,
            windows_processed: 0,
            records_merged: 0,
            records_updated: 0,
            records_skipped: 0,
            high_water_mark,
            failed_window: None,
            failure_kind: None,
            error: None,
        }
    }

    /// Fold one committed window into the totals.
    pub fn record_window(&mut self, outcome: &MergeOutcome, skipped: u64) {
        self.windows_processed += 1;
        self.records_merged += outcome.inserted;
        self.records_updated += outcome.updated;
        self.records_skipped += skipped;
        self.high_water_mark = outcome.high_water_mark;
        if skipped > 0 && self.status == SyncStatus::Success {
            self.status = SyncStatus::PartialFailure;
        }
    }

    /// Mark the run as stopped at `window`.
    pub fn fail(&mut self, window: Option<SyncWindow>, error: &Error) {
        self.status = SyncStatus::Failed;
        self.failed_window = window;
        self.failure_kind = Some(error.kind());
        self.error = Some(error.to_string());
    }

    pub fn is_failed(&self) -> bool {
        self.status == SyncStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    /// Every window committed, but some records could not be decoded.
    PartialFailure,
    Failed,
}

impl SyncStatus {
    /// Label stored in `sync_jobs.status`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "completed",
            SyncStatus::PartialFailure => "partial",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Receives progress callbacks during a sync run.
pub trait SyncProgress: Send + Sync {
    fn on_run_start(&self, state: &SyncState, dry_run: bool);
    fn on_window_start(&self, window: &SyncWindow);
    fn on_window_complete(&self, window: &SyncWindow, outcome: &MergeOutcome, skipped: u64);
    fn on_window_failed(&self, window: &SyncWindow, error: &Error);
    fn on_run_complete(&self, report: &SyncReport);
}

/// A no-op progress reporter.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {
    fn on_run_start(&self, _state: &SyncState, _dry_run: bool) {}
    fn on_window_start(&self, _window: &SyncWindow) {}
    fn on_window_complete(&self, _window: &SyncWindow, _outcome: &MergeOutcome, _skipped: u64) {}
    fn on_window_failed(&self, _window: &SyncWindow, _error: &Error) {}
    fn on_run_complete(&self, _report: &SyncReport) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> SyncWindow {
        SyncWindow {
            begin: "2024-01-01T00:00:00Z".parse().unwrap(),
            end: "2024-01-02T00:00:00Z".parse().unwrap(),
            sequence: 1,
        }
    }

    #[test]
    fn test_report_status_transitions() {
        let mut report = SyncReport::new(false, None);
        let outcome = MergeOutcome {
            inserted: 3,
            updated: 1,
            high_water_mark: Some(window().end),
        };
        report.record_window(&outcome, 0);
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.high_water_mark, Some(window().end));

        report.record_window(&outcome, 2);
        assert_eq!(report.status, SyncStatus::PartialFailure);
        assert_eq!(report.records_merged, 6);
        assert_eq!(report.records_skipped, 2);

        report.fail(Some(window()), &Error::Decode("no Body".into()));
        assert!(report.is_failed());
        assert_eq!(report.failure_kind, Some(FailureKind::Decode));
        assert_eq!(report.windows_processed, 2);
    }

    #[test]
    fn test_window_display() {
        assert_eq!(
            window().to_string(),
            "#1 [2024-01-01T00:00:00Z, 2024-01-02T00:00:00Z)"
        );
    }
}
