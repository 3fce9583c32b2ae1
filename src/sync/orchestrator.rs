use chrono::{SubsecRound, Utc};

use crate::client::{SessionClient, TransactionsRequest, Transport};
use crate::config::FuelSyncConfig;
use crate::date_util::{midnight_utc, to_storage_timestamp};
use crate::error::Result;
use crate::soap::transactions::decode_transactions;
use crate::storage::repository;
use crate::storage::Database;
use crate::sync::merger::{self, MergeOutcome};
use crate::sync::planner;
use crate::sync::{SyncOptions, SyncProgress, SyncReport, SyncState, SyncWindow};

/// Run one incremental sync.
///
/// Opens the session, walks the planned windows in order, and closes the
/// session on every exit path. An authentication failure is returned as
/// `Err` before any window is attempted. A failing window stops the run and
/// is reported in the returned [`SyncReport`]; the dataset and high-water
/// mark stay at the last committed window.
pub async fn run<T: Transport>(
    db: &Database,
    client: &mut SessionClient<T>,
    config: &FuelSyncConfig,
    options: &SyncOptions,
    progress: &dyn SyncProgress,
) -> Result<SyncReport> {
    let state = db
        .reader()
        .call(|conn| repository::get_sync_state(conn))
        .await?;
    if let Some(window) = &state.in_progress {
        log::warn!(
            "Previous run was interrupted during window {window}; resuming from the last committed boundary"
        );
    }

    // Millisecond precision, matching what the high-water mark can store.
    let now = options.until.unwrap_or_else(Utc::now).trunc_subsecs(3);
    let first = match options.since {
        Some(date) => planner::window_from(midnight_utc(date), 1, &config.pipeline, now),
        None => planner::next_window(&state, None, &config.pipeline, now),
    };

    let dry_run = options.dry_run;
    let range_start = first.map(|w| to_storage_timestamp(&w.begin));
    let range_end = to_storage_timestamp(&now);
    let job_id = db
        .writer()
        .call(move |conn| {
            repository::insert_sync_job(conn, dry_run, range_start.as_deref(), Some(range_end.as_str()))
        })
        .await?;

    progress.on_run_start(&state, dry_run);
    let mut report = SyncReport::new(dry_run, state.high_water_mark);

    if first.is_none() {
        log::info!("Dataset is up to date; nothing to fetch");
    } else if let Err(e) = client.open().await {
        report.fail(None, &e);
        if let Err(job_err) = finish_job(db, job_id, &report).await {
            log::warn!("Could not record failed sync job {job_id}: {job_err}");
        }
        progress.on_run_complete(&report);
        return Err(e);
    } else {
        process_windows(db, client, config, &state, first, job_id, now, dry_run, &mut report, progress)
            .await;
        if let Err(e) = client.close().await {
            log::warn!("Session close failed after sync: {e}");
        }
    }

    finish_job(db, job_id, &report).await?;
    log::info!(
        "Sync {}: {} window(s), {} inserted, {} updated, {} skipped",
        report.status.as_str(),
        report.windows_processed,
        report.records_merged,
        report.records_updated,
        report.records_skipped
    );
    progress.on_run_complete(&report);
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn process_windows<T: Transport>(
    db: &Database,
    client: &mut SessionClient<T>,
    config: &FuelSyncConfig,
    state: &SyncState,
    first: Option<SyncWindow>,
    job_id: i64,
    now: chrono::DateTime<Utc>,
    dry_run: bool,
    report: &mut SyncReport,
    progress: &dyn SyncProgress,
) {
    let delay = config.pipeline.request_delay();
    let mut next = first;

    while let Some(window) = next {
        progress.on_window_start(&window);
        log::info!("Fetching window {window}");

        match fetch_and_merge(db, client, &window, job_id, dry_run).await {
            Ok((outcome, skipped)) => {
                report.record_window(&outcome, skipped);
                progress.on_window_complete(&window, &outcome, skipped);
            }
            Err(e) => {
                log::error!("Window {window} failed: {e}");
                progress.on_window_failed(&window, &e);
                report.fail(Some(window), &e);
                return;
            }
        }

        next = planner::next_window(state, Some(&window), &config.pipeline, now);
        if next.is_some() && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

async fn fetch_and_merge<T: Transport>(
    db: &Database,
    client: &mut SessionClient<T>,
    window: &SyncWindow,
    job_id: i64,
    dry_run: bool,
) -> Result<(MergeOutcome, u64)> {
    if !dry_run {
        let marker = *window;
        db.writer()
            .call(move |conn| repository::set_in_progress(conn, &marker))
            .await?;
    }

    let request = TransactionsRequest {
        begin: window.begin,
        end: window.end,
    };
    let body = client.execute(&request).await?;
    let batch = decode_transactions(&body)?;
    let skipped = batch.skipped();

    let outcome = merger::merge(db, Some(job_id), window, batch.records, skipped, dry_run).await?;
    Ok((outcome, skipped))
}

async fn finish_job(db: &Database, job_id: i64, report: &SyncReport) -> Result<()> {
    let report = report.clone();
    db.writer()
        .call(move |conn| repository::update_sync_job(conn, job_id, &report))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone};

    use super::*;
    use crate::client::transport::testing::{ok, status, ScriptedTransport};
    use crate::client::TransportResponse;
    use crate::config::test_config;
    use crate::date_util::parse_protocol_timestamp;
    use crate::error::{Error, FailureKind};
    use crate::soap::fixtures::{fault, login_ok, logout_ok};
    use crate::soap::transactions::fixtures::{response, txn};
    use crate::soap::transactions::TransactionRecord;
    use crate::sync::{NoopProgress, SyncStatus};

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn tag<'a>(body: &'a str, name: &str) -> &'a str {
        let open = format!("<{name}>");
        let close = format!("</{name}>");
        body.split(&open)
            .nth(1)
            .and_then(|rest| rest.split(&close).next())
            .unwrap_or("")
    }

    /// One transaction per day at 10:00 UTC, January 1st to 15th 2024.
    fn service_response(body: &str) -> String {
        let begin = parse_protocol_timestamp(tag(body, "begDate")).unwrap();
        let end = parse_protocol_timestamp(tag(body, "endDate")).unwrap();
        let values: Vec<String> = (1..=15)
            .map(|day| Utc.with_ymd_and_hms(2024, 1, day, 10, 0, 0).unwrap())
            .filter(|at| *at >= begin && *at < end)
            .map(|at| {
                let day = i64::from(chrono::Datelike::day(&at));
                txn(day, &at.to_rfc3339(), day as f64 * 10.0)
            })
            .collect();
        response(&values)
    }

    fn healthy(action: &str, body: &str) -> crate::error::Result<TransportResponse> {
        match action {
            "login" => ok(login_ok("tok-1")),
            "logout" => ok(logout_ok()),
            _ => ok(service_response(body)),
        }
    }

    fn client(
        handler: impl Fn(&str, &str) -> crate::error::Result<TransportResponse> + Send + Sync + 'static,
    ) -> SessionClient<ScriptedTransport> {
        let config = test_config("https://example.com/ws");
        SessionClient::new(ScriptedTransport::new(handler), &config).unwrap()
    }

    fn until(s: &str) -> SyncOptions {
        SyncOptions {
            until: Some(ts(s)),
            ..SyncOptions::default()
        }
    }

    async fn dataset(db: &Database) -> Vec<TransactionRecord> {
        db.reader()
            .call(|conn| repository::list_transactions(conn))
            .await
            .unwrap()
    }

    async fn state(db: &Database) -> SyncState {
        db.reader()
            .call(|conn| repository::get_sync_state(conn))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_run_fetches_from_default_start() {
        let db = Database::open_memory().await.unwrap();
        let config = test_config("https://example.com/ws");
        let mut c = client(healthy);

        let report = run(&db, &mut c, &config, &until("2024-01-05T00:00:00Z"), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.windows_processed, 4);
        assert_eq!(report.records_merged, 4);
        assert_eq!(report.high_water_mark, Some(ts("2024-01-05T00:00:00Z")));

        let windows = db
            .reader()
            .call(|conn| repository::list_sync_windows(conn))
            .await
            .unwrap();
        assert_eq!(windows[0].window.begin, ts("2024-01-01T00:00:00Z"));
        assert_eq!(windows[0].window.end, ts("2024-01-02T00:00:00Z"));

        assert!(c.is_closed());
        assert_eq!(c.transport().count("logout"), 1);
        assert_eq!(state(&db).await.in_progress, None);
    }

    #[tokio::test]
    async fn test_resume_applies_lookback_and_is_idempotent() {
        let db = Database::open_memory().await.unwrap();
        let config = test_config("https://example.com/ws");

        let mut first = client(healthy);
        run(&db, &mut first, &config, &until("2024-01-10T00:00:00Z"), &NoopProgress)
            .await
            .unwrap();
        let before = dataset(&db).await;
        assert_eq!(before.len(), 9);

        let mut second = client(healthy);
        let report = run(&db, &mut second, &config, &until("2024-01-11T00:00:00Z"), &NoopProgress)
            .await
            .unwrap();

        let requests = second.transport().calls();
        let first_fetch = requests
            .iter()
            .find(|(action, _)| action == "getMCTransExtLocV2")
            .unwrap();
        assert_eq!(tag(&first_fetch.1, "begDate"), "2024-01-03T00:00:00.000+00:00");

        assert_eq!(report.windows_processed, 8);
        assert_eq!(report.records_merged, 1);
        assert_eq!(report.records_updated, 7);
        assert_eq!(dataset(&db).await.len(), 10);
        assert_eq!(state(&db).await.high_water_mark, Some(ts("2024-01-11T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_auth_failure_halts_before_any_window() {
        let db = Database::open_memory().await.unwrap();
        let config = test_config("https://example.com/ws");
        let mut c = client(|action, body| match action {
            "login" => ok(fault("soapenv:Client", "Invalid credentials")),
            _ => healthy(action, body),
        });

        let err = run(&db, &mut c, &config, &until("2024-01-05T00:00:00Z"), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(c.transport().count("getMCTransExtLocV2"), 0);
        assert_eq!(state(&db).await.high_water_mark, None);

        let job = db
            .reader()
            .call(|conn| repository::last_sync_job(conn))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.failure_kind.as_deref(), Some("authentication"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_failure_stops_and_resume_matches_clean_run() {
        let config = test_config("https://example.com/ws");
        let opts = until("2024-01-06T00:00:00Z");

        let clean_db = Database::open_memory().await.unwrap();
        let mut clean = client(healthy);
        run(&clean_db, &mut clean, &config, &opts, &NoopProgress).await.unwrap();

        let db = Database::open_memory().await.unwrap();
        let mut flaky = client(|action, body| {
            if action == "getMCTransExtLocV2" && tag(body, "begDate").starts_with("2024-01-03") {
                return status(503, "maintenance");
            }
            healthy(action, body)
        });

        let report = run(&db, &mut flaky, &config, &opts, &NoopProgress).await.unwrap();
        assert_eq!(report.status, SyncStatus::Failed);
        assert_eq!(report.windows_processed, 2);
        assert_eq!(report.failure_kind, Some(FailureKind::Transient));
        let failed = report.failed_window.unwrap();
        assert_eq!(failed.sequence, 3);
        assert_eq!(failed.begin, ts("2024-01-03T00:00:00Z"));
        assert!(flaky.is_closed());

        let interrupted = state(&db).await;
        assert_eq!(interrupted.high_water_mark, Some(ts("2024-01-03T00:00:00Z")));
        assert_eq!(interrupted.in_progress.map(|w| w.sequence), Some(3));

        let mut retry = client(healthy);
        let report = run(&db, &mut retry, &config, &opts, &NoopProgress).await.unwrap();
        assert_eq!(report.status, SyncStatus::Success);

        assert_eq!(dataset(&db).await, dataset(&clean_db).await);
        assert_eq!(state(&db).await.high_water_mark, state(&clean_db).await.high_water_mark);
        assert_eq!(state(&db).await.in_progress, None);
    }

    #[tokio::test]
    async fn test_auth_error_survives_job_bookkeeping_failure() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_job_update BEFORE UPDATE ON sync_jobs
                     BEGIN SELECT RAISE(ABORT, 'sync_jobs is read-only'); END;",
                )
            })
            .await
            .unwrap();
        let config = test_config("https://example.com/ws");
        let mut c = client(|action, body| match action {
            "login" => ok(fault("soapenv:Client", "Invalid credentials")),
            _ => healthy(action, body),
        });

        let err = run(&db, &mut c, &config, &until("2024-01-05T00:00:00Z"), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_delay_only_between_windows() {
        let db = Database::open_memory().await.unwrap();
        let mut config = test_config("https://example.com/ws");
        config.pipeline.request_delay_seconds = 5.0;
        let delay = config.pipeline.request_delay();

        let mut c = client(healthy);
        let started = tokio::time::Instant::now();
        let report = run(&db, &mut c, &config, &until("2024-01-04T00:00:00Z"), &NoopProgress)
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(report.windows_processed, 3);
        assert!(elapsed >= delay * 2, "slept {elapsed:?}");
        assert!(elapsed < delay * 3, "slept {elapsed:?}");

        // Nothing to plan: no window, no sleep.
        let mut idle = client(healthy);
        let opts = SyncOptions {
            since: Some(chrono::NaiveDate::from_ymd_opt(2024, 1, 4).unwrap()),
            ..until("2024-01-04T00:00:00Z")
        };
        let started = tokio::time::Instant::now();
        let report = run(&db, &mut idle, &config, &opts, &NoopProgress).await.unwrap();
        assert_eq!(report.windows_processed, 0);
        assert_eq!(started.elapsed(), std::time::Duration::ZERO);
    }

    #[tokio::test]
    async fn test_sub_millisecond_end_matches_committed_mark() {
        let db = Database::open_memory().await.unwrap();
        let config = test_config("https://example.com/ws");
        let mut c = client(healthy);

        let report = run(&db, &mut c, &config, &until("2024-01-01T12:00:00.123456789Z"), &NoopProgress)
            .await
            .unwrap();
        let expected = ts("2024-01-01T12:00:00.123Z");
        assert_eq!(report.high_water_mark, Some(expected));
        assert_eq!(state(&db).await.high_water_mark, Some(expected));

        let windows = db
            .reader()
            .call(|conn| repository::list_sync_windows(conn))
            .await
            .unwrap();
        assert_eq!(windows.last().unwrap().window.end, expected);
    }

    #[tokio::test]
    async fn test_operation_fault_fails_window_without_retry() {
        let db = Database::open_memory().await.unwrap();
        let config = test_config("https://example.com/ws");
        let mut c = client(|action, body| match action {
            "getMCTransExtLocV2" => ok(fault("soapenv:Server", "Date range too large")),
            _ => healthy(action, body),
        });

        let report = run(&db, &mut c, &config, &until("2024-01-05T00:00:00Z"), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(report.failure_kind, Some(FailureKind::OperationFault));
        assert_eq!(report.failed_window.map(|w| w.sequence), Some(1));
        assert_eq!(c.transport().count("getMCTransExtLocV2"), 1);
        assert_eq!(c.transport().count("logout"), 1);
    }

    #[tokio::test]
    async fn test_bad_records_are_skipped_and_counted() {
        let db = Database::open_memory().await.unwrap();
        let config = test_config("https://example.com/ws");
        let mut c = client(|action, body| match action {
            "getMCTransExtLocV2" => ok(response(&[
                txn(1, "2024-01-01T10:00:00Z", 5.0),
                "<value><transactionId>oops</transactionId></value>".to_string(),
            ])),
            _ => healthy(action, body),
        });

        let report = run(&db, &mut c, &config, &until("2024-01-02T00:00:00Z"), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(report.status, SyncStatus::PartialFailure);
        assert_eq!(report.records_merged, 1);
        assert_eq!(report.records_skipped, 1);
        assert_eq!(report.high_water_mark, Some(ts("2024-01-02T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_dry_run_leaves_dataset_and_state_untouched() {
        let db = Database::open_memory().await.unwrap();
        let config = test_config("https://example.com/ws");
        let mut c = client(healthy);
        let opts = SyncOptions {
            dry_run: true,
            ..until("2024-01-04T00:00:00Z")
        };

        let report = run(&db, &mut c, &config, &opts, &NoopProgress).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.records_merged, 3);
        assert!(dataset(&db).await.is_empty());
        assert_eq!(state(&db).await, SyncState::default());
    }

    #[tokio::test]
    async fn test_since_overrides_state_and_up_to_date_run_is_noop() {
        let db = Database::open_memory().await.unwrap();
        let config = test_config("https://example.com/ws");

        let mut c = client(healthy);
        let opts = SyncOptions {
            since: Some(chrono::NaiveDate::from_ymd_opt(2024, 1, 12).unwrap()),
            ..until("2024-01-14T00:00:00Z")
        };
        let report = run(&db, &mut c, &config, &opts, &NoopProgress).await.unwrap();
        assert_eq!(report.windows_processed, 2);
        assert_eq!(dataset(&db).await.len(), 2);

        // Already at the requested end: no login at all.
        let mut idle = client(healthy);
        let opts = SyncOptions {
            since: Some(chrono::NaiveDate::from_ymd_opt(2024, 1, 14).unwrap()),
            ..until("2024-01-14T00:00:00Z")
        };
        let report = run(&db, &mut idle, &config, &opts, &NoopProgress).await.unwrap();
        assert_eq!(report.windows_processed, 0);
        assert!(idle.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn test_leftover_marker_is_cleared_by_next_commit() {
        let db = Database::open_memory().await.unwrap();
        let config = test_config("https://example.com/ws");
        let stale = SyncWindow {
            begin: ts("2024-01-01T00:00:00Z"),
            end: ts("2024-01-01T00:00:00Z") + Duration::days(1),
            sequence: 1,
        };
        db.writer()
            .call(move |conn| repository::set_in_progress(conn, &stale))
            .await
            .unwrap();

        let mut c = client(healthy);
        run(&db, &mut c, &config, &until("2024-01-02T00:00:00Z"), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(state(&db).await.in_progress, None);
    }
}
