use std::fs::OpenOptions;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use fuelsync::config::default_config_path;
use fuelsync::{
    ExportFormat, FuelSync, FuelSyncConfig, MergeOutcome, SyncOptions, SyncReport, SyncState,
    SyncWindow,
};

#[derive(Parser)]
#[command(name = "fuelsync", about = "Incremental EFS fuel-card transaction sync")]
struct Cli {
    /// Config file (default: ~/.fuelsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding storage.database_path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new transactions and merge them into the local dataset
    Sync {
        /// Start from this date (YYYY-MM-DD) instead of the saved high-water mark
        #[arg(long, value_parser = parse_date)]
        since: Option<NaiveDate>,
        /// Stop at this instant (RFC 3339) instead of now
        #[arg(long, value_parser = parse_instant)]
        until: Option<DateTime<Utc>>,
        /// Fetch and count without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show dataset and sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export the merged dataset
    Export {
        /// csv or jsonl
        #[arg(long, default_value = "csv")]
        format: ExportFormat,
        /// Output file (a .gz suffix is added under gzip compression)
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration with the password masked
    Show,
    /// Print the config file path
    Path,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl fuelsync::SyncProgress for StderrProgress {
    fn on_run_start(&self, state: &SyncState, dry_run: bool) {
        let hwm = state
            .high_water_mark
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "none".to_string());
        if dry_run {
            eprintln!("Dry run from high-water mark {hwm}");
        } else {
            eprintln!("Syncing from high-water mark {hwm}");
        }
    }

    fn on_window_start(&self, window: &SyncWindow) {
        eprint!("  Window {window} ... ");
    }

    fn on_window_complete(&self, _window: &SyncWindow, outcome: &MergeOutcome, skipped: u64) {
        if skipped > 0 {
            eprintln!(
                "{} new, {} updated, {} skipped",
                outcome.inserted, outcome.updated, skipped
            );
        } else {
            eprintln!("{} new, {} updated", outcome.inserted, outcome.updated);
        }
    }

    fn on_window_failed(&self, _window: &SyncWindow, error: &fuelsync::Error) {
        eprintln!("failed: {error}");
    }

    fn on_run_complete(&self, _report: &SyncReport) {}
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    parse_date(s).map(fuelsync::date_util::midnight_utc)
}

fn init_logging(config: &FuelSyncConfig, verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Some(path) = &config.logging.file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    if let Commands::Config {
        action: ConfigAction::Path,
    } = &cli.command
    {
        println!("{}", config_path.display());
        return Ok(());
    }

    let mut config = FuelSyncConfig::load_from(&config_path)?;
    if let Some(db) = cli.db {
        config.storage.database_path = db;
    }
    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Sync {
            since,
            until,
            dry_run,
            json,
        } => {
            let app = FuelSync::open(config).await?;
            let options = SyncOptions {
                since,
                until,
                dry_run,
            };
            let report = app.sync(&options, &StderrProgress).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_sync_report(&report);
            }
            if report.is_failed() {
                std::process::exit(1);
            }
        }
        Commands::Status { json } => {
            let app = FuelSync::open(config).await?;
            let status = app.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Export { format, output } => {
            let app = FuelSync::open(config).await?;
            let (path, count) = app.export(format, &output).await?;
            println!("Exported {count} transaction(s) to {}", path.display());
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", config.to_redacted_toml()?),
            ConfigAction::Path => println!("{}", config_path.display()),
        },
    }

    Ok(())
}

fn print_sync_report(report: &SyncReport) {
    println!("Sync{}", if report.dry_run { " (dry run)" } else { "" });
    println!("  Status:    {:?}", report.status);
    println!("  Windows:   {}", report.windows_processed);
    println!("  New:       {}", report.records_merged);
    println!("  Updated:   {}", report.records_updated);
    if report.records_skipped > 0 {
        println!("  Skipped:   {}", report.records_skipped);
    }
    println!(
        "  Synced to: {}",
        report
            .high_water_mark
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    if let Some(window) = &report.failed_window {
        println!("  Stopped:   window {window}");
    }
    if let Some(ref err) = report.error {
        println!("  Error:     {err}");
    }
}

fn print_status(status: &fuelsync::DatasetStatus) {
    println!("Dataset Status");
    println!("  Database:     {}", status.database_path.display());
    println!("  Transactions: {}", status.transaction_count);
    if let (Some(first), Some(last)) = (&status.earliest_transaction, &status.latest_transaction) {
        println!("  Range:        {first} .. {last}");
    }
    println!(
        "  Synced to:    {}",
        status
            .state
            .high_water_mark
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    if let Some(window) = &status.state.in_progress {
        println!("  Interrupted:  window {window} (will be re-fetched)");
    }
    match &status.last_job {
        Some(job) => {
            println!(
                "  Last run:     {} ({}{})",
                job.started_at,
                job.status,
                if job.dry_run { ", dry run" } else { "" }
            );
            if let Some(err) = &job.error_message {
                println!("  Last error:   {err}");
            }
        }
        None => println!("  Last run:     never"),
    }
}
