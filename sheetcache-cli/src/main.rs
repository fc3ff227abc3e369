//! SheetCache CLI: warm, serve, and inspect spreadsheet snapshot caches.
//!
//! Commands:
//! - `warm` — refresh every configured source whose snapshot is missing or expired (cron entry point)
//! - `show` — serve one source through the stale-while-revalidate read path and print it as JSON
//! - `status` — report snapshot age, record count, and lock state per source
//! - `parse` — run the ingestion pipeline over a local CSV file

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use serde_json::json;
use sheetcache_core::data::ingest::parse_table;
use sheetcache_core::source::client_for_url;
use sheetcache_core::{
    CacheConfig, Freshness, RefreshCoordinator, RefreshSettings, ServeOrigin, SourceStatus,
    WarmAction, WarmReport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "sheetcache",
    about = "SheetCache CLI: stale-while-revalidate cache for spreadsheet exports"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "sheetcache.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh sources whose snapshot is missing or expired.
    Warm {
        /// Only this source. Defaults to every configured source.
        #[arg(long)]
        source: Option<String>,

        /// Refresh even if the snapshot is still fresh.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Print a source's records as JSON, refreshing in the background if stale.
    Show {
        /// Source name from the config file.
        #[arg(long)]
        source: String,

        /// Exit without waiting for a background refresh to finish.
        #[arg(long, default_value_t = false)]
        no_wait: bool,
    },
    /// Report snapshot and lock state for every configured source.
    Status {
        /// Emit JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Parse a local CSV export and print the cleaned records as JSON.
    Parse {
        /// CSV file to parse.
        file: PathBuf,

        /// First-column value of the header row.
        #[arg(long)]
        sentinel: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Warm { source, force } => run_warm(&cli.config, source.as_deref(), force),
        Commands::Show { source, no_wait } => run_show(&cli.config, &source, no_wait),
        Commands::Status { json } => run_status(&cli.config, json),
        Commands::Parse { file, sentinel } => run_parse(&file, &sentinel),
    }
}

fn load_config(path: &Path) -> Result<CacheConfig> {
    let config = CacheConfig::load(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    if config.sources.is_empty() {
        bail!("no [[sources]] configured in {}", path.display());
    }
    Ok(config)
}

fn coordinator(settings: RefreshSettings) -> Result<RefreshCoordinator> {
    let client = client_for_url(&settings.url)?;
    Ok(RefreshCoordinator::new(settings, Arc::from(client)))
}

fn run_warm(config_path: &Path, only: Option<&str>, force: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let targets: Vec<RefreshSettings> = match only {
        Some(name) => vec![config.settings_for(name)?],
        None => config.all_settings(),
    };
    let names: Vec<String> = targets.iter().map(|s| s.name.clone()).collect();

    println!(
        "Cache warmer started at {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    let reports: Vec<Result<WarmReport>> = targets
        .into_par_iter()
        .map(|settings| -> Result<WarmReport> { Ok(coordinator(settings)?.warm(force)) })
        .collect();

    let mut failed = 0;
    for (name, report) in names.iter().zip(reports) {
        match report {
            Ok(report) => {
                print_warm_report(&report);
                if report.is_failure() {
                    failed += 1;
                }
            }
            Err(e) => {
                eprintln!("  FAIL: {name}: {e:#}");
                failed += 1;
            }
        }
    }

    println!(
        "Cache warmer completed at {}: {}/{} sources ok",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        names.len() - failed,
        names.len()
    );

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_warm_report(report: &WarmReport) {
    match &report.action {
        WarmAction::AlreadyFresh { age_secs } => {
            println!("  FRESH: {} ({age_secs}s old, no update needed)", report.source)
        }
        WarmAction::Refreshed(outcome) if outcome.is_failure() => {
            eprintln!("  FAIL: {}: {outcome}", report.source)
        }
        WarmAction::Refreshed(outcome) => println!("  OK: {}: {outcome}", report.source),
    }
}

fn run_show(config_path: &Path, source: &str, no_wait: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let coord = coordinator(config.settings_for(source)?)?;

    let served = coord
        .read()
        .with_context(|| format!("no cached data for '{source}' and the first fetch failed"))?;

    let origin = match served.origin {
        ServeOrigin::Fresh => "fresh",
        ServeOrigin::Stale => "stale",
        ServeOrigin::ColdStart => "cold_start",
    };
    let body = json!({
        "source": source,
        "origin": origin,
        "timestamp": served.snapshot.timestamp,
        "total_records": served.snapshot.records.len(),
        "records": served.snapshot.records,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);

    // The answer is already out; let the refresh finish before the process exits.
    if let Some(handle) = served.background {
        if !no_wait {
            match handle.join() {
                Ok(outcome) if outcome.is_failure() => {
                    warn!(source, %outcome, "background refresh did not update the cache")
                }
                Ok(_) => {}
                Err(_) => warn!(source, "background refresh panicked"),
            }
        }
    }
    Ok(())
}

fn run_status(config_path: &Path, as_json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let statuses: Vec<SourceStatus> = config
        .all_settings()
        .into_iter()
        .map(|settings| coordinator(settings).map(|c| c.status()))
        .collect::<Result<_>>()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    println!("Cache directory: {}", config.cache_dir.display());
    println!(
        "{:<20} {:<8} {:>10} {:>8} {:<20} Lock",
        "Source", "State", "Age", "Records", "Updated"
    );
    for status in &statuses {
        let (state, age) = match status.freshness {
            Freshness::Absent => ("absent", "-".to_string()),
            Freshness::Fresh { age_secs } => ("fresh", format!("{age_secs}s")),
            Freshness::Expired { age_secs } => ("expired", format!("{age_secs}s")),
        };
        let updated = status
            .timestamp
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let records = status
            .record_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        let lock = status
            .lock
            .as_ref()
            .map(|l| format!("held by {} until {}", l.owner_id, l.expires_at))
            .unwrap_or_else(|| "free".to_string());
        println!(
            "{:<20} {:<8} {:>10} {:>8} {:<20} {lock}",
            status.name, state, age, records, updated
        );
    }
    Ok(())
}

fn run_parse(file: &Path, sentinel: &str) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let table = parse_table(&bytes, sentinel)?;

    let body = json!({
        "header": table.header,
        "header_row": table.header_row,
        "skipped_rows": table.skipped_rows,
        "total_records": table.records.len(),
        "records": table.records,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
