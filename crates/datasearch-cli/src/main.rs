//! `datasearch` operator CLI.
//!
//! Read-side inspection (stats, analytics, history) and operator actions
//! (queue, reactivate, reap) against a datasearch database. Output is JSON
//! on stdout; logs go to stderr.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use datasearch::config::{load_config, load_config_from_str};
use datasearch::db::{analytics_repo, dataset_repo, enrichment_log_repo};
use datasearch::enrichment::{self, EnrichmentStatus};
use datasearch::{init_logging, Config, Database};

const MINIMAL_CONFIG: &str = r#"{ "version": "1.0" }"#;

#[derive(Parser)]
#[command(name = "datasearch")]
#[command(version, about = "Dataset catalog enrichment operator tool", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "DATASEARCH_CONFIG")]
    config: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and, if a config path is given, a starter config
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Record counts per enrichment status for a source
    Stats {
        #[arg(long)]
        source: String,
    },

    /// Attempt counts and mean durations per stage and result
    StageStats {
        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Most frequent error types
    TopErrors {
        #[arg(long, default_value = "24")]
        hours: i64,

        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Recent failed stage attempts
    Failed {
        #[arg(long, default_value = "24")]
        hours: i64,

        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Enrichment history of one dataset, newest first
    Logs {
        dataset_id: String,

        #[arg(long, default_value = "100")]
        limit: u32,
    },

    /// Queue every never-enriched dataset of a source
    Queue {
        #[arg(long)]
        source: String,
    },

    /// Reset a dataset to pending with a fresh attempt budget
    Reactivate { dataset_id: String },

    /// Release claims older than the configured stale timeout
    Reap,

    /// Rebuild the full-text search projection
    RebuildSearch,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitReport {
    database_path: PathBuf,
    config_written: Option<PathBuf>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueReport {
    source: String,
    queued: usize,
    pending: u64,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) if path.exists() => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        Some(path) if !matches!(cli.command, Commands::Init { .. }) => {
            bail!("Config file {} does not exist", path.display())
        }
        _ => load_config_from_str(MINIMAL_CONFIG)?,
    };

    init_logging(&config.logging)?;

    match cli.command {
        Commands::Init { force } => {
            print_json(&init(&config, cli.config.as_deref(), force)?, cli.pretty)
        }
        command => {
            let db = open_database(&config)?;
            execute(command, &config, &db, cli.pretty)
        }
    }
}

fn execute(command: Commands, config: &Config, db: &Database, pretty: bool) -> Result<()> {
    let now = Utc::now();

    match command {
        Commands::Init { .. } => bail!("init does not run against an open database"),
        Commands::Stats { source } => {
            print_json(&dataset_repo::stats_by_source(db, &source)?, pretty)
        }
        Commands::StageStats { hours } => print_json(
            &analytics_repo::stats_by_stage_and_result(db, since(now, hours)?)?,
            pretty,
        ),
        Commands::TopErrors { hours, limit } => print_json(
            &analytics_repo::top_errors(db, since(now, hours)?, limit)?,
            pretty,
        ),
        Commands::Failed { hours, limit } => print_json(
            &analytics_repo::failed_logs(db, since(now, hours)?, limit)?,
            pretty,
        ),
        Commands::Logs { dataset_id, limit } => {
            if dataset_repo::find_by_id(db, &dataset_id)?.is_none() {
                bail!("Dataset {} not found", dataset_id);
            }
            print_json(
                &enrichment_log_repo::find_by_dataset(db, &dataset_id, limit)?,
                pretty,
            )
        }
        Commands::Queue { source } => {
            let queued = enrichment::queue_source(db, &source, now)?;
            let pending = dataset_repo::count_by_status(db, &source, EnrichmentStatus::Pending)?;
            print_json(
                &QueueReport {
                    source,
                    queued,
                    pending,
                },
                pretty,
            )
        }
        Commands::Reactivate { dataset_id } => {
            print_json(&enrichment::reactivate(db, &dataset_id, now)?, pretty)
        }
        Commands::Reap => {
            let report = enrichment::requeue_stale(
                db,
                &config.stage_plan()?,
                &config.enrichment.retry_policy(),
                config.enrichment.stale_after(),
                now,
            )?;
            print_json(&report, pretty)
        }
        Commands::RebuildSearch => {
            dataset_repo::rebuild_search_projection(db)?;
            print_json(&serde_json::json!({ "rebuilt": true }), pretty)
        }
    }
}

fn init(config: &Config, config_path: Option<&Path>, force: bool) -> Result<InitReport> {
    let mut config_written = None;
    if let Some(path) = config_path {
        if path.exists() && !force {
            tracing::info!("Keeping existing config at {}", path.display());
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let content = serde_json::to_string_pretty(config)?;
            fs::write(path, content + "\n")
                .with_context(|| format!("Failed to write config to {}", path.display()))?;
            tracing::info!("Wrote config to {}", path.display());
            config_written = Some(path.to_path_buf());
        }
    }

    let database_path = config.resolved_database_path()?;
    open_database(config)?;

    Ok(InitReport {
        database_path,
        config_written,
    })
}

fn open_database(config: &Config) -> Result<Database> {
    let path = config.resolved_database_path()?;
    Database::open_with_timeout(&path, config.enrichment.busy_timeout())
        .with_context(|| format!("Failed to open database at {}", path.display()))
}

fn since(now: DateTime<Utc>, hours: i64) -> Result<DateTime<Utc>> {
    if hours <= 0 {
        bail!("--hours must be positive, got {}", hours);
    }
    Duration::try_hours(hours)
        .and_then(|window| now.checked_sub_signed(window))
        .context("--hours is out of range")
}

fn print_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", out);
    Ok(())
}
