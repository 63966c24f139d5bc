//! # Autotown CLI (`autotown`)
//!
//! Drives the telemetry rollup pipeline against a local SQLite database:
//! accept usage submissions, start paginator jobs over stored kinds, drain
//! the work queues, and inspect the aggregates.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `autotown init` | Create the SQLite database and run schema migrations |
//! | `autotown ingest <file>` | Queue a usage submission for storage and rollup |
//! | `autotown map --kind <K> [--next <path>]` | Start a paginator job over a kind |
//! | `autotown work` | Drain the pipeline queues |
//! | `autotown summary` | Print usage rollups |
//! | `autotown recent` | Print the recent-usage window |
//! | `autotown stats` | Print entity and queue counts |
//!
//! ## Examples
//!
//! ```bash
//! autotown init --config ./config/autotown.toml
//! autotown ingest report.json --ip 1.2.3.4 --country US
//! autotown work
//!
//! # Count every controller not yet reflected in the daily counts
//! autotown map --kind FoundController --next /batch/countUsage
//! autotown work
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autotown::app::App;
use autotown::config;
use autotown::ingest::{self, Origin};
use autotown::migrate;
use autotown::stats;
use autotown::worker::{self, WorkerOptions};
use autotown_core::paginate::{self, MapRequest, Trigger};
use autotown_core::{recent, summary};

/// Autotown: batch rollup of vehicle telemetry submissions.
#[derive(Parser)]
#[command(name = "autotown", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/autotown.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Accept a usage submission from a JSON file.
    Ingest {
        file: PathBuf,

        /// Origin address of the submission.
        #[arg(long, default_value = "")]
        ip: String,

        #[arg(long, default_value = "")]
        country: String,

        #[arg(long, default_value = "")]
        region: String,

        #[arg(long, default_value = "")]
        city: String,

        /// Origin coordinates as `lat,lon`.
        #[arg(long)]
        latlong: Option<String>,
    },

    /// Start a paginator job over every entity of a kind.
    Map {
        #[arg(long, default_value = "")]
        kind: String,

        /// Processing path for each chunk of keys, e.g. `/batch/countUsage`.
        #[arg(long)]
        next: Option<String>,

        /// Submitted on behalf of a scheduler.
        #[arg(long)]
        cron: bool,
    },

    /// Process queued tasks until the queues are empty.
    Work {
        /// Stop after this many task deliveries.
        #[arg(long)]
        max_tasks: Option<usize>,
    },

    /// Print usage rollups by OS, board, country and version.
    Summary,

    /// Print the recent-usage window.
    Recent {
        /// Only entries after this RFC 3339 time.
        #[arg(long)]
        since: Option<String>,
    },

    /// Show entity counts and queue backlog.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            ip,
            country,
            region,
            city,
            latlong,
        } => {
            let app = App::open(&cfg).await?;
            let origin = Origin {
                ip,
                country,
                region,
                city,
                latlong,
            };
            let envelope = ingest::ingest_file(&app.services, &file, &origin).await?;
            println!("Accepted usage submission at {}.", envelope.timestamp.to_rfc3339());
            app.close().await;
        }
        Commands::Map { kind, next, cron } => {
            let app = App::open(&cfg).await?;
            let trigger = if cron { Trigger::Cron } else { Trigger::Interactive };
            let ack = paginate::submit_map(&app.services, MapRequest::new(kind, next), trigger).await?;
            if !ack.message().is_empty() {
                println!("{}", ack.message());
            }
            app.close().await;
        }
        Commands::Work { max_tasks } => {
            let app = App::open(&cfg).await?;
            let options = WorkerOptions::from_config(&cfg.worker, max_tasks);
            let report = worker::run_worker(&app.services, &options).await?;
            println!("Worker finished:");
            println!("  delivered:  {}", report.delivered);
            println!("  succeeded:  {}", report.succeeded);
            println!("  deferred:   {}", report.deferred);
            println!("  retried:    {}", report.retried);
            println!("  rejected:   {}", report.rejected);
            println!("  dropped:    {}", report.dropped);
            app.close().await;
        }
        Commands::Summary => {
            let app = App::open(&cfg).await?;
            let summary = summary::usage_summary(&app.services).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            app.close().await;
        }
        Commands::Recent { since } => {
            let since = since
                .map(|s| {
                    chrono::DateTime::parse_from_rfc3339(&s)
                        .map(|t| t.with_timezone(&chrono::Utc))
                        .with_context(|| format!("Invalid --since time: {s}"))
                })
                .transpose()?;
            let app = App::open(&cfg).await?;
            let entries = recent::read(app.services.cache.as_ref(), since).await;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            app.close().await;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
