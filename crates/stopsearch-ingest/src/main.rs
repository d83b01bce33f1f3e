//! Stop-and-search ingestion - Main entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use stopsearch_common::logging::{init_logging, LogConfig, LogLevel};
use tracing::info;

use stopsearch_ingest::{config::IngestConfig, jobs::JobOrchestrator, sweeper, watermark};

/// Incremental ingestion of UK police stop-and-search data
#[derive(Parser)]
#[command(name = "stopsearch-ingest", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one full ingestion cycle across the configured forces
    Ingest {
        /// Latest month to ingest, as YYYY-MM (defaults to everything available)
        #[arg(long)]
        date: Option<String>,
    },
    /// Re-attempt every quarantined row once
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Environment variables take precedence over the CLI flag
    let mut log_config = LogConfig::from_env()?;
    log_config.log_file_prefix = "stopsearch-ingest".to_string();
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    init_logging(&log_config)?;

    info!("Starting stop-and-search ingestion");

    let config = IngestConfig::load()?;
    info!(forces = config.forces.len(), "Configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await?;

    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    match cli.command {
        Command::Ingest { date } => {
            if let Some(date) = date.as_deref() {
                if !watermark::is_month_key(date) {
                    anyhow::bail!("--date must be formatted YYYY-MM, got {date:?}");
                }
            }

            let report = JobOrchestrator::new(config, pool).run(date.as_deref()).await?;

            info!(
                completed = report.forces_completed,
                exhausted = report.forces_exhausted,
                loaded = report.rows_loaded,
                rejected = report.rejected_rows,
                quarantined = report.rows_quarantined,
                "Ingestion finished"
            );
        }
        Command::Sweep => {
            let remediated = sweeper::sweep(&pool).await?;
            info!(remediated, "Sweep finished");
        }
    }

    Ok(())
}
