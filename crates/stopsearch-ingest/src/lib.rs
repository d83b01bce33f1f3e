//! Stop-and-search ingestion pipeline
//!
//! Incrementally harvests stop-and-search records from the upstream police
//! data API (one force × month partition per request), reconciles them
//! against what is already stored, and bulk-loads the result into Postgres.
//!
//! # Pipeline
//!
//! - [`client`]: rate-limit-aware HTTP client with retry and backoff
//! - [`api`]: the two upstream endpoints (stops per force/month, availability)
//! - [`validator`]: raw JSON -> canonical row, with a single remediation pass
//! - [`fetch`]: per-force incremental fetch with per-month failure isolation
//! - [`loader`]: COPY-based bulk loading with recursive failure bisection
//! - [`jobs`]: fan-out over forces, fan-in into one bulk load per table
//! - [`sweeper`]: re-validates quarantined rows and re-inserts survivors
//!
//! # Example
//!
//! ```no_run
//! use stopsearch_ingest::{config::IngestConfig, jobs::JobOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let pool = sqlx::PgPool::connect(&config.database.url).await?;
//!     let report = JobOrchestrator::new(config, pool).run(None).await?;
//!     println!("loaded {} rows", report.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod fetch;
pub mod jobs;
pub mod loader;
pub mod record;
pub mod sweeper;
pub mod validator;
pub mod watermark;
