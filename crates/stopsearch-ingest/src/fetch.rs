//! Per-force incremental fetch
//!
//! For one force, works out which months are missing (watermark against the
//! availability listing), fetches them all concurrently, and validates every
//! page. Month fetches are independent: one month failing never cancels the
//! others, and failed months are reported back so the caller can schedule a
//! narrower retry.

use crate::api::PoliceApi;
use crate::record::{RejectedRow, StopSearchRecord};
use crate::validator;
use crate::watermark;
use anyhow::{Context, Result};
use futures::future::join_all;
use sqlx::PgPool;
use tracing::{info, warn};

/// Everything one orchestrator run produced.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub valid: Vec<StopSearchRecord>,
    pub rejected: Vec<RejectedRow>,
    /// Months whose fetch failed after the HTTP client's own retries.
    pub failed_months: Vec<String>,
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed_months.is_empty()
    }
}

/// Incremental fetch orchestrator for a single force.
#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    pool: PgPool,
    api: PoliceApi,
}

impl FetchOrchestrator {
    pub fn new(pool: PgPool, api: PoliceApi) -> Self {
        Self { pool, api }
    }

    /// Fetch and validate every missing month for `force`.
    ///
    /// `months` overrides the watermark computation with an explicit retry
    /// set; `available` is the per-force slice of the availability listing
    /// the job fetched once for all forces. `target` is an optional upper
    /// bound month. An empty month selection is an idle success.
    pub async fn run(
        &self,
        force: &str,
        available: &[String],
        months: Option<&[String]>,
        target: Option<&str>,
    ) -> Result<FetchOutcome> {
        let months: Vec<String> = match months {
            Some(explicit) => explicit.to_vec(),
            None => {
                let latest = watermark::latest_month(&self.pool, force)
                    .await
                    .with_context(|| format!("watermark query failed for {force}"))?;

                info!(%force, watermark = ?latest, "computed watermark");
                watermark::months_after_watermark(available, latest.as_deref(), target)
            }
        };

        if months.is_empty() {
            info!(%force, "no new months to fetch");
            return Ok(FetchOutcome::default());
        }

        info!(%force, count = months.len(), months = ?months, "fetching months");

        let fetches = months.iter().map(|month| self.fetch_month(force, month));
        let results = join_all(fetches).await;

        let mut outcome = FetchOutcome::default();

        for (month, result) in months.iter().zip(results) {
            match result {
                Ok((valid, rejected)) => {
                    outcome.valid.extend(valid);
                    outcome.rejected.extend(rejected);
                }
                Err(err) => {
                    warn!(%force, %month, error = %err, "month fetch failed");
                    outcome.failed_months.push(month.clone());
                }
            }
        }

        info!(
            %force,
            valid = outcome.valid.len(),
            rejected = outcome.rejected.len(),
            failed_months = outcome.failed_months.len(),
            "fetch run finished"
        );

        Ok(outcome)
    }

    /// Fetch one month's page and validate it off the async runtime.
    async fn fetch_month(
        &self,
        force: &str,
        month: &str,
    ) -> Result<(Vec<StopSearchRecord>, Vec<RejectedRow>)> {
        let page = self.api.stops_for_month(force, month).await?;

        if page.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        // Canonicalization is CPU-bound; keep it off the reactor so other
        // in-flight month fetches are not starved.
        let force = force.to_string();
        let processed =
            tokio::task::spawn_blocking(move || validator::process_page(&force, page)).await?;

        Ok(processed)
    }
}
