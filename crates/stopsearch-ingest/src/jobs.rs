//! Fan-out/fan-in job orchestration
//!
//! One scheduled run dispatches an independent fetch unit per configured
//! force (fan-out), waits for every unit to reach a terminal state, and then
//! bulk-loads the merged output once per target table (fan-in). A unit that
//! exhausts its retry budget yields whatever it accumulated instead of
//! failing the run, so one broken force never blocks ingestion of the rest.

use crate::api::PoliceApi;
use crate::client::HttpRetryClient;
use crate::config::IngestConfig;
use crate::fetch::FetchOrchestrator;
use crate::loader::{BulkLoader, LoadError, LoadSummary, TargetTable};
use crate::record::{RejectedRow, StopSearchRecord};
use anyhow::Result;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Retry ceiling per fetch unit, including the first attempt.
const FETCH_UNIT_ATTEMPTS: u32 = 5;

/// Retry ceiling for each fan-in bulk load, including the first attempt.
const LOAD_ATTEMPTS: u32 = 3;

/// What one scheduled run did.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Forces whose fetch unit finished with nothing left to retry.
    pub forces_completed: usize,
    /// Forces whose fetch unit exhausted its retry budget.
    pub forces_exhausted: usize,
    /// Valid rows produced across all forces.
    pub valid_rows: usize,
    /// Rejected rows produced across all forces.
    pub rejected_rows: usize,
    /// Rows committed to the canonical table.
    pub rows_loaded: usize,
    /// Rows quarantined by the loader on top of validation rejects.
    pub rows_quarantined: usize,
}

/// Accumulated output of one fetch unit across its attempts.
#[derive(Debug, Default)]
struct ForceOutcome {
    valid: Vec<StopSearchRecord>,
    rejected: Vec<RejectedRow>,
    complete: bool,
}

/// Top-level scheduled unit: fan-out over forces, fan-in into the loader.
pub struct JobOrchestrator {
    config: IngestConfig,
    pool: PgPool,
    api: PoliceApi,
}

impl JobOrchestrator {
    pub fn new(config: IngestConfig, pool: PgPool) -> Self {
        let api = PoliceApi::new(HttpRetryClient::default(), config.api_base_url.clone());
        Self { config, pool, api }
    }

    /// Run one full ingestion cycle.
    ///
    /// `target_month` optionally caps how far forward to backfill.
    pub async fn run(&self, target_month: Option<&str>) -> Result<IngestReport> {
        info!(
            forces = self.config.forces.len(),
            target = ?target_month,
            "starting ingestion run"
        );

        // One availability call shared by every force; a failure here
        // degrades to "nothing available" rather than aborting the run.
        let availability = match self.api.availability().await {
            Ok(availability) => availability,
            Err(err) => {
                warn!(error = %err, "availability fetch failed, treating as no partitions");
                Default::default()
            }
        };

        // Fan-out: one independently-retried unit per force.
        let mut handles = Vec::with_capacity(self.config.forces.len());
        for force in &self.config.forces {
            let unit = FetchUnit {
                orchestrator: FetchOrchestrator::new(self.pool.clone(), self.api.clone()),
                force: force.clone(),
                available: availability.get(force).cloned().unwrap_or_default(),
                target: target_month.map(str::to_string),
            };
            handles.push((force.clone(), tokio::spawn(unit.run())));
        }

        // Fan-in: wait for every unit's terminal state, then merge. The merge
        // is commutative, so unit completion order does not matter.
        let mut report = IngestReport::default();
        let mut all_valid: Vec<StopSearchRecord> = Vec::new();
        let mut all_rejected: Vec<RejectedRow> = Vec::new();

        for (force, handle) in handles {
            match handle.await {
                Ok(outcome) => {
                    if outcome.complete {
                        report.forces_completed += 1;
                    } else {
                        report.forces_exhausted += 1;
                    }
                    all_valid.extend(outcome.valid);
                    all_rejected.extend(outcome.rejected);
                }
                Err(join_err) => {
                    error!(%force, error = %join_err, "fetch unit crashed");
                    report.forces_exhausted += 1;
                }
            }
        }

        report.valid_rows = all_valid.len();
        report.rejected_rows = all_rejected.len();

        let loader = BulkLoader::new(self.pool.clone());

        // The merged buffers stay in memory across attempts, and each load
        // opens a fresh transaction, so retrying after a storage hiccup
        // re-submits the identical row set rather than losing the run.
        let valid_lines = all_valid
            .iter()
            .map(StopSearchRecord::to_csv_line)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let summary = load_with_retry(TargetTable::StopSearches, || {
            loader.load(TargetTable::StopSearches, valid_lines.clone())
        })
        .await?;
        report.rows_loaded = summary.loaded();
        report.rows_quarantined = summary.quarantined;

        let rejected_lines = all_rejected
            .iter()
            .map(RejectedRow::to_csv_line)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        load_with_retry(TargetTable::RejectedRows, || {
            loader.load(TargetTable::RejectedRows, rejected_lines.clone())
        })
        .await?;

        info!(
            completed = report.forces_completed,
            exhausted = report.forces_exhausted,
            loaded = report.rows_loaded,
            rejected = report.rejected_rows,
            quarantined = report.rows_quarantined,
            "ingestion run finished"
        );

        Ok(report)
    }
}

/// One force's independently-retried fetch unit.
struct FetchUnit {
    orchestrator: FetchOrchestrator,
    force: String,
    available: Vec<String>,
    target: Option<String>,
}

impl FetchUnit {
    /// Run to a terminal state: complete, or retry budget exhausted.
    ///
    /// Partition-level failures narrow the month list for the next attempt,
    /// and output accumulates across attempts rather than being overwritten.
    async fn run(self) -> ForceOutcome {
        let mut acc = ForceOutcome::default();
        let mut retry_months: Option<Vec<String>> = None;

        for attempt in 0..FETCH_UNIT_ATTEMPTS {
            if attempt > 0 {
                let delay = unit_backoff(attempt - 1);
                warn!(
                    force = %self.force,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying fetch unit"
                );
                tokio::time::sleep(delay).await;
            }

            match self
                .orchestrator
                .run(
                    &self.force,
                    &self.available,
                    retry_months.as_deref(),
                    self.target.as_deref(),
                )
                .await
            {
                Ok(outcome) => {
                    let complete = outcome.is_complete();
                    acc.valid.extend(outcome.valid);
                    acc.rejected.extend(outcome.rejected);

                    if complete {
                        acc.complete = true;
                        return acc;
                    }

                    // Only the failed months need another pass; what already
                    // succeeded stays in the accumulator.
                    retry_months = Some(outcome.failed_months);
                }
                Err(err) => {
                    warn!(force = %self.force, error = %err, "fetch unit attempt failed");
                }
            }
        }

        error!(
            force = %self.force,
            valid = acc.valid.len(),
            "fetch unit exhausted its retry budget"
        );
        acc
    }
}

/// Backoff between fetch unit attempts: exponential plus a uniform offset in
/// `[0.5, 5)` seconds so units for different forces spread out.
fn unit_backoff(attempt: u32) -> Duration {
    Duration::from_secs_f64(2f64.powi(attempt as i32) + 0.5 + fastrand::f64() * 4.5)
}

/// Retry a fan-in bulk load a bounded number of times.
///
/// A transient storage failure (pool exhausted, connection dropped) must not
/// discard a whole run's fetched output; the merged rows are re-submitted
/// unchanged on each attempt.
async fn load_with_retry<F, Fut>(table: TargetTable, mut load: F) -> Result<LoadSummary, LoadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<LoadSummary, LoadError>>,
{
    let mut failures = 0u32;

    loop {
        match load().await {
            Ok(summary) => return Ok(summary),
            Err(err) => {
                failures += 1;
                if failures >= LOAD_ATTEMPTS {
                    return Err(err);
                }

                let delay = unit_backoff(failures - 1);
                warn!(
                    table = table.name(),
                    error = %err,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "bulk load failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn unit_backoff_grows_and_stays_jittered() {
        for attempt in 0..4 {
            let delay = unit_backoff(attempt);
            let base = 2f64.powi(attempt as i32);
            assert!(delay >= Duration::from_secs_f64(base + 0.5));
            assert!(delay < Duration::from_secs_f64(base + 5.0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_load_failure_is_retried_with_the_same_rows() {
        let calls = Arc::new(AtomicUsize::new(0));

        let summary = load_with_retry(TargetTable::StopSearches, || {
            let calls = calls.clone();
            async move {
                // Fail the first attempt, succeed on the second.
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LoadError::Copy("connection reset".into()))
                } else {
                    Ok(LoadSummary {
                        rows: 7,
                        quarantined: 0,
                        dropped: 0,
                    })
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.loaded(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn load_retry_gives_up_after_the_attempt_ceiling() {
        let calls = Arc::new(AtomicUsize::new(0));

        let err = load_with_retry(TargetTable::RejectedRows, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<LoadSummary, _>(LoadError::Copy("still down".into()))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), LOAD_ATTEMPTS as usize);
        assert!(err.to_string().contains("still down"));
    }
}
