//! Adaptive bulk loader
//!
//! Loads canonical CSV rows through Postgres `COPY ... FROM STDIN`. A COPY
//! aborts wholesale on the first bad row without saying which one, so the
//! loader isolates bad rows itself: try the full set once, then fall back to
//! fixed-size batches, recursively splitting any failing batch by ten until a
//! single row remains. That row is quarantined into the dead-letter table and
//! the rest of the load proceeds.
//!
//! Every COPY runs under a savepoint inside one surrounding transaction, so a
//! failed batch rolls back without discarding batches that already succeeded.

use crate::record::{
    csv_header, REJECTED_ROWS_TABLE, REJECTED_ROW_COLUMNS, STOP_SEARCH_COLUMNS,
    STOP_SEARCH_TABLE,
};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::{error, info, warn};

/// Batch size for the first fallback level after a failed full copy.
const BATCH_SIZE: usize = 1000;

/// Fan-out of each recursive split: 1000 -> 100 -> 10 -> 1.
const SPLIT_FACTOR: usize = 10;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("copy failed: {0}")]
    Copy(String),
}

/// The two tables the loader may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetTable {
    StopSearches,
    RejectedRows,
}

impl TargetTable {
    pub fn name(self) -> &'static str {
        match self {
            TargetTable::StopSearches => STOP_SEARCH_TABLE,
            TargetTable::RejectedRows => REJECTED_ROWS_TABLE,
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            TargetTable::StopSearches => &STOP_SEARCH_COLUMNS,
            TargetTable::RejectedRows => &REJECTED_ROW_COLUMNS,
        }
    }

    /// Only canonical rows are quarantined; a reject that cannot even be
    /// inserted into the dead-letter table is logged and dropped.
    fn quarantines(self) -> bool {
        matches!(self, TargetTable::StopSearches)
    }
}

/// Outcome of one `load` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Rows submitted.
    pub rows: usize,
    /// Rows moved to the dead-letter table.
    pub quarantined: usize,
    /// Rows that could be neither loaded nor quarantined.
    pub dropped: usize,
}

impl LoadSummary {
    pub fn loaded(&self) -> usize {
        self.rows - self.quarantined - self.dropped
    }
}

/// The capability the bisection recurses over: attempt a COPY of some rows,
/// or quarantine a single row that cannot be loaded.
pub(crate) trait CopySink {
    async fn copy_rows(&mut self, rows: &[String]) -> Result<(), LoadError>;
    async fn quarantine(&mut self, row: &str, reason: &str) -> Result<(), LoadError>;
}

/// Recursive bisection over a failing batch.
///
/// A batch that fails with more than one row is split into ten roughly-equal
/// sub-batches and each retried; a single failing row is quarantined. One
/// corrupt row therefore costs `O(log n)` extra COPY calls instead of
/// per-row inserts for the all-valid common case.
async fn insert_batch<S: CopySink>(sink: &mut S, rows: &[String]) -> Result<(), LoadError> {
    match sink.copy_rows(rows).await {
        Ok(()) => Ok(()),
        Err(err) if rows.len() == 1 => sink.quarantine(&rows[0], &err.to_string()).await,
        Err(_) => {
            let chunk = (rows.len() / SPLIT_FACTOR).max(1);
            for sub in rows.chunks(chunk) {
                Box::pin(insert_batch(sink, sub)).await?;
            }
            Ok(())
        }
    }
}

/// COPY-based sink bound to one open transaction.
struct PgCopySink<'a> {
    conn: &'a mut PgConnection,
    table: TargetTable,
    header: String,
    copy_sql: String,
    quarantined: usize,
    dropped: usize,
}

impl<'a> PgCopySink<'a> {
    fn new(conn: &'a mut PgConnection, table: TargetTable) -> Self {
        let header = csv_header(table.columns());
        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
            table.name(),
            header
        );
        Self {
            conn,
            table,
            header,
            copy_sql,
            quarantined: 0,
            dropped: 0,
        }
    }

    async fn stream_rows(&mut self, rows: &[String]) -> Result<(), LoadError> {
        let mut copy = self.conn.copy_in_raw(&self.copy_sql).await?;

        let mut payload = String::with_capacity(
            self.header.len() + 1 + rows.iter().map(|r| r.len() + 1).sum::<usize>(),
        );
        payload.push_str(&self.header);
        payload.push('\n');
        for row in rows {
            payload.push_str(row);
            payload.push('\n');
        }

        if let Err(err) = copy.send(payload.into_bytes()).await {
            return Err(LoadError::Copy(err.to_string()));
        }

        copy.finish()
            .await
            .map(|_| ())
            .map_err(|err| LoadError::Copy(err.to_string()))
    }
}

impl CopySink for PgCopySink<'_> {
    async fn copy_rows(&mut self, rows: &[String]) -> Result<(), LoadError> {
        sqlx::query("SAVEPOINT copy_batch")
            .execute(&mut *self.conn)
            .await?;

        match self.stream_rows(rows).await {
            Ok(()) => {
                sqlx::query("RELEASE SAVEPOINT copy_batch")
                    .execute(&mut *self.conn)
                    .await?;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = sqlx::query("ROLLBACK TO SAVEPOINT copy_batch")
                    .execute(&mut *self.conn)
                    .await
                {
                    // The surrounding transaction may be unusable now, but
                    // loading continues and surfaces whatever happens next.
                    error!(error = %rollback_err, "rollback to savepoint failed");
                }
                Err(err)
            }
        }
    }

    async fn quarantine(&mut self, row: &str, reason: &str) -> Result<(), LoadError> {
        warn!(table = self.table.name(), %reason, "row failed to load");

        if !self.table.quarantines() {
            error!(table = self.table.name(), "dropping unloadable dead-letter row");
            self.dropped += 1;
            return Ok(());
        }

        let raw = match reparse_csv_row(&self.header, row) {
            Ok(raw) => raw,
            Err(parse_err) => {
                error!(error = %parse_err, "could not re-parse failed row, dropping it");
                self.dropped += 1;
                return Ok(());
            }
        };

        sqlx::query("SAVEPOINT quarantine_row")
            .execute(&mut *self.conn)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO rejected_rows (raw_data, reason, source) VALUES ($1, $2, $3)",
        )
        .bind(&raw)
        .bind(reason)
        .bind(self.table.name())
        .execute(&mut *self.conn)
        .await;

        match inserted {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT quarantine_row")
                    .execute(&mut *self.conn)
                    .await?;
                self.quarantined += 1;
            }
            Err(insert_err) => {
                error!(error = %insert_err, "failed to quarantine row, dropping it");
                sqlx::query("ROLLBACK TO SAVEPOINT quarantine_row")
                    .execute(&mut *self.conn)
                    .await?;
                self.dropped += 1;
            }
        }

        Ok(())
    }
}

/// Re-parse one CSV line back into a JSON object keyed by column name, for
/// easier later inspection. Empty fields become nulls.
fn reparse_csv_row(header: &str, row: &str) -> Result<Value, String> {
    let input = format!("{header}\n{row}");
    let mut reader = csv::Reader::from_reader(input.as_bytes());

    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let record = reader
        .records()
        .next()
        .ok_or_else(|| "empty row".to_string())?
        .map_err(|e| e.to_string())?;

    let mut map = serde_json::Map::with_capacity(headers.len());
    for (column, value) in headers.iter().zip(record.iter()) {
        let value = if value.is_empty() {
            Value::Null
        } else {
            Value::String(value.to_string())
        };
        map.insert(column.to_string(), value);
    }

    Ok(Value::Object(map))
}

/// Bulk loader over a Postgres pool.
#[derive(Debug, Clone)]
pub struct BulkLoader {
    pool: PgPool,
}

impl BulkLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load `rows` (pre-encoded CSV lines) into `table`.
    ///
    /// Never partially loads without recording: every submitted row ends up
    /// loaded, quarantined, or logged as dropped.
    pub async fn load(
        &self,
        table: TargetTable,
        rows: Vec<String>,
    ) -> Result<LoadSummary, LoadError> {
        if rows.is_empty() {
            info!(table = table.name(), "no rows to load");
            return Ok(LoadSummary::default());
        }

        let mut tx = self.pool.begin().await?;
        let mut summary = LoadSummary {
            rows: rows.len(),
            ..LoadSummary::default()
        };

        {
            let mut sink = PgCopySink::new(&mut tx, table);

            match sink.copy_rows(&rows).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(
                        table = table.name(),
                        error = %err,
                        "full copy failed, falling back to batched load"
                    );
                    for batch in rows.chunks(BATCH_SIZE) {
                        insert_batch(&mut sink, batch).await?;
                    }
                }
            }

            summary.quarantined = sink.quarantined;
            summary.dropped = sink.dropped;
        }

        tx.commit().await?;

        info!(
            table = table.name(),
            rows = summary.rows,
            loaded = summary.loaded(),
            quarantined = summary.quarantined,
            dropped = summary.dropped,
            "bulk load finished"
        );

        Ok(summary)
    }
}
