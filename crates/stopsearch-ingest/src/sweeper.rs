//! Dead-letter remediation sweep
//!
//! Walks every quarantined stop-and-search payload, re-applies the
//! remediation rules, and re-inserts rows that now validate. Each row gets
//! its own transaction: insert plus dead-letter delete commit together, and
//! one row's failure never aborts the sweep of the rest.

use crate::record::{StopSearchRecord, STOP_SEARCH_COLUMNS, STOP_SEARCH_TABLE};
use crate::validator;
use anyhow::Result;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};

/// Re-attempt every rejected row destined for the canonical table.
///
/// Returns the number of rows successfully remediated (inserted and removed
/// from the dead-letter table).
pub async fn sweep(pool: &PgPool) -> Result<u64> {
    let rows: Vec<(i32, Value)> =
        sqlx::query_as("SELECT id, raw_data FROM rejected_rows WHERE source = $1 ORDER BY id")
            .bind(STOP_SEARCH_TABLE)
            .fetch_all(pool)
            .await?;

    if rows.is_empty() {
        info!("no rejected rows to remediate");
        return Ok(0);
    }

    let total = rows.len();
    info!(total, "attempting to remediate rejected rows");

    let mut remediated = 0u64;

    for (id, raw) in rows {
        let cleaned = validator::remediate(raw);

        let Some(force) = cleaned.get("force").and_then(Value::as_str).map(str::to_string)
        else {
            warn!(id, "rejected row has no force attached, leaving in place");
            continue;
        };

        let record = match validator::canonicalize(&cleaned, &force) {
            Ok(record) => record,
            Err(err) => {
                warn!(id, error = %err, "row still invalid after remediation");
                continue;
            }
        };

        let mut tx = pool.begin().await?;

        let attempt: Result<(), sqlx::Error> = async {
            insert_record(&mut tx, &record).await?;
            sqlx::query("DELETE FROM rejected_rows WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            Ok(())
        }
        .await;

        match attempt {
            Ok(()) => {
                tx.commit().await?;
                remediated += 1;
            }
            Err(err) => {
                // Dropping the transaction rolls this row's attempt back.
                warn!(id, error = %err, "failed to reinsert remediated row");
            }
        }
    }

    info!(remediated, total, "remediation sweep finished");

    Ok(remediated)
}

/// Row-by-row insert used by the sweeper (deliberately not the bulk path).
async fn insert_record(conn: &mut PgConnection, record: &StopSearchRecord) -> Result<(), sqlx::Error> {
    let columns = STOP_SEARCH_COLUMNS.join(", ");
    let placeholders = (1..=STOP_SEARCH_COLUMNS.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("INSERT INTO stop_searches ({columns}) VALUES ({placeholders})");

    sqlx::query(&sql)
        .bind(&record.force)
        .bind(&record.search_type)
        .bind(record.involved_person)
        .bind(record.datetime)
        .bind(record.operation)
        .bind(&record.operation_name)
        .bind(&record.latitude)
        .bind(&record.longitude)
        .bind(record.street_id)
        .bind(&record.street_name)
        .bind(&record.gender)
        .bind(&record.age_range)
        .bind(&record.self_defined_ethnicity)
        .bind(&record.officer_defined_ethnicity)
        .bind(&record.legislation)
        .bind(&record.object_of_search)
        .bind(&record.outcome)
        .bind(record.outcome_linked_to_object_of_search)
        .bind(record.removal_of_more_than_outer_clothing)
        .bind(&record.outcome_object_id)
        .bind(&record.outcome_object_name)
        .execute(conn)
        .await?;

    Ok(())
}
