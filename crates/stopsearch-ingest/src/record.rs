//! Canonical row shapes and their CSV encoding
//!
//! Bulk loading goes through Postgres COPY in CSV format, so every row type
//! knows how to render itself as one CSV line in the exact column order the
//! COPY statement names. Empty unquoted fields become NULL on the server.

use chrono::{DateTime, Utc};
use serde_json::Value;
use stopsearch_common::StopSearchError;

/// Primary table for canonical rows.
pub const STOP_SEARCH_TABLE: &str = "stop_searches";

/// Dead-letter table for rejected/unloadable payloads.
pub const REJECTED_ROWS_TABLE: &str = "rejected_rows";

/// Column order for the canonical table COPY header.
pub const STOP_SEARCH_COLUMNS: [&str; 21] = [
    "force",
    "type",
    "involved_person",
    "datetime",
    "operation",
    "operation_name",
    "latitude",
    "longitude",
    "street_id",
    "street_name",
    "gender",
    "age_range",
    "self_defined_ethnicity",
    "officer_defined_ethnicity",
    "legislation",
    "object_of_search",
    "outcome",
    "outcome_linked_to_object_of_search",
    "removal_of_more_than_outer_clothing",
    "outcome_object_id",
    "outcome_object_name",
];

/// Column order for the dead-letter table COPY header.
pub const REJECTED_ROW_COLUMNS: [&str; 3] = ["raw_data", "reason", "source"];

/// One canonical stop-and-search event, flattened.
///
/// Immutable after load; identity is the storage-assigned surrogate key.
#[derive(Debug, Clone, PartialEq)]
pub struct StopSearchRecord {
    pub force: String,
    pub search_type: String,
    pub involved_person: Option<bool>,
    pub datetime: DateTime<Utc>,
    pub operation: Option<bool>,
    pub operation_name: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub street_id: Option<i64>,
    pub street_name: Option<String>,
    pub gender: Option<String>,
    pub age_range: Option<String>,
    pub self_defined_ethnicity: Option<String>,
    pub officer_defined_ethnicity: Option<String>,
    pub legislation: Option<String>,
    pub object_of_search: Option<String>,
    pub outcome: Option<String>,
    pub outcome_linked_to_object_of_search: Option<bool>,
    pub removal_of_more_than_outer_clothing: Option<bool>,
    pub outcome_object_id: Option<String>,
    pub outcome_object_name: Option<String>,
}

impl StopSearchRecord {
    /// Field values in [`STOP_SEARCH_COLUMNS`] order.
    pub fn csv_fields(&self) -> Vec<String> {
        vec![
            self.force.clone(),
            self.search_type.clone(),
            opt_bool(self.involved_person),
            self.datetime.to_rfc3339(),
            opt_bool(self.operation),
            opt_str(&self.operation_name),
            opt_str(&self.latitude),
            opt_str(&self.longitude),
            self.street_id.map(|id| id.to_string()).unwrap_or_default(),
            opt_str(&self.street_name),
            opt_str(&self.gender),
            opt_str(&self.age_range),
            opt_str(&self.self_defined_ethnicity),
            opt_str(&self.officer_defined_ethnicity),
            opt_str(&self.legislation),
            opt_str(&self.object_of_search),
            opt_str(&self.outcome),
            opt_bool(self.outcome_linked_to_object_of_search),
            opt_bool(self.removal_of_more_than_outer_clothing),
            opt_str(&self.outcome_object_id),
            opt_str(&self.outcome_object_name),
        ]
    }

    pub fn to_csv_line(&self) -> Result<String, StopSearchError> {
        csv_line(&self.csv_fields())
    }
}

/// A raw payload that failed validation or loading, plus why.
///
/// `source` labels the table the row was destined for, so stop-and-search
/// rejects can be told apart from other reject-producing pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub raw: Value,
    pub reason: String,
    pub source: String,
}

impl RejectedRow {
    /// A reject destined for the canonical stop-and-search table.
    pub fn stop_search(raw: Value, reason: impl Into<String>) -> Self {
        Self {
            raw,
            reason: reason.into(),
            source: STOP_SEARCH_TABLE.to_string(),
        }
    }

    /// Field values in [`REJECTED_ROW_COLUMNS`] order.
    pub fn csv_fields(&self) -> Vec<String> {
        vec![self.raw.to_string(), self.reason.clone(), self.source.clone()]
    }

    pub fn to_csv_line(&self) -> Result<String, StopSearchError> {
        csv_line(&self.csv_fields())
    }
}

/// COPY header line for a column set.
pub fn csv_header(columns: &[&str]) -> String {
    columns.join(",")
}

/// Encode one row of fields as a single CSV line (no trailing newline).
pub fn csv_line(fields: &[String]) -> Result<String, StopSearchError> {
    let mut buf = Vec::with_capacity(128);
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&mut buf);
        writer
            .write_record(fields)
            .map_err(|e| StopSearchError::Parse(e.to_string()))?;
        writer.flush()?;
    }

    let mut line =
        String::from_utf8(buf).map_err(|e| StopSearchError::Parse(e.to_string()))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

fn opt_str(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn opt_bool(value: Option<bool>) -> String {
    match value {
        Some(true) => "true".to_string(),
        Some(false) => "false".to_string(),
        None => String::new(),
    }
}
