//! Record validation and remediation
//!
//! Turns one raw upstream JSON object into a canonical flattened row, or
//! rejects it with a reason. Pure and synchronous; the fetch layer decides
//! where it runs.
//!
//! Canonicalization accepts both the upstream nested shape
//! (`location.street.id`, `outcome_object.name`) and the already-flattened
//! shape (`street_id`, `outcome_object_name`), because quarantined COPY rows
//! come back through the sweeper as flat string maps.

use crate::record::{RejectedRow, StopSearchRecord};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {detail}")]
    InvalidField { field: &'static str, detail: String },
}

fn invalid(field: &'static str, detail: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field,
        detail: detail.into(),
    }
}

/// Validate and flatten one raw record into a canonical row.
///
/// Absent nested objects map to null leaves, not errors. Fails when
/// `datetime` is missing or unparseable, when `type` is missing, or when a
/// field has an uncoercible type (e.g. a boolean `outcome`).
pub fn canonicalize(raw: &Value, force: &str) -> Result<StopSearchRecord, ValidationError> {
    let obj = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    let search_type =
        opt_string(obj, "type")?.ok_or(ValidationError::MissingField("type"))?;

    let datetime_text =
        opt_string(obj, "datetime")?.ok_or(ValidationError::MissingField("datetime"))?;
    let datetime = parse_datetime(&datetime_text)?;

    let (latitude, longitude, street_id, street_name) = location_fields(obj)?;
    let (outcome_object_id, outcome_object_name) = outcome_object_fields(obj)?;

    Ok(StopSearchRecord {
        force: force.to_string(),
        search_type,
        involved_person: opt_bool(obj, "involved_person")?,
        datetime,
        operation: opt_bool(obj, "operation")?,
        operation_name: opt_string(obj, "operation_name")?,
        latitude,
        longitude,
        street_id,
        street_name,
        gender: opt_string(obj, "gender")?,
        age_range: opt_string(obj, "age_range")?,
        self_defined_ethnicity: opt_string(obj, "self_defined_ethnicity")?,
        officer_defined_ethnicity: opt_string(obj, "officer_defined_ethnicity")?,
        legislation: opt_string(obj, "legislation")?,
        object_of_search: opt_string(obj, "object_of_search")?,
        outcome: opt_string(obj, "outcome")?,
        outcome_linked_to_object_of_search: opt_bool(obj, "outcome_linked_to_object_of_search")?,
        removal_of_more_than_outer_clothing: opt_bool(
            obj,
            "removal_of_more_than_outer_clothing",
        )?,
        outcome_object_id,
        outcome_object_name,
    })
}

/// Apply known upstream data quirks before a second canonicalize attempt.
///
/// - the upstream conflates "no outcome" with boolean `false`; rewrite it to
///   the categorical string "Nothing found";
/// - `involved_person` is unreliable for vehicle-only searches; force it to
///   `false` for "Vehicle search" and `true` otherwise.
///
/// Applying this twice is a no-op.
pub fn remediate(mut raw: Value) -> Value {
    if let Some(obj) = raw.as_object_mut() {
        if obj.get("outcome") == Some(&Value::Bool(false)) {
            obj.insert("outcome".to_string(), json!("Nothing found"));
        }

        let vehicle_search =
            obj.get("type").and_then(Value::as_str) == Some("Vehicle search");
        obj.insert("involved_person".to_string(), Value::Bool(!vehicle_search));
    }

    raw
}

/// Validate a fetched page, with one remediation retry per record.
///
/// Records still invalid after remediation are rejected for this run, with
/// the force identifier folded into the stored payload so the sweeper can
/// re-attempt them later.
pub fn process_page(force: &str, page: Vec<Value>) -> (Vec<StopSearchRecord>, Vec<RejectedRow>) {
    let total = page.len();
    let mut valid = Vec::with_capacity(total);
    let mut rejected = Vec::new();

    for item in page {
        match canonicalize(&item, force) {
            Ok(record) => valid.push(record),
            Err(_) => {
                let cleaned = remediate(item.clone());
                match canonicalize(&cleaned, force) {
                    Ok(record) => valid.push(record),
                    Err(err) => {
                        rejected.push(RejectedRow::stop_search(
                            tag_force(item, force),
                            err.to_string(),
                        ));
                    }
                }
            }
        }
    }

    debug!(
        %force,
        total,
        valid = valid.len(),
        rejected = rejected.len(),
        "processed page"
    );

    (valid, rejected)
}

fn tag_force(mut raw: Value, force: &str) -> Value {
    if let Some(obj) = raw.as_object_mut() {
        obj.insert("force".to_string(), json!(force));
    }
    raw
}

fn parse_datetime(text: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| invalid("datetime", format!("{e}: {text:?}")))
}

/// Optional string field; blank strings collapse to null.
fn opt_string(obj: &Map<String, Value>, field: &'static str) -> Result<Option<String>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(invalid(field, format!("expected string, got {other}"))),
    }
}

/// Optional boolean field; also accepts "true"/"false" strings from
/// flattened rows.
fn opt_bool(obj: &Map<String, Value>, field: &'static str) -> Result<Option<bool>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "true" | "t" => Ok(Some(true)),
            "false" | "f" => Ok(Some(false)),
            other => Err(invalid(field, format!("expected boolean, got {other:?}"))),
        },
        Some(other) => Err(invalid(field, format!("expected boolean, got {other}"))),
    }
}

/// Optional integer field; accepts numbers and numeric strings.
fn opt_i64(obj: &Map<String, Value>, field: &'static str) -> Result<Option<i64>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| invalid(field, format!("expected integer, got {n}"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| invalid(field, format!("expected integer, got {s:?}"))),
        Some(other) => Err(invalid(field, format!("expected integer, got {other}"))),
    }
}

/// Optional coordinate; the upstream sends these as strings but numbers are
/// tolerated and stringified.
fn opt_coord(obj: &Map<String, Value>, field: &'static str) -> Result<Option<String>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(invalid(field, format!("expected coordinate, got {other}"))),
    }
}

type LocationFields = (Option<String>, Option<String>, Option<i64>, Option<String>);

fn location_fields(obj: &Map<String, Value>) -> Result<LocationFields, ValidationError> {
    match obj.get("location") {
        Some(Value::Object(location)) => {
            let latitude = opt_coord(location, "latitude")?;
            let longitude = opt_coord(location, "longitude")?;
            let (street_id, street_name) = match location.get("street") {
                Some(Value::Object(street)) => {
                    (opt_i64(street, "id")?, opt_string(street, "name")?)
                }
                None | Some(Value::Null) => (None, None),
                Some(other) => {
                    return Err(invalid("location", format!("expected street object, got {other}")))
                }
            };
            Ok((latitude, longitude, street_id, street_name))
        }
        // Flattened shape, or genuinely no location.
        None | Some(Value::Null) => Ok((
            opt_coord(obj, "latitude")?,
            opt_coord(obj, "longitude")?,
            opt_i64(obj, "street_id")?,
            opt_string(obj, "street_name")?,
        )),
        Some(other) => Err(invalid("location", format!("expected object, got {other}"))),
    }
}

fn outcome_object_fields(
    obj: &Map<String, Value>,
) -> Result<(Option<String>, Option<String>), ValidationError> {
    match obj.get("outcome_object") {
        Some(Value::Object(outcome)) => {
            Ok((opt_string(outcome, "id")?, opt_string(outcome, "name")?))
        }
        None | Some(Value::Null) => Ok((
            opt_string(obj, "outcome_object_id")?,
            opt_string(obj, "outcome_object_name")?,
        )),
        Some(other) => Err(invalid("outcome_object", format!("expected object, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw_person_search() -> Value {
        json!({
            "type": "Person search",
            "involved_person": true,
            "datetime": "2024-01-06T22:45:00+00:00",
            "operation": null,
            "operation_name": null,
            "location": {
                "latitude": "52.636",
                "longitude": "-1.133",
                "street": {"id": 883345, "name": "On or near Granby Street"}
            },
            "gender": "Male",
            "age_range": "18-24",
            "self_defined_ethnicity": "White - English/Welsh/Scottish/Northern Irish/British",
            "officer_defined_ethnicity": "White",
            "legislation": "Misuse of Drugs Act 1971 (section 23)",
            "object_of_search": "Controlled drugs",
            "outcome": "A no further action disposal",
            "outcome_linked_to_object_of_search": false,
            "removal_of_more_than_outer_clothing": false,
            "outcome_object": {"id": "bu-no-further-action", "name": "A no further action disposal"}
        })
    }

    #[test]
    fn canonicalize_flattens_nested_objects() {
        let record = canonicalize(&raw_person_search(), "leicestershire").unwrap();
        assert_eq!(record.force, "leicestershire");
        assert_eq!(record.search_type, "Person search");
        assert_eq!(record.latitude.as_deref(), Some("52.636"));
        assert_eq!(record.street_id, Some(883345));
        assert_eq!(record.street_name.as_deref(), Some("On or near Granby Street"));
        assert_eq!(record.outcome_object_id.as_deref(), Some("bu-no-further-action"));
        assert_eq!(
            record.datetime,
            Utc.with_ymd_and_hms(2024, 1, 6, 22, 45, 0).unwrap()
        );
    }

    #[test]
    fn absent_nested_objects_become_null_leaves() {
        let raw = json!({
            "type": "Person search",
            "datetime": "2024-01-06T22:45:00+00:00"
        });
        let record = canonicalize(&raw, "btp").unwrap();
        assert_eq!(record.latitude, None);
        assert_eq!(record.street_id, None);
        assert_eq!(record.outcome_object_name, None);
    }

    #[test]
    fn canonicalize_accepts_flattened_rows() {
        // The shape a quarantined COPY row takes after CSV re-parsing: all
        // strings, flat keys, empty strings for nulls.
        let raw = json!({
            "force": "btp",
            "type": "Person search",
            "involved_person": "true",
            "datetime": "2024-01-06T22:45:00+00:00",
            "latitude": "52.636",
            "street_id": "883345",
            "street_name": "On or near Granby Street",
            "operation": "",
            "outcome": "Nothing found"
        });
        let record = canonicalize(&raw, "btp").unwrap();
        assert_eq!(record.involved_person, Some(true));
        assert_eq!(record.street_id, Some(883345));
        assert_eq!(record.operation, None);
    }

    #[test]
    fn boolean_outcome_fails_then_remediates_to_nothing_found() {
        let mut raw = raw_person_search();
        raw["outcome"] = json!(false);

        let err = canonicalize(&raw, "leicestershire").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { field: "outcome", .. }));

        let record = canonicalize(&remediate(raw), "leicestershire").unwrap();
        assert_eq!(record.outcome.as_deref(), Some("Nothing found"));
        assert_eq!(record.involved_person, Some(true));
    }

    #[test]
    fn remediation_forces_involved_person_for_vehicle_searches() {
        let raw = remediate(json!({
            "type": "Vehicle search",
            "involved_person": true,
            "datetime": "2024-01-06T22:45:00+00:00"
        }));
        assert_eq!(raw["involved_person"], json!(false));

        let raw = remediate(json!({
            "type": "Person search and Vehicle search",
            "datetime": "2024-01-06T22:45:00+00:00"
        }));
        assert_eq!(raw["involved_person"], json!(true));
    }

    #[test]
    fn remediation_is_idempotent() {
        for raw in [
            json!({"type": "Vehicle search", "outcome": false, "datetime": "x"}),
            json!({"type": "Person search", "outcome": "Arrest", "involved_person": false}),
            json!({"no_type": true}),
        ] {
            let once = remediate(raw.clone());
            let twice = remediate(once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn unparseable_datetime_is_rejected_even_after_remediation() {
        let raw = json!({"datetime": "invalid-date-format"});

        assert!(canonicalize(&raw, "btp").is_err());
        assert!(canonicalize(&remediate(raw.clone()), "btp").is_err());

        let (valid, rejected) = process_page("btp", vec![raw]);
        assert!(valid.is_empty());
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].raw["datetime"], json!("invalid-date-format"));
        // The force is folded in for the sweeper.
        assert_eq!(rejected[0].raw["force"], json!("btp"));
    }

    #[test]
    fn process_page_remediates_boolean_outcome_records() {
        let mut record = raw_person_search();
        record["outcome"] = json!(false);

        let (valid, rejected) = process_page("leicestershire", vec![record]);
        assert_eq!(valid.len(), 1);
        assert!(rejected.is_empty());
        assert_eq!(valid[0].outcome.as_deref(), Some("Nothing found"));
        assert_eq!(valid[0].involved_person, Some(true));
    }

    #[test]
    fn missing_type_is_rejected() {
        let raw = json!({"datetime": "2024-01-06T22:45:00+00:00"});
        assert_eq!(
            canonicalize(&raw, "btp").unwrap_err(),
            ValidationError::MissingField("type")
        );
    }
}
