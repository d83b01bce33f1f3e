//! Upstream police data API endpoints
//!
//! Two endpoints matter to the pipeline: stop-and-search records for one
//! force × month partition, and the availability listing describing which
//! months each force has published.

use crate::client::{HttpError, HttpRetryClient};
use serde_json::Value;
use std::collections::HashMap;

/// Default upstream API base.
pub const DEFAULT_BASE_URL: &str = "https://data.police.uk/api";

/// Months available per force, sorted ascending.
pub type Availability = HashMap<String, Vec<String>>;

/// Thin typed wrapper over the upstream endpoints.
#[derive(Debug, Clone)]
pub struct PoliceApi {
    client: HttpRetryClient,
    base_url: String,
}

impl PoliceApi {
    pub fn new(client: HttpRetryClient, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    /// `GET /stops-force?force=<force>&date=<YYYY-MM>`
    ///
    /// Returns the raw record objects for one partition. An empty body is an
    /// empty partition, not an error.
    pub async fn stops_for_month(
        &self,
        force: &str,
        month: &str,
    ) -> Result<Vec<Value>, HttpError> {
        let url = format!("{}/stops-force", self.base_url);
        let body = self
            .client
            .get_json(&url, &[("force", force), ("date", month)])
            .await?;

        match body {
            Value::Array(records) => Ok(records),
            Value::Null => Ok(Vec::new()),
            other => Err(HttpError::Decode(format!(
                "expected a JSON array of records, got {}",
                type_name(&other)
            ))),
        }
    }

    /// `GET /crimes-street-dates`
    ///
    /// Flattens the upstream `{date, "stop-and-search": [force, ...]}` entries
    /// into a per-force sorted month list.
    pub async fn availability(&self) -> Result<Availability, HttpError> {
        let url = format!("{}/crimes-street-dates", self.base_url);
        let body = self.client.get_json(&url, &[]).await?;

        let entries = body.as_array().ok_or_else(|| {
            HttpError::Decode(format!(
                "expected a JSON array of availability entries, got {}",
                type_name(&body)
            ))
        })?;

        let mut availability: Availability = HashMap::new();

        for entry in entries {
            let Some(month) = entry.get("date").and_then(Value::as_str) else {
                continue;
            };

            let forces = entry
                .get("stop-and-search")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            for force in forces.iter().filter_map(Value::as_str) {
                availability
                    .entry(force.to_string())
                    .or_default()
                    .push(month.to_string());
            }
        }

        for months in availability.values_mut() {
            months.sort();
        }

        Ok(availability)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        let api = PoliceApi::new(HttpRetryClient::default(), "https://example.test/api/");
        assert_eq!(api.base_url, "https://example.test/api");
    }

    #[tokio::test]
    async fn availability_parses_and_sorts_months() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = json!([
            {"date": "2023-03", "stop-and-search": ["leicestershire", "btp"]},
            {"date": "2023-01", "stop-and-search": ["leicestershire"]},
            {"date": "2023-02", "stop-and-search": ["leicestershire"]},
            {"date": "2023-04"},
            {"stop-and-search": ["kent"]},
        ]);

        Mock::given(method("GET"))
            .and(path("/crimes-street-dates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let api = PoliceApi::new(HttpRetryClient::default(), server.uri());
        let availability = api.availability().await.unwrap();

        assert_eq!(
            availability.get("leicestershire").unwrap(),
            &vec!["2023-01".to_string(), "2023-02".to_string(), "2023-03".to_string()]
        );
        assert_eq!(availability.get("btp").unwrap(), &vec!["2023-03".to_string()]);
        // An entry without a date contributes nothing.
        assert!(!availability.contains_key("kent"));
    }
}
