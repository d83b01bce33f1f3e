//! End-to-end tests for the retrying HTTP client against a mock upstream.

use std::time::{Duration, Instant};
use stopsearch_ingest::api::PoliceApi;
use stopsearch_ingest::client::HttpRetryClient;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Responds with a canned failure a fixed number of times, then succeeds.
struct FailThenSucceed {
    failures: std::sync::atomic::AtomicU32,
    failure_template: ResponseTemplate,
    success_template: ResponseTemplate,
}

impl FailThenSucceed {
    fn new(failures: u32, failure_template: ResponseTemplate, success_template: ResponseTemplate) -> Self {
        Self {
            failures: std::sync::atomic::AtomicU32::new(failures),
            failure_template,
            success_template,
        }
    }
}

impl Respond for FailThenSucceed {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let remaining = self.failures.load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.failures
                .store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
            self.failure_template.clone()
        } else {
            self.success_template.clone()
        }
    }
}

fn fast_client() -> HttpRetryClient {
    HttpRetryClient::default().with_base_backoff(Duration::from_millis(10))
}

#[tokio::test]
async fn honors_retry_after_on_rate_limit() {
    let server = MockServer::start().await;

    let responder = FailThenSucceed::new(
        1,
        ResponseTemplate::new(429).insert_header("Retry-After", "1"),
        ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})),
    );

    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(responder)
        .expect(2)
        .mount(&server)
        .await;

    let client = fast_client();
    let url = format!("{}/limited", server.uri());

    let start = Instant::now();
    let body = client.get_json(&url, &[]).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(body["ok"], true);
    // The server hint says wait one full second even though the exponential
    // base here is only 10ms.
    assert!(elapsed >= Duration::from_secs(1), "waited only {elapsed:?}");
}

#[tokio::test]
async fn retries_server_errors_until_success() {
    let server = MockServer::start().await;

    let responder = FailThenSucceed::new(
        2,
        ResponseTemplate::new(503),
        ResponseTemplate::new(200).set_body_json(serde_json::json!([1, 2, 3])),
    );

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(responder)
        .expect(3)
        .mount(&server)
        .await;

    let client = fast_client();
    let url = format!("{}/flaky", server.uri());

    let body = client.get_json(&url, &[]).await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn gives_up_after_attempt_ceiling() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&server)
        .await;

    let client = fast_client();
    let url = format!("{}/broken", server.uri());

    let err = client.get_json(&url, &[]).await.unwrap_err();
    assert!(err.to_string().contains("500"), "unexpected error: {err}");
}

#[tokio::test]
async fn client_errors_fail_immediately() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client();
    let url = format!("{}/missing", server.uri());

    let err = client.get_json(&url, &[]).await.unwrap_err();
    assert!(err.to_string().contains("404"), "unexpected error: {err}");
}

#[tokio::test]
async fn stops_endpoint_passes_force_and_month() {
    let server = MockServer::start().await;

    let records = serde_json::json!([
        {"type": "Person search", "datetime": "2023-03-04T11:22:00+00:00"},
        {"type": "Vehicle search", "datetime": "2023-03-05T09:00:00+00:00"},
    ]);

    Mock::given(method("GET"))
        .and(path("/stops-force"))
        .and(query_param("force", "leicestershire"))
        .and(query_param("date", "2023-03"))
        .respond_with(ResponseTemplate::new(200).set_body_json(records))
        .expect(1)
        .mount(&server)
        .await;

    let api = PoliceApi::new(fast_client(), server.uri());
    let page = api.stops_for_month("leicestershire", "2023-03").await.unwrap();

    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["type"], "Person search");
}

#[tokio::test]
async fn empty_partition_is_not_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/stops-force"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;

    let api = PoliceApi::new(fast_client(), server.uri());
    let page = api.stops_for_month("btp", "2023-01").await.unwrap();

    assert!(page.is_empty());
}
