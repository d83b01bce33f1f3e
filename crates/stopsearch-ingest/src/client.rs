//! Rate-limit-aware HTTP client with retry and backoff
//!
//! The upstream API rate-limits aggressively. A 429 carries an optional
//! `Retry-After` hint (seconds) which is honored exactly; transient failures
//! (network errors, 5xx) back off exponentially with a small jitter so
//! concurrent fetch units do not retry in lockstep.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Maximum attempts per logical request, including the first one.
pub const MAX_ATTEMPTS: u32 = 5;

/// Wait applied to a 429 without a `Retry-After` hint, in seconds.
const DEFAULT_RETRY_AFTER_SECS: f64 = 1.0;

/// Longest wait a `Retry-After` hint can impose, in seconds.
const MAX_RETRY_AFTER_SECS: f64 = 300.0;

/// HTTP request failure, per attempt.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: f64 },

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("unexpected status: HTTP {0}")]
    Status(u16),

    #[error("invalid JSON body: {0}")]
    Decode(String),
}

impl HttpError {
    /// Whether a subsequent attempt could plausibly succeed.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            HttpError::Network(_) | HttpError::RateLimited { .. } | HttpError::Server(_)
        )
    }
}

/// Exponential backoff with jitter for transient failures.
///
/// `attempt` is 0-based: the wait before retry `n+1` is
/// `base * 2^n * (1 + jitter)` with jitter uniform in `[0, 0.1)`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.mul_f64(2f64.powi(attempt as i32) * (1.0 + fastrand::f64() * 0.1))
}

/// Wait interval for a failed attempt.
///
/// A rate-limit hint from the server is used as-is; everything else grows
/// exponentially.
fn retry_delay(err: &HttpError, base: Duration, attempt: u32) -> Duration {
    match err {
        // A negative, non-finite, or absurd hint must not panic the task;
        // clamp rather than trust the server blindly.
        HttpError::RateLimited { retry_after } => {
            let secs = if retry_after.is_finite() {
                retry_after.clamp(0.0, MAX_RETRY_AFTER_SECS)
            } else {
                DEFAULT_RETRY_AFTER_SECS
            };
            Duration::from_secs_f64(secs)
        }
        _ => backoff_delay(base, attempt),
    }
}

/// Pooled HTTP client usable concurrently by many in-flight fetches.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpRetryClient {
    inner: reqwest::Client,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Default for HttpRetryClient {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS)
    }
}

impl HttpRetryClient {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: reqwest::Client::new(),
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::from_secs(1),
        }
    }

    /// Shrink the backoff unit (used by tests to keep retries fast).
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// GET `url` with `params`, returning the decoded JSON body.
    ///
    /// Retries transient failures up to the attempt ceiling, then re-raises
    /// the last error.
    pub async fn get_json(&self, url: &str, params: &[(&str, &str)]) -> Result<Value, HttpError> {
        let mut failures = 0u32;

        loop {
            match self.try_get(url, params).await {
                Ok(body) => return Ok(body),
                Err(err) => {
                    failures += 1;
                    if failures >= self.max_attempts || !err.is_retryable() {
                        return Err(err);
                    }

                    let delay = retry_delay(&err, self.base_backoff, failures - 1);
                    warn!(
                        %url,
                        error = %err,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_get(&self, url: &str, params: &[(&str, &str)]) -> Result<Value, HttpError> {
        let mut request = self.inner.get(url);
        if !params.is_empty() {
            request = request.query(params);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

            return Err(HttpError::RateLimited { retry_after });
        }

        if status.is_server_error() {
            return Err(HttpError::Server(status.as_u16()));
        }

        if !status.is_success() {
            return Err(HttpError::Status(status.as_u16()));
        }

        response
            .json()
            .await
            .map_err(|e| HttpError::Decode(e.to_string()))
    }
}

/// Single-request variant: fetch one URL with a throwaway connection.
///
/// Prefer [`HttpRetryClient`] whenever more than one request will be made.
pub async fn fetch_json(url: &str, params: &[(&str, &str)]) -> Result<Value, HttpError> {
    HttpRetryClient::default().get_json(url, params).await
}
