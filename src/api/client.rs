//! HTTP request pipeline with retry, backoff, and interceptor hooks.
//!
//! One pooled client, one retry policy: transport-level failures (no
//! response, 5xx, 408) are retried with a 2^attempt delay curve; everything
//! else fails fast. Terminal outcomes update running statistics and fire the
//! registered callbacks exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::RwLock;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ApiConfig;

use super::error::ApiError;
use super::interceptor::{ErrorCallback, RequestInterceptor, ResponseContext, ResponseInterceptor};

/// One HTTP-style call attempt. Created per try, discarded when the
/// pipeline finishes.
#[derive(Debug)]
struct RequestAttempt {
    method: Method,
    target: String,
    attempt: u32,
}

enum AttemptResult {
    Success(Option<Value>),
    Fail(ApiError),
}

/// Running pipeline statistics
#[derive(Debug, Default)]
pub struct RequestStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
}

impl RequestStats {
    fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_terminal(&self, success: bool, latency: Duration) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_sum_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RequestStatsSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let avg_latency_ms = if count == 0 {
            0.0
        } else {
            self.latency_sum_us.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
        };
        RequestStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            avg_latency_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

/// The request pipeline
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
    request_interceptors: RwLock<Vec<RequestInterceptor>>,
    response_interceptors: RwLock<Vec<ResponseInterceptor>>,
    on_error: RwLock<Option<ErrorCallback>>,
    on_auth_failure: RwLock<Option<ErrorCallback>>,
    stats: RequestStats,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::CONTENT_TYPE,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                headers.insert(
                    reqwest::header::ACCEPT,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                if let Some(token) = &config.auth_token {
                    headers.insert(
                        reqwest::header::AUTHORIZATION,
                        format!("Bearer {}", token)
                            .parse()
                            .context("Invalid auth token")?,
                    );
                }
                headers
            })
            .build()
            .context("Failed to build ApiClient")?;

        Ok(Self {
            http,
            config,
            request_interceptors: RwLock::new(Vec::new()),
            response_interceptors: RwLock::new(Vec::new()),
            on_error: RwLock::new(None),
            on_auth_failure: RwLock::new(None),
            stats: RequestStats::default(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    /// Register a pure transform applied to every outgoing request,
    /// in registration order.
    pub fn add_request_interceptor(&self, interceptor: RequestInterceptor) {
        self.request_interceptors.write().push(interceptor);
    }

    /// Register an inspection hook invoked for every received response.
    pub fn add_response_interceptor(&self, interceptor: ResponseInterceptor) {
        self.response_interceptors.write().push(interceptor);
    }

    /// Invoked exactly once per terminal failure, before the error returns.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.on_error.write() = Some(callback);
    }

    /// Invoked on 401/403 terminal failures, before the global callback.
    pub fn set_auth_failure_callback(&self, callback: ErrorCallback) {
        *self.on_auth_failure.write() = Some(callback);
    }

    /// Send a request. Returns `Ok(None)` for an empty response body.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, ApiError> {
        self.send_query(method, path, &[], payload, timeout).await
    }

    /// Send a request with explicit query parameters built by the caller.
    pub async fn send_query(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        payload: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, ApiError> {
        let url = self.url(path);
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            self.stats.record_attempt();
            let started = Instant::now();

            let error = match self
                .execute_attempt(&method, &url, query, payload.as_ref(), timeout, attempt)
                .await
            {
                AttemptResult::Success(value) => {
                    self.stats.record_terminal(true, started.elapsed());
                    return Ok(value);
                }
                AttemptResult::Fail(err) => err,
            };

            if error.recoverable && attempt + 1 < max_attempts {
                let delay = retry_delay(attempt, self.config.retry_backoff_unit);
                debug!(
                    "attempt {} {} {} failed (status {}), retrying in {:?}",
                    attempt + 1,
                    method,
                    url,
                    error.status,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            self.stats.record_terminal(false, started.elapsed());
            return Err(self.terminal_failure(error));
        }
    }

    /// Send a request and decode the body into `T`. A shape mismatch is a
    /// `Deserialization` error, distinct from any transport failure.
    pub async fn send_json<T, B>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let body = match payload {
            Some(b) => Some(serde_json::to_value(b).map_err(|e| {
                ApiError::deserialization(0, e.to_string(), method.clone(), self.url(path))
            })?),
            None => None,
        };

        match self.send(method.clone(), path, body, timeout).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                let err =
                    ApiError::deserialization(200, e.to_string(), method, self.url(path));
                self.notify_error(&err);
                err
            }),
            None => {
                let err = ApiError::deserialization(
                    200,
                    "empty response body".into(),
                    method,
                    self.url(path),
                );
                self.notify_error(&err);
                Err(err)
            }
        }
    }

    async fn execute_attempt(
        &self,
        method: &Method,
        url: &str,
        query: &[(String, String)],
        payload: Option<&Value>,
        timeout: Duration,
        attempt: u32,
    ) -> AttemptResult {
        let att = RequestAttempt {
            method: method.clone(),
            target: url.to_string(),
            attempt,
        };
        debug!("{} {} attempt {}", att.method, att.target, att.attempt);

        let mut builder = self.http.request(method.clone(), url).timeout(timeout);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = payload {
            builder = builder.json(body);
        }
        {
            let interceptors = self.request_interceptors.read();
            for transform in interceptors.iter() {
                builder = transform(builder);
            }
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                return AttemptResult::Fail(ApiError::transport(
                    e.to_string(),
                    method.clone(),
                    url.to_string(),
                ))
            }
        };

        let status = resp.status().as_u16();
        self.run_response_interceptors(status, method, url, attempt);

        if !resp.status().is_success() {
            return AttemptResult::Fail(ApiError::from_status(
                status,
                format!("server returned {}", resp.status()),
                method.clone(),
                url.to_string(),
            ));
        }

        let text = match resp.text().await {
            Ok(t) => t,
            Err(e) => {
                return AttemptResult::Fail(ApiError::transport(
                    format!("failed to read body: {}", e),
                    method.clone(),
                    url.to_string(),
                ))
            }
        };

        if text.is_empty() {
            return AttemptResult::Success(None);
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(value) => AttemptResult::Success(Some(value)),
            Err(e) => AttemptResult::Fail(ApiError::deserialization(
                status,
                e.to_string(),
                method.clone(),
                url.to_string(),
            )),
        }
    }

    fn run_response_interceptors(&self, status: u16, method: &Method, target: &str, attempt: u32) {
        let ctx = ResponseContext {
            status,
            method: method.clone(),
            target: target.to_string(),
            attempt,
        };
        let interceptors = self.response_interceptors.read();
        for hook in interceptors.iter() {
            hook(&ctx);
        }
    }

    /// Fire callbacks for a terminal failure and hand the error back.
    fn terminal_failure(&self, error: ApiError) -> ApiError {
        if error.is_auth() {
            if let Some(cb) = self.on_auth_failure.read().as_ref() {
                cb(&error);
            }
        }
        self.notify_error(&error);
        warn!("request failed: {}", error);
        error
    }

    fn notify_error(&self, error: &ApiError) {
        if let Some(cb) = self.on_error.read().as_ref() {
            cb(error);
        }
    }
}

/// Delay before retry `attempt` (0-based): unit * 2^attempt.
pub fn retry_delay(attempt: u32, unit: Duration) -> Duration {
    unit.saturating_mul(1u32 << attempt.min(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles() {
        let unit = Duration::from_millis(500);
        assert_eq!(retry_delay(0, unit), Duration::from_millis(500));
        assert_eq!(retry_delay(1, unit), Duration::from_millis(1000));
        assert_eq!(retry_delay(2, unit), Duration::from_millis(2000));
        assert_eq!(retry_delay(3, unit), Duration::from_millis(4000));

        // Non-decreasing across the whole curve
        let mut prev = Duration::ZERO;
        for attempt in 0..20 {
            let d = retry_delay(attempt, unit);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[test]
    fn test_stats_rolling_average() {
        let stats = RequestStats::default();
        stats.record_attempt();
        stats.record_terminal(true, Duration::from_millis(10));
        stats.record_attempt();
        stats.record_terminal(false, Duration::from_millis(30));

        let snap = stats.snapshot();
        assert_eq!(snap.attempts, 2);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 1);
        assert!((snap.avg_latency_ms - 20.0).abs() < 0.01);
    }
}
