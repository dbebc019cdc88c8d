//! Rate-paced, retrying HTTP plumbing shared by the source and destination
//! clients.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub const CRATE_NAME: &str = "samsync-http";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_fetch_error(err: &FetchError) -> RetryDisposition {
    match err {
        FetchError::Request(err) => classify_reqwest_error(err),
        FetchError::HttpStatus { status, .. } => {
            if *status >= 500 || *status == 429 {
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// Bounded-retry policy shared by every component making an external call.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Exponential (doubling) delay for the given zero-based attempt,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` up to `max_retries + 1` times, sleeping the policy delay between
/// attempts that fail with a retryable error.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &BackoffPolicy,
    classify: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDisposition,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries
                    || classify(&err) == RetryDisposition::NonRetryable
                {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Enforces a minimum interval between consecutive requests to one vendor.
///
/// The mutex is held across the sleep so concurrent callers are serialized
/// against the same clock.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum inter-request interval; `None` disables pacing.
    pub min_request_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            min_request_interval: None,
        }
    }
}

/// Thin wrapper over `reqwest` that applies the pacer and retry policy to
/// every call.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    pacer: Option<Arc<Pacer>>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let pacer = config
            .min_request_interval
            .map(|interval| Arc::new(Pacer::new(interval)));

        Ok(Self {
            client,
            backoff: config.backoff,
            pacer,
        })
    }

    async fn execute(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, FetchError> {
        retry_with_backoff(&self.backoff, classify_fetch_error, |_attempt| {
            let request = build();
            let pacer = self.pacer.clone();
            async move {
                if let Some(pacer) = &pacer {
                    pacer.wait().await;
                }
                let response = request.send().await?;
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: response.url().to_string(),
                })
            }
        })
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        let response = self
            .execute(|| {
                let mut request = self.client.get(url).query(query);
                if let Some(token) = bearer {
                    request = request.bearer_auth(token);
                }
                request
            })
            .await?;
        Ok(response.json().await?)
    }

    pub async fn get_bytes(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        let response = self
            .execute(|| {
                let mut request = self.client.get(url);
                if let Some(token) = bearer {
                    request = request.bearer_auth(token);
                }
                request
            })
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        let response = self
            .execute(|| {
                let mut request = self.client.post(url).json(body);
                if let Some(token) = bearer {
                    request = request.bearer_auth(token);
                }
                request
            })
            .await?;
        Ok(response.json().await?)
    }

    pub async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let response = self.execute(|| self.client.post(url).form(form)).await?;
        Ok(response.json().await?)
    }

    pub async fn post_bytes(
        &self,
        url: &str,
        content: &[u8],
        content_type: &str,
        accept: Option<&str>,
        bearer: &str,
    ) -> Result<(), FetchError> {
        self.execute(|| {
            let mut request = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(content.to_vec())
                .bearer_auth(bearer);
            if let Some(accept) = accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            request
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_delays_are_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn backoff_delays_strictly_increase_below_the_cap() {
        let policy = BackoffPolicy::default();
        for attempt in 0..3 {
            assert!(policy.delay_for_attempt(attempt + 1) > policy.delay_for_attempt(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_rate_limit_responses() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        };
        let attempts = AtomicUsize::new(0);
        let failures = 3usize;

        let result: Result<&str, &str> =
            retry_with_backoff(&policy, |_: &&str| RetryDisposition::Retryable, |_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < failures {
                        Err("rate limited")
                    } else {
                        Ok("page")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("page"));
        assert_eq!(attempts.load(Ordering::SeqCst), failures + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_bounded_attempts() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        };
        let attempts = AtomicUsize::new(0);

        let result: Result<(), &str> =
            retry_with_backoff(&policy, |_: &&str| RetryDisposition::Retryable, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("rate limited") }
            })
            .await;

        assert_eq!(result, Err("rate limited"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_fast() {
        let policy = BackoffPolicy::default();
        let attempts = AtomicUsize::new(0);

        let result: Result<(), &str> =
            retry_with_backoff(&policy, |_: &&str| RetryDisposition::NonRetryable, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("bad request") }
            })
            .await;

        assert_eq!(result, Err("bad request"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_enforces_minimum_interval() {
        let pacer = Pacer::new(Duration::from_millis(110));

        let start = Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;

        assert!(start.elapsed() >= Duration::from_millis(220));
    }

    #[test]
    fn rate_limit_status_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
    }
}
