//! Rate-limited page fetching with retry classification.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jobscout_core::ParseError;
use reqwest::header::RETRY_AFTER;
pub use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub const CRATE_NAME: &str = "jobscout-http";

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

pub fn classify_transport_error(err: &TransportError) -> RetryDisposition {
    match err {
        TransportError::Timeout | TransportError::Connect(_) => RetryDisposition::Retryable,
        TransportError::Other(_) => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts per unit of work, including the first.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

impl BackoffPolicy {
    /// Delay after the 1-based `attempt` failed. A server hint wins over the
    /// linear schedule; both are capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let delay = match retry_after {
            Some(hint) => hint,
            None => {
                let factor = u32::try_from(attempt.max(1)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub permits: u32,
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            permits: 5,
            period: Duration::from_secs(8),
        }
    }
}

/// Token bucket holding at most `permits` tokens, refilled one at a time
/// every `period / permits`.
///
/// Waiters queue on a FIFO mutex and the head of the queue sleeps while
/// holding it, so tokens are handed out in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.permits.max(1);
        Self {
            capacity,
            refill_every: config.period / capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if self.refill_every.is_zero() {
            state.tokens = self.capacity;
            state.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
        if refills > 0 {
            let refills = u32::try_from(refills).unwrap_or(u32::MAX);
            state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
            state.last_refill += self.refill_every.saturating_mul(refills);
        }
        if state.tokens == self.capacity {
            state.last_refill = now;
        }
    }

    /// Suspends until a token is available, then consumes it.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            self.refill(&mut state, now);
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            let wait = (state.last_refill + self.refill_every).saturating_duration_since(now);
            tokio::time::sleep(wait).await;
        }
    }

    /// Takes a token only if one is free right now and nobody is queued.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };
        self.refill(&mut state, Instant::now());
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// One GET: target URL plus query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    pub params: Vec<(String, String)>,
}

impl PageRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn param_opt(self, key: impl Into<String>, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl FetchedResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            final_url: String::new(),
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            final_url: String::new(),
            retry_after: None,
            body: String::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// The only network capability the scraper depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &PageRequest) -> Result<FetchedResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: &PageRequest) -> Result<FetchedResponse, TransportError> {
        let resp = self
            .client
            .get(&request.url)
            .query(&request.params)
            .send()
            .await?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp.text().await?;

        Ok(FetchedResponse {
            status,
            final_url,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("too many retries ({attempts}) for {url}: {last_failure}")]
    TooManyRetries {
        url: String,
        attempts: usize,
        last_failure: String,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport failure for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("unparseable page {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },
}

impl FetchError {
    /// Retry budget spent on a unit of work. Everything else is fatal.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, FetchError::TooManyRetries { .. })
    }
}

/// Issues requests through a shared limiter and retries transient failures.
#[derive(Clone)]
pub struct PageFetcher {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(transport: Arc<dyn Transport>, limiter: Arc<RateLimiter>, backoff: BackoffPolicy) -> Self {
        Self {
            transport,
            limiter,
            backoff,
        }
    }

    /// Same transport and backoff, different limiter.
    pub fn with_limiter(&self, limiter: Arc<RateLimiter>) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            limiter,
            backoff: self.backoff,
        }
    }

    /// Fetches `request` and hands a 2xx body to `parse`.
    ///
    /// 429, 5xx, timeouts, connect failures and pages missing a required
    /// section are retried. Any other status, transport or parse failure is
    /// returned at once.
    pub async fn fetch<T, F>(&self, request: &PageRequest, parse: F) -> Result<T, FetchError>
    where
        F: Fn(&str) -> Result<T, ParseError> + Send + Sync,
        T: Send,
    {
        let attempts = self.backoff.max_retries.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=attempts {
            self.limiter.acquire().await;
            debug!(url = %request.url, attempt, "requesting page");

            let retry_after = match self.transport.get(request).await {
                Ok(resp) if resp.status.is_success() => match parse(&resp.body) {
                    Ok(value) => return Ok(value),
                    Err(err) if err.is_malformed_page() => {
                        last_failure = err.to_string();
                        None
                    }
                    Err(err) => {
                        error!(url = %request.url, error = %err, "unclassified parse failure");
                        return Err(FetchError::Parse {
                            url: request.url.clone(),
                            source: err,
                        });
                    }
                },
                Ok(resp) => match classify_status(resp.status) {
                    RetryDisposition::Retryable => {
                        last_failure = format!("http status {}", resp.status.as_u16());
                        resp.retry_after
                    }
                    RetryDisposition::NonRetryable => {
                        error!(url = %request.url, status = resp.status.as_u16(), "unexpected http status");
                        return Err(FetchError::HttpStatus {
                            status: resp.status.as_u16(),
                            url: request.url.clone(),
                        });
                    }
                },
                Err(err) => match classify_transport_error(&err) {
                    RetryDisposition::Retryable => {
                        last_failure = err.to_string();
                        None
                    }
                    RetryDisposition::NonRetryable => {
                        error!(url = %request.url, error = %err, "unclassified transport failure");
                        return Err(FetchError::Transport {
                            url: request.url.clone(),
                            source: err,
                        });
                    }
                },
            };

            if attempt == attempts {
                break;
            }

            let delay = self.backoff.delay_for_attempt(attempt, retry_after);
            warn!(
                url = %request.url,
                attempt,
                delay_ms = duration_ms(delay),
                reason = %last_failure,
                "rate limited; backing off"
            );
            tokio::time::sleep(delay).await;
        }

        warn!(url = %request.url, attempts, reason = %last_failure, "retries exhausted");
        Err(FetchError::TooManyRetries {
            url: request.url.clone(),
            attempts,
            last_failure,
        })
    }
}
