//! Outbound HTTP shared by every source adapter: global and per-source permits,
//! an optional request budget, and retries with capped exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// Rate limiting and upstream 5xx are worth another attempt; anything else is final.
pub fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A server-supplied `Retry-After` wins over the computed delay, within `max_delay`.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay(attempt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBudgetConfig {
    pub burst: u32,
    pub refill_every: Duration,
}

/// Token-style request budget. One token refills every `refill_every`, up to `burst`.
#[derive(Debug)]
pub struct RequestBudget {
    config: RequestBudgetConfig,
    state: tokio::sync::Mutex<(u32, Instant)>,
}

impl RequestBudget {
    pub fn new(config: RequestBudgetConfig) -> Self {
        Self {
            config,
            state: tokio::sync::Mutex::new((config.burst, Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        let step = self.config.refill_every;
        loop {
            let wait = {
                let mut guard = self.state.lock().await;
                let (tokens, since) = &mut *guard;
                if !step.is_zero() {
                    let earned = (since.elapsed().as_nanos() / step.as_nanos()) as u32;
                    if earned > 0 {
                        *tokens = tokens.saturating_add(earned).min(self.config.burst);
                        *since += step * earned;
                    }
                }
                if *tokens > 0 || step.is_zero() {
                    *tokens = tokens.saturating_sub(1);
                    return;
                }
                step.saturating_sub(since.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_source: usize,
    pub retry: RetryPolicy,
    pub budget: Option<RequestBudgetConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_source: 2,
            retry: RetryPolicy::default(),
            budget: None,
        }
    }
}

/// One outbound GET, tagged with the source it is made for.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub source: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(source: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Closed => None,
        }
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    budget: Option<RequestBudget>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_source_limit: config.max_in_flight_per_source.max(1),
            per_source: Mutex::new(HashMap::new()),
            budget: config.budget.map(RequestBudget::new),
            retry: config.retry,
        })
    }

    fn source_permits(&self, source: &str) -> Result<Arc<Semaphore>, FetchError> {
        let mut map = self.per_source.lock().map_err(|_| FetchError::Closed)?;
        Ok(map
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone())
    }

    /// GET with retries. A non-success final status is an error.
    pub async fn fetch(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source = %request.source, url = %request.url);
        self.send(request, self.retry.retries).instrument(span).await
    }

    /// One attempt, any status returned as-is. Used by link health checks.
    pub async fn probe(&self, source: &str, url: &str) -> Result<StatusCode, FetchError> {
        let span = info_span!("http_probe", source, url);
        let request = HttpRequest::get(source, url);
        match self.send(&request, 0).instrument(span).await {
            Ok(resp) => Ok(resp.status),
            Err(FetchError::HttpStatus { status, .. }) => {
                Ok(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            }
            Err(err) => Err(err),
        }
    }

    async fn send(&self, request: &HttpRequest, retries: u32) -> Result<FetchedResponse, FetchError> {
        let _global = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let source_permits = self.source_permits(&request.source)?;
        let _source = source_permits.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            if let Some(budget) = &self.budget {
                budget.acquire().await;
            }
            let mut builder = self.client.get(&request.url).query(&request.query);
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }

            let wait = match builder.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if attempt >= retries || !retryable_status(status) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    debug!(attempt, status = status.as_u16(), "retrying after status");
                    self.retry.delay_with_hint(attempt, retry_after(&resp))
                }
                Err(err) => {
                    if attempt >= retries || !retryable_transport(&err) {
                        return Err(FetchError::Request(err));
                    }
                    debug!(attempt, error = %err, "retrying after transport error");
                    self.retry.delay(attempt)
                }
            };
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_until_the_cap() {
        let policy = RetryPolicy {
            retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_hint_overrides_backoff_within_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(120))),
            policy.max_delay
        );
        assert_eq!(policy.delay_with_hint(1, None), policy.delay(1));
    }

    #[test]
    fn only_throttling_and_server_errors_retry() {
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn request_builder_keeps_query_order() {
        let req = HttpRequest::get("ticketmaster", "https://api.example/discovery/v2/events.json")
            .query("city", "Seattle")
            .query("size", 50)
            .header("accept", "application/json");
        assert_eq!(
            req.query,
            vec![
                ("city".to_string(), "Seattle".to_string()),
                ("size".to_string(), "50".to_string())
            ]
        );
        assert_eq!(req.headers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_spends_burst_then_waits_for_refill() {
        let budget = RequestBudget::new(RequestBudgetConfig {
            burst: 2,
            refill_every: Duration::from_secs(10),
        });
        let start = Instant::now();
        budget.acquire().await;
        budget.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        budget.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[test]
    fn fetch_error_exposes_status() {
        let err = FetchError::HttpStatus {
            status: 410,
            url: "https://venue.example/gone".into(),
        };
        assert_eq!(err.status(), Some(410));
        assert_eq!(FetchError::Closed.status(), None);
    }
}
