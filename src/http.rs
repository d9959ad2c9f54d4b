use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use tokio::time::sleep;
use url::Url;

use crate::config::HarvestConfig;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out")]
    Timeout,
    #[error("unable to read body: {0}")]
    Body(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("{url}: non-success status {status}")]
    Status { url: String, status: u16 },
}

/// One GET against the network. Never retries.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url, query: &[(&str, &str)]) -> Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &Url, query: &[(&str, &str)]) -> Result<HttpResponse, TransportError> {
        let mut request = self.client.get(url.clone());
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Request(err.to_string())
                }
            })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| TransportError::Body(err.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Extra pause after a 429 or 503 before the usual backoff.
    pub throttle_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(4),
            throttle_pause: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            attempts: config.fetch_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            throttle_pause: Duration::from_millis(config.throttle_pause_ms),
        }
    }

    /// Wait after the `attempt`-th failure (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .max(self.backoff_base)
            .min(self.backoff_cap)
    }
}

/// GET with retries. Transport failures and error statuses are both retried
/// until the attempt budget runs out; the last failure is returned.
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn from_config(config: &HarvestConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(
            &config.user_agent,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self::new(Arc::new(transport), RetryPolicy::from_config(config)))
    }

    pub async fn get_text(&self, url: &Url) -> Result<String, FetchError> {
        self.get(url, &[]).await.map(|response| response.body)
    }

    pub async fn get(&self, url: &Url, query: &[(&str, &str)]) -> Result<HttpResponse, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.transport.get(url, query).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => {
                    if matches!(response.status, 429 | 503) {
                        sleep(self.policy.throttle_pause).await;
                    }
                    FetchError::Status {
                        url: url.to_string(),
                        status: response.status,
                    }
                }
                Err(source) => FetchError::Transport {
                    url: url.to_string(),
                    source,
                },
            };

            if attempt >= self.policy.attempts {
                return Err(failure);
            }
            let wait = self.policy.backoff(attempt);
            tracing::debug!(%url, attempt, ?wait, error = %failure, "retrying fetch");
            sleep(wait).await;
        }
    }
}
