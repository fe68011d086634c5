//! HTTP request executor with rate limiting and retry logic.

use super::rate_limiter::Limiter;
use super::types::{HttpResponse, Request};
use crate::error::{Result, ScraperError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Client, StatusCode};
use shared::RequestConfig;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Statuses worth another attempt
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Longest upstream body kept in an error
const MAX_ERROR_BODY: usize = 512;

/// Client settings for one executor
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Base delay for retry (exponential backoff)
    pub retry_delay: Duration,
    /// Sent with every request on top of the built-in defaults
    pub headers: Vec<(String, String)>,
}

impl From<&RequestConfig> for ExecutorSettings {
    fn from(config: &RequestConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout: config.timeout(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            headers: Vec::new(),
        }
    }
}

/// Why a single attempt failed
enum Failure {
    Transport(reqwest::Error),
    Status { status: StatusCode, body: String },
}

impl Failure {
    fn is_retryable(&self) -> bool {
        match self {
            Failure::Transport(e) => !e.is_builder(),
            Failure::Status { status, .. } => RETRYABLE_STATUSES.contains(&status.as_u16()),
        }
    }

    fn into_error(self, url: &str) -> ScraperError {
        match self {
            Failure::Transport(source) => ScraperError::Transport {
                url: url.to_string(),
                source,
            },
            Failure::Status { status, .. } if status == StatusCode::TOO_MANY_REQUESTS => {
                ScraperError::RateLimited {
                    url: url.to_string(),
                }
            }
            Failure::Status { status, body } => ScraperError::Upstream {
                url: url.to_string(),
                status,
                body,
            },
        }
    }
}

/// Retrying request layer that consults a rate limiter before every attempt.
///
/// Performs no caching. Every attempt waits on the limiter; the final outcome
/// of each call is reported to it once, which only an adaptive limiter acts on.
pub struct RequestExecutor {
    /// Instance label used in logs and errors
    name: String,
    /// `None` once closed
    client: RwLock<Option<Client>>,
    limiter: Option<Arc<Limiter>>,
    max_retries: u32,
    retry_delay: Duration,
}

impl RequestExecutor {
    /// Create a new executor
    pub fn new(
        name: impl Into<String>,
        settings: ExecutorSettings,
        limiter: Option<Arc<Limiter>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.as_str())
            .default_headers(default_headers(&settings.headers)?)
            .build()
            .map_err(|e| ScraperError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            client: RwLock::new(Some(client)),
            limiter,
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay,
        })
    }

    pub fn limiter(&self) -> Option<&Arc<Limiter>> {
        self.limiter.as_ref()
    }

    fn client(&self) -> Result<Client> {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| ScraperError::InstanceClosed(self.name.clone()))
    }

    /// Run a request, retrying transport failures and retryable statuses.
    pub async fn execute(&self, request: &Request) -> Result<HttpResponse> {
        let client = self.client()?;
        let url = request.url.as_str();
        let mut attempt = 0;

        loop {
            if let Some(limiter) = &self.limiter {
                let waited = limiter.wait_if_needed().await;
                if !waited.is_zero() {
                    debug!(url = %url, waited_ms = waited.as_millis() as u64, "Rate limiter delayed request");
                }
            }

            debug!(url = %url, method = %request.method, attempt = attempt + 1, "Making request");

            let failure = match self.send(&client, request).await {
                Ok(response) => {
                    self.report(true);
                    debug!(url = %url, status = %response.status, "Request successful");
                    return Ok(response);
                }
                Err(failure) => failure,
            };

            if !failure.is_retryable() || attempt >= self.max_retries {
                // One report per call, however many attempts it took
                self.report(false);
                let error = failure.into_error(url);
                warn!(url = %url, attempts = attempt + 1, error = %error, "Request failed");
                return Err(error);
            }

            let delay = self.backoff(attempt);
            match &failure {
                Failure::Transport(e) => {
                    warn!(url = %url, error = %e, delay_ms = delay.as_millis() as u64, "Request error, retrying")
                }
                Failure::Status { status, .. } => {
                    warn!(url = %url, status = %status, delay_ms = delay.as_millis() as u64, "Retryable status, retrying")
                }
            }
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send(&self, client: &Client, request: &Request) -> std::result::Result<HttpResponse, Failure> {
        let mut builder = client
            .request(request.method.clone(), &request.url)
            .query(&request.query);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(Failure::Transport)?;
        let status = response.status();

        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate(&mut body, MAX_ERROR_BODY);
            return Err(Failure::Status { status, body });
        }

        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(Failure::Transport)?;

        Ok(HttpResponse {
            status,
            url: final_url,
            headers,
            body: body.to_vec(),
        })
    }

    fn report(&self, success: bool) {
        if let Some(limiter) = &self.limiter {
            if success {
                limiter.report_success();
            } else {
                limiter.report_error();
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(1u32 << attempt.min(10))
    }

    /// Drop the HTTP client and its connection pool.
    ///
    /// Returns false if the executor was already closed.
    pub fn close(&self) -> bool {
        let closed = self
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some();
        if closed {
            debug!(instance = %self.name, "HTTP client closed");
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

fn default_headers(extra: &[(String, String)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ScraperError::InvalidRequest(format!("Invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ScraperError::InvalidRequest(format!("Invalid header value for {}: {}", name, e)))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

fn truncate(text: &mut String, max: usize) {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
}
