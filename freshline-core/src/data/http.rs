//! Blocking HTTP client shared by the upstream fetchers.
//!
//! Wraps `reqwest::blocking` with timeouts, exponential backoff and the
//! circuit breaker. Status mapping:
//! - 403 trips the breaker and returns `CircuitOpen`
//! - 401 is `Fatal` (bad credentials abort the run)
//! - 429, 5xx, connect and timeout errors are retried, then `Transient` /
//!   `RateLimited`
//! - other 4xx and unparsable bodies are `DataShape`

use super::circuit_breaker::CircuitBreaker;
use crate::error::FetchError;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            user_agent: concat!("freshline/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

pub struct RetryingClient {
    client: Client,
    breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryingClient {
    pub fn new(settings: &HttpSettings, breaker: Arc<CircuitBreaker>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Fatal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            breaker,
            max_retries: settings.max_retries,
            base_delay: settings.base_delay,
        })
    }

    pub fn is_available(&self) -> bool {
        self.breaker.is_allowed()
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        self.send_with_retry(url, || self.client.get(url).query(query))
    }

    pub fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, FetchError> {
        self.send_with_retry(url, || self.client.post(url).json(body))
    }

    fn send_with_retry<T, F>(&self, url: &str, build: F) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.base_delay * 2u32.saturating_pow(attempt - 1));
            }
            if !self.breaker.is_allowed() {
                return Err(FetchError::CircuitOpen);
            }

            debug!(url, attempt, "sending request");
            let resp = match build().send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.breaker.record_failure();
                    last_error = Some(FetchError::Transient(e.to_string()));
                    continue;
                }
                Err(e) => return Err(FetchError::Transient(e.to_string())),
            };

            let status = resp.status();
            if status == StatusCode::FORBIDDEN {
                self.breaker.trip();
                return Err(FetchError::CircuitOpen);
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(FetchError::Fatal(format!(
                    "{url}: credentials rejected (HTTP 401)"
                )));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                self.breaker.record_failure();
                let retry_after_secs = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                last_error = Some(FetchError::RateLimited { retry_after_secs });
                continue;
            }
            if status.is_server_error() {
                self.breaker.record_failure();
                last_error = Some(FetchError::Transient(format!("HTTP {status} from {url}")));
                continue;
            }
            if !status.is_success() {
                return Err(FetchError::DataShape(format!("HTTP {status} from {url}")));
            }

            let body = resp
                .json::<T>()
                .map_err(|e| FetchError::DataShape(format!("unparsable response from {url}: {e}")))?;
            self.breaker.record_success();
            return Ok(body);
        }

        Err(last_error.unwrap_or_else(|| FetchError::Transient("max retries exceeded".into())))
    }
}
