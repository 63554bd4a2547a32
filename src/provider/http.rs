use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::state_machine::RetryConfig;

/// JSON-over-HTTP client shared by the concrete providers.
///
/// Retries transport failures (network errors, 408, 429, 5xx) with exponential backoff.
/// Any other 4xx is a terminal [`ProviderError::Rejected`].
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryConfig,
}

impl HttpClient {
    pub fn new(timeout: Duration, retry: RetryConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, retry })
    }

    /// Send the request built by `build`, retrying transient failures.
    pub async fn send_json<T, F>(&self, build: F) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            match self.send_once(&build).await {
                Ok(body) => return Ok(body),
                Err(e) if is_retryable(&e) && self.retry.allows_retry(attempt) => {
                    let delay = match &e {
                        ProviderError::RateLimited { retry_after_ms } => {
                            Duration::from_millis((*retry_after_ms).min(self.retry.max_delay_ms))
                        }
                        _ => self.retry.delay_for_attempt(attempt),
                    };
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "provider request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<T, F>(&self, build: &F) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = build(&self.client).send().await?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "provider response");

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(1000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
                return Err(ProviderError::Api {
                    status: status.as_u16(),
                    message,
                });
            }
            return Err(ProviderError::Rejected(format!("HTTP {}: {message}", status.as_u16())));
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

fn is_retryable(err: &ProviderError) -> bool {
    matches!(
        err,
        ProviderError::RateLimited { .. } | ProviderError::Api { .. } | ProviderError::Network(_)
    )
}
