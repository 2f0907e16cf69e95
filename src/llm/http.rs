//! Shared HTTP plumbing for cloud LLM providers.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{AppError, AppResult};

pub struct HttpLlmClient {
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(timeout_s: u64) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|e| AppError::Dependency(format!("failed to build LLM client: {}", e)))?;
        Ok(Self { client })
    }

    /// POST JSON and deserialize, mapping provider failures onto the app's
    /// error kinds (429 → RateLimited with Retry-After, 5xx → retryable
    /// Dependency, timeouts → Timeout).
    pub async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, String)],
    ) -> AppResult<R> {
        debug!(url, "LLM request");
        let mut request = self.client.post(url).json(body);
        for (key, value) in headers {
            request = request.header(*key, value);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_s = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(2);
            return Err(AppError::RateLimited { retry_after_s });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(url, status = status.as_u16(), body = %text, "LLM request failed");
            return Err(if status.is_server_error() {
                AppError::Dependency(format!("provider returned {}: {}", status, text))
            } else {
                AppError::InvalidInput(format!("provider returned {}: {}", status, text))
            });
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Dependency(format!("bad provider response: {}", e)))
    }
}
