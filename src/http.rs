//! JSON-over-HTTP calls with retry and exponential backoff.
//!
//! Shared by the embedding and chat providers:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use std::time::Duration;

/// POST `body` to `url` and return the parsed JSON response.
pub async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(%label, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    tracing::warn!(%label, %status, "transient API error");
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        label,
                        status,
                        body_text
                    ));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                tracing::warn!(%label, error = %e, "request failed");
                last_err = Some(anyhow::anyhow!("{} connection error ({}): {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} request failed after retries", label)))
}

/// Build a client with the given request timeout.
pub fn client_with_timeout(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}
