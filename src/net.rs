//! HTTP fetch with bounded retry, shared by the schedule source and the
//! manifest probe.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::config::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The response is valid but carries no ad-management data.
    #[error("response is not ad-management data")]
    NotApplicable,
}

/// Build the shared client with the configured per-attempt timeout.
pub fn build_client(config: &SessionConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(config.fetch_timeout)
        .build()
        .unwrap_or_default()
}

/// GET `url` and return the response body, retrying transient failures.
///
/// Non-success HTTP statuses are retried like connection errors; the last
/// failure is returned once attempts are exhausted.
pub async fn fetch_text(
    client: &reqwest::Client,
    url: &str,
    config: &SessionConfig,
) -> Result<String, FetchError> {
    let attempts = config.fetch_attempts.max(1);
    let mut last_err = FetchError::Connection("no attempt made".to_string());

    for attempt in 1..=attempts {
        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .text()
                        .await
                        .map_err(|e| FetchError::Connection(e.to_string()));
                }
                warn!(%url, %status, attempt, "fetch returned non-success status");
                last_err = FetchError::Connection(format!("status {status} from {url}"));
            }
            Err(e) if e.is_timeout() => {
                warn!(%url, attempt, "fetch timed out");
                last_err = FetchError::Timeout(url.to_string());
            }
            Err(e) => {
                warn!(%url, attempt, error = %e, "fetch failed");
                last_err = FetchError::Connection(e.to_string());
            }
        }

        if attempt < attempts {
            tokio::time::sleep(backoff_for(config.fetch_backoff, attempt)).await;
        }
    }

    Err(last_err)
}

fn backoff_for(base: Duration, attempt: u32) -> Duration {
    // Linear backoff; the schedule poller already bounds overall frequency.
    base * attempt
}
