//! Retrying HTTP fetch shared by the harvesters, the Solr client and the
//! enrichment lookups.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::{HarvestError, Result};
use crate::config::HttpConfig;

/// Longest backoff between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// HTTP client with an exponential-backoff retry budget.
#[derive(Clone)]
pub struct RetryingClient {
    client: Client,
    max_tries: u32,
    retry_wait: Duration,
    ignore_statuses: Vec<u16>,
}

impl RetryingClient {
    /// Create a client from the shared HTTP config.
    pub fn new(config: &HttpConfig, ignore_statuses: Vec<u16>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("bibfuse/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()
            .map_err(HarvestError::Network)?;
        Ok(Self {
            client,
            max_tries: config.max_tries.max(1),
            retry_wait: Duration::from_secs(config.retry_wait_secs),
            ignore_statuses,
        })
    }

    /// GET a URL, retrying transient failures. Returns `None` when the
    /// response status is on the source's ignore list.
    pub async fn get_text(&self, url: &str) -> Result<Option<String>> {
        let mut wait = self.retry_wait;
        let mut last_error: Option<HarvestError> = None;

        for attempt in 1..=self.max_tries {
            if attempt > 1 {
                debug!("Retrying {url} in {wait:?} (attempt {attempt}/{})", self.max_tries);
                tokio::time::sleep(wait).await;
                wait = (wait * 2).min(MAX_BACKOFF);
            }

            let response = match self.client.get(url).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Request to {url} failed: {e}");
                    last_error = Some(HarvestError::Network(e));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let body = response.text().await.map_err(HarvestError::Network)?;
                return Ok(Some(body));
            }
            if self.ignore_statuses.contains(&status.as_u16()) {
                warn!("Ignoring HTTP {status} from {url}");
                return Ok(None);
            }
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::NOT_FOUND {
                return Err(HarvestError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            warn!("HTTP {status} from {url}");
            last_error = Some(HarvestError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Err(last_error.unwrap_or(HarvestError::Status {
            status: 0,
            body: "retry budget exhausted".to_string(),
        }))
    }
}
