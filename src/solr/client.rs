//! Solr JSON-over-HTTP update client.

use base64::Engine;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Result, SolrError};
use crate::config::{HttpConfig, SolrConfig};
use crate::drivers::SolrDoc;

/// Longest backoff between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Client for the Solr update endpoint.
pub struct SolrClient {
    client: Client,
    update_url: String,
    select_url: String,
    auth_header: Option<String>,
    max_tries: u32,
    retry_wait: Duration,
}

impl SolrClient {
    pub fn new(config: &SolrConfig, http: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("bibfuse/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(http.timeout_secs))
            .gzip(true)
            .build()
            .map_err(SolrError::Network)?;

        let auth_header = match (&config.username, &config.password) {
            (Some(user), password) => {
                let credentials = format!("{}:{}", user, password.as_deref().unwrap_or(""));
                Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(credentials)
                ))
            }
            _ => None,
        };

        // the select handler lives next to the update handler
        let select_url = config
            .update_url
            .trim_end_matches('/')
            .trim_end_matches("/update/json")
            .trim_end_matches("/update")
            .to_string()
            + "/select";

        Ok(Self {
            client,
            update_url: config.update_url.clone(),
            select_url,
            auth_header,
            max_tries: http.max_tries.max(1),
            retry_wait: Duration::from_secs(http.retry_wait_secs),
        })
    }

    /// POST a JSON body to the update endpoint. Non-2xx is a hard failure
    /// carrying the response body.
    async fn post_update(&self, body: String) -> Result<()> {
        let mut wait = self.retry_wait;
        let mut last_error: Option<SolrError> = None;

        for attempt in 1..=self.max_tries {
            if attempt > 1 {
                debug!("Retrying Solr POST in {wait:?} (attempt {attempt}/{})", self.max_tries);
                tokio::time::sleep(wait).await;
                wait = (wait * 2).min(MAX_BACKOFF);
            }

            let mut request = self
                .client
                .post(&self.update_url)
                .header("Content-Type", "application/json")
                .body(body.clone());
            if let Some(auth) = &self.auth_header {
                request = request.header("Authorization", auth.clone());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Solr POST failed: {e}");
                    last_error = Some(SolrError::Network(e));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 {
                return Err(SolrError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            warn!("Solr returned HTTP {status}");
            last_error = Some(SolrError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Err(last_error.unwrap_or(SolrError::Status {
            status: 0,
            body: "retry budget exhausted".to_string(),
        }))
    }

    /// Add a batch of documents.
    pub async fn add(&self, docs: &[SolrDoc]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_string(docs)?;
        self.post_update(body).await
    }

    /// Delete one document by id.
    pub async fn delete_id(&self, id: &str) -> Result<()> {
        let body = serde_json::json!({"delete": {"id": id}}).to_string();
        self.post_update(body).await
    }

    /// Delete by query.
    pub async fn delete_query(&self, query: &str) -> Result<()> {
        let body = serde_json::json!({"delete": {"query": query}}).to_string();
        self.post_update(body).await
    }

    /// Issue an explicit commit.
    pub async fn commit(&self) -> Result<()> {
        self.post_update(r#"{"commit":{}}"#.to_string()).await
    }

    /// Issue an optimize.
    pub async fn optimize(&self) -> Result<()> {
        self.post_update(r#"{"optimize":{}}"#.to_string()).await
    }

    /// Fetch a live document by id, for compare mode.
    pub async fn fetch_document(&self, id: &str) -> Result<Option<Value>> {
        let escaped = id.replace('"', "\\\"");
        let url = format!("{}?q=id:\"{}\"&wt=json", self.select_url, escaped);

        let mut request = self.client.get(&url);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth.clone());
        }
        let response = request.send().await.map_err(SolrError::Network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SolrError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: Value = response.json().await.map_err(SolrError::Network)?;
        Ok(body
            .pointer("/response/docs/0")
            .cloned())
    }
}
