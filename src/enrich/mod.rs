//! Document enrichment: augment Solr documents with cached external
//! lookups after the driver has produced its fields.

use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EnrichmentConfig;
use crate::drivers::{push_field, RecordDriver, SolrDoc};
use crate::harvest::{HarvestError, RetryingClient};
use crate::repository::{CachedResponse, RepositoryError, UriCacheRepository};

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("Lookup failed: {0}")]
    Lookup(String),
}

pub type Result<T> = std::result::Result<T, EnrichError>;

/// A document enricher, invoked per document between the driver and the
/// field mapper.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(
        &self,
        source_id: &str,
        driver: &dyn RecordDriver,
        doc: &mut SolrDoc,
    ) -> Result<()>;
}

/// Resolves authority URIs found in `topic_uri` and appends their
/// preferred labels to `topic`. Lookups go through the URI cache; misses
/// fall back to HTTP with the shared retry budget.
pub struct AuthorityEnricher<'a> {
    cache: &'a UriCacheRepository,
    client: RetryingClient,
    cache_max_age: Duration,
}

impl<'a> AuthorityEnricher<'a> {
    pub fn new(
        cache: &'a UriCacheRepository,
        client: RetryingClient,
        config: &EnrichmentConfig,
    ) -> Self {
        Self {
            cache,
            client,
            cache_max_age: Duration::seconds(config.cache_expiration_secs),
        }
    }

    async fn resolve(&self, uri: &str) -> Result<Option<String>> {
        if let Some(cached) = self.cache.get_valid(uri, self.cache_max_age)? {
            debug!("URI cache hit for {uri}");
            return Ok(extract_label(&cached.body));
        }

        let body = match self.client.get_text(uri).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(None),
            Err(HarvestError::Status { status: 404, .. }) => {
                debug!("Authority record {uri} not found");
                return Ok(None);
            }
            Err(e) => return Err(EnrichError::Lookup(e.to_string())),
        };

        // losing the race against a concurrent writer is fine
        self.cache.put(&CachedResponse {
            id: uri.to_string(),
            timestamp: crate::repository::now(),
            url: uri.to_string(),
            headers: String::new(),
            body: body.clone(),
        })?;

        Ok(extract_label(&body))
    }
}

#[async_trait]
impl Enricher for AuthorityEnricher<'_> {
    async fn enrich(
        &self,
        _source_id: &str,
        _driver: &dyn RecordDriver,
        doc: &mut SolrDoc,
    ) -> Result<()> {
        let uris: Vec<String> = match doc.get("topic_uri") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(uri)) => vec![uri.clone()],
            _ => return Ok(()),
        };

        for uri in uris {
            match self.resolve(&uri).await? {
                Some(label) => push_field(doc, "topic", label),
                None => warn!("No label resolved for authority {uri}"),
            }
        }
        Ok(())
    }
}

/// Pull a preferred label out of an authority response body.
fn extract_label(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    for key in ["prefLabel", "label", "name"] {
        if let Some(label) = value.get(key).and_then(Value::as_str) {
            return Some(label.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_label() {
        assert_eq!(
            extract_label(r#"{"prefLabel": "Computer science"}"#).as_deref(),
            Some("Computer science")
        );
        assert_eq!(extract_label(r#"{"label": "CS"}"#).as_deref(), Some("CS"));
        assert!(extract_label("not json").is_none());
        assert!(extract_label(r#"{"other": 1}"#).is_none());
    }
}
