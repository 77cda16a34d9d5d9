//! Harvester state machine: incremental fetching with resumption and
//! deletion reconciliation, one instance per source.

mod http;
mod metalib;
pub mod oai;
mod sierra;

pub use http::RetryingClient;
pub use metalib::{reconcile_full_set, FullSetOutcome};

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, DataSourceConfig, DeletionMode, HttpConfig, SourceType};
use crate::ingest::{IngestError, Ingestor, RecordSplitter, XmlChildrenSplitter};
use crate::models::{
    last_deletion_key, last_harvest_date_key, resumption_token_key, RecordFilter,
};
use crate::repository::{RecordRepository, RepositoryError, StateRepository};

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Response parse failure: {0}")]
    Parse(String),
    #[error("Resumption token expired: {0}")]
    TokenExpired(String),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Terminated by signal")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, HarvestError>;

/// Options for one harvest run.
#[derive(Debug, Default, Clone)]
pub struct HarvestOptions {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Resume an interrupted run from an explicit token.
    pub resumption: Option<String>,
    /// Full reharvest; the inner value overrides the window start.
    pub reharvest: Option<Option<DateTime<Utc>>>,
}

/// Outcome counters for one harvest run.
#[derive(Debug, Default, Clone)]
pub struct HarvestStats {
    pub harvested: u64,
    pub deleted: u64,
    pub skipped: u64,
}

const OAI_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Incremental harvester for one data source.
pub struct Harvester<'a> {
    source: &'a DataSourceConfig,
    records: &'a RecordRepository,
    state: &'a StateRepository,
    ingestor: &'a Ingestor<'a>,
    client: RetryingClient,
    terminated: Arc<AtomicBool>,
}

impl<'a> Harvester<'a> {
    pub fn new(
        source: &'a DataSourceConfig,
        http: &HttpConfig,
        records: &'a RecordRepository,
        state: &'a StateRepository,
        ingestor: &'a Ingestor<'a>,
        terminated: Arc<AtomicBool>,
    ) -> Result<Self> {
        let client = RetryingClient::new(http, source.ignore_http_errors.clone())?;
        Ok(Self {
            source,
            records,
            state,
            ingestor,
            client,
            terminated,
        })
    }

    /// Run one harvest for this source.
    pub async fn harvest(&self, opts: &HarvestOptions) -> Result<HarvestStats> {
        info!(
            "Harvesting {} ({})",
            self.source.id,
            self.source.source_type.as_str()
        );
        match self.source.source_type {
            SourceType::OaiPmh => self.harvest_oai(opts).await,
            SourceType::Sierra => self.harvest_sierra(opts).await,
            SourceType::Sfx => self.harvest_sfx().await,
            SourceType::Metalib | SourceType::MetalibExport => self.harvest_metalib().await,
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.terminated.load(Ordering::Relaxed) {
            Err(HarvestError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn safety_offset(&self) -> Duration {
        Duration::seconds(self.source.harvest_offset_secs.unwrap_or(0))
    }

    /// Feed one harvested item to ingestion. Per-record failures are
    /// logged and skipped; the pass continues.
    fn ingest(&self, oai_id: &str, deleted: bool, payload: &str, stats: &mut HarvestStats) -> Result<()> {
        match self.ingestor.store_record(oai_id, deleted, payload) {
            Ok(count) => {
                if deleted {
                    stats.deleted += count;
                } else {
                    stats.harvested += count;
                }
            }
            Err(IngestError::Driver(e)) => {
                warn!("Skipping {oai_id}: {e}");
                stats.skipped += 1;
            }
            Err(IngestError::EmptyId) => {
                warn!("Skipping payload without any identifier (oai_id '{oai_id}')");
                stats.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn harvest_oai(&self, opts: &HarvestOptions) -> Result<HarvestStats> {
        let token_key = resumption_token_key(&self.source.id);
        let harvest_key = last_harvest_date_key(&self.source.id);
        let now = Utc::now();
        let reharvest_threshold = now;

        let from = if let Some(override_from) = &opts.reharvest {
            *override_from
        } else {
            match opts.from {
                Some(from) => Some(from),
                None => self
                    .state
                    .get_datetime(&harvest_key)?
                    .map(|dt| dt - self.safety_offset()),
            }
        };
        let until = opts.until.unwrap_or(now - self.safety_offset());

        let mut token = match &opts.resumption {
            Some(token) => Some(token.clone()),
            None => self.state.get(&token_key)?,
        };
        if token.is_some() {
            info!("Resuming {} from stored token", self.source.id);
        }

        let metadata_prefix = self.source.metadata_prefix.as_deref().unwrap_or("oai_dc");
        let from_str = from.map(|dt| dt.format(OAI_DATE_FORMAT).to_string());
        let until_str = until.format(OAI_DATE_FORMAT).to_string();

        let mut stats = HarvestStats::default();
        loop {
            let url = oai::build_request(
                &self.source.url,
                "ListRecords",
                metadata_prefix,
                self.source.set.as_deref(),
                from_str.as_deref(),
                Some(&until_str),
                token.as_deref(),
            )?;
            let Some(body) = self.client.get_text(&url).await? else {
                break;
            };
            let page = match oai::parse_response(&body) {
                Err(HarvestError::TokenExpired(message)) => {
                    // not retryable; the operator restarts the window
                    self.state.remove(&token_key)?;
                    return Err(HarvestError::TokenExpired(message));
                }
                other => other?,
            };

            for record in &page.records {
                if self.terminated.load(Ordering::Relaxed) {
                    if let Some(token) = &token {
                        self.state.set(&token_key, token)?;
                    }
                    return Err(HarvestError::Cancelled);
                }
                self.ingest(
                    &record.header.identifier,
                    record.header.deleted,
                    &record.payload,
                    &mut stats,
                )?;
            }

            match page.resumption_token {
                Some(next) => {
                    self.state.set(&token_key, &next)?;
                    token = Some(next);
                }
                None => break,
            }
        }

        self.state.remove(&token_key)?;

        if opts.reharvest.is_some() {
            self.reharvest_deletion_sweep(reharvest_threshold, &stats)?;
        } else {
            self.list_identifiers_sweep(metadata_prefix).await?;
        }

        self.state.set_datetime(&harvest_key, &until)?;
        info!(
            "Harvest of {} done: {} records, {} deletions, {} skipped",
            self.source.id, stats.harvested, stats.deleted, stats.skipped
        );
        Ok(stats)
    }

    /// Full-reharvest deletion sweep: anything the reharvest did not touch
    /// is gone upstream. A zero-record harvest skips the sweep as a likely
    /// upstream error.
    fn reharvest_deletion_sweep(&self, threshold: DateTime<Utc>, stats: &HarvestStats) -> Result<()> {
        if stats.harvested == 0 {
            warn!(
                "Reharvest of {} returned no records; skipping deletion sweep",
                self.source.id
            );
            return Ok(());
        }
        let stale = self.records.find(&RecordFilter {
            source_id: Some(self.source.id.clone()),
            deleted: Some(false),
            updated_before: Some(threshold),
            ..Default::default()
        })?;
        for record in stale {
            debug!("Deleting {} (missing from reharvest)", record.id);
            self.ingestor.tombstone(record)?;
        }
        Ok(())
    }

    /// `ListIdentifiers` mark/sweep reconciliation, rate-limited by the
    /// configured minimum interval.
    async fn list_identifiers_sweep(&self, metadata_prefix: &str) -> Result<()> {
        let Some(DeletionMode::ListIdentifiers { min_interval_days }) =
            self.source.deletion_mode()?
        else {
            return Ok(());
        };

        let deletion_key = last_deletion_key(&self.source.id);
        let now = Utc::now();
        if let Some(last) = self.state.get_datetime(&deletion_key)? {
            if last + Duration::days(min_interval_days as i64) > now {
                debug!(
                    "Deletion sweep of {} not due yet (last {})",
                    self.source.id, last
                );
                return Ok(());
            }
        }
        info!("Running ListIdentifiers deletion sweep for {}", self.source.id);

        self.records.clear_marks(&self.source.id)?;

        let mut token: Option<String> = None;
        loop {
            self.check_cancel()?;
            let url = oai::build_request(
                &self.source.url,
                "ListIdentifiers",
                metadata_prefix,
                self.source.set.as_deref(),
                None,
                None,
                token.as_deref(),
            )?;
            let Some(body) = self.client.get_text(&url).await? else {
                return Ok(());
            };
            let page = oai::parse_response(&body)?;
            for header in &page.headers {
                if header.deleted {
                    self.ingestor.store_record(&header.identifier, true, "")?;
                } else {
                    self.records.mark_by_oai_id(&self.source.id, &header.identifier)?;
                }
            }
            match page.resumption_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let unmarked = self.records.find(&RecordFilter {
            source_id: Some(self.source.id.clone()),
            deleted: Some(false),
            mark: Some(false),
            ..Default::default()
        })?;
        let mut swept = 0;
        for record in unmarked {
            // records without an OAI id never get marked; leave them alone
            if record.oai_id.is_empty() {
                continue;
            }
            debug!("Deleting {} (not listed upstream)", record.id);
            self.ingestor.tombstone(record)?;
            swept += 1;
        }
        info!("Deletion sweep of {} removed {} records", self.source.id, swept);

        self.state.set_datetime(&deletion_key, &now)?;
        Ok(())
    }

    async fn harvest_sierra(&self, opts: &HarvestOptions) -> Result<HarvestStats> {
        let harvest_key = last_harvest_date_key(&self.source.id);
        let now = Utc::now();
        let from = match opts.from {
            Some(from) => Some(from),
            None => self
                .state
                .get_datetime(&harvest_key)?
                .map(|dt| dt - self.safety_offset()),
        };
        let until = opts.until.unwrap_or(now - self.safety_offset());

        let mut stats = HarvestStats::default();
        let mut offset = 0u64;
        loop {
            self.check_cancel()?;
            let url = sierra::build_request(&self.source.url, offset, sierra::PAGE_SIZE, from, until)?;
            let Some(body) = self.client.get_text(&url).await? else {
                break;
            };
            let entries = sierra::parse_response(&body)?;
            let page_len = entries.len() as u64;
            for entry in entries {
                self.check_cancel()?;
                self.ingest(&entry.id, entry.deleted, &entry.payload, &mut stats)?;
            }
            if page_len < sierra::PAGE_SIZE {
                break;
            }
            offset += page_len;
        }

        self.state.set_datetime(&harvest_key, &until)?;
        info!(
            "Harvest of {} done: {} records, {} deletions",
            self.source.id, stats.harvested, stats.deleted
        );
        Ok(stats)
    }

    /// SFX export dump: a full fetch with threshold-based deletion sweep.
    async fn harvest_sfx(&self) -> Result<HarvestStats> {
        let threshold = Utc::now();
        let Some(body) = self.client.get_text(&self.source.url).await? else {
            return Ok(HarvestStats::default());
        };

        let mut stats = HarvestStats::default();
        for payload in XmlChildrenSplitter
            .split(&body)
            .map_err(|e| HarvestError::Parse(e.to_string()))?
        {
            self.check_cancel()?;
            self.ingest("", false, &payload, &mut stats)?;
        }

        self.reharvest_deletion_sweep(threshold, &stats)?;
        let swept = self.records.count(&RecordFilter {
            source_id: Some(self.source.id.clone()),
            deleted: Some(true),
            updated_since: Some(threshold),
            ..Default::default()
        })?;
        stats.deleted += swept;

        self.state
            .set_datetime(&last_harvest_date_key(&self.source.id), &threshold)?;
        Ok(stats)
    }

    /// MetaLib full-set diff harvest, from the endpoint or an export file.
    async fn harvest_metalib(&self) -> Result<HarvestStats> {
        let body = match self.source.source_type {
            SourceType::MetalibExport => {
                std::fs::read_to_string(&self.source.url).map_err(|e| HarvestError::Io {
                    path: self.source.url.clone(),
                    source: e,
                })?
            }
            _ => match self.client.get_text(&self.source.url).await? {
                Some(body) => body,
                None => return Ok(HarvestStats::default()),
            },
        };

        let payloads = XmlChildrenSplitter
            .split(&body)
            .map_err(|e| HarvestError::Parse(e.to_string()))?;

        let outcome = reconcile_full_set(
            self.source,
            self.records,
            self.ingestor,
            &payloads,
            &self.terminated,
        )?;
        info!(
            "Full-set harvest of {}: {} added, {} changed, {} unchanged, {} deleted",
            self.source.id, outcome.added, outcome.changed, outcome.unchanged, outcome.deleted
        );

        self.state
            .set_datetime(&last_harvest_date_key(&self.source.id), &Utc::now())?;
        Ok(HarvestStats {
            harvested: outcome.added + outcome.changed,
            deleted: outcome.deleted,
            skipped: 0,
        })
    }
}
