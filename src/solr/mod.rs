//! Merge & Solr update pipeline: change-driven, batched, restartable
//! delivery of merged and per-record documents.

mod client;
mod merge;

pub use client::SolrClient;
pub use merge::{drop_empty_values, explode_building_hierarchy, merge_documents};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ComponentPartsPolicy, ConfigError, Settings};
use crate::drivers::{self, RecordDriver, SolrDoc};
use crate::enrich::Enricher;
use crate::mapper::FieldMapper;
use crate::models::{last_index_update_key, Record, RecordFilter};
use crate::repository::{
    DedupRepository, QueueRepository, RecordRepository, RepositoryError, StateRepository,
};

#[derive(Error, Debug)]
pub enum SolrError {
    #[error("HTTP request failed: {0}")]
    Network(reqwest::Error),
    #[error("Solr returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Cannot write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Terminated by signal")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SolrError>;

/// Options for one update run.
#[derive(Debug, Default, Clone)]
pub struct UpdateOptions {
    pub from: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub single: Option<String>,
    pub no_commit: bool,
    /// Diff against the live index into this file instead of posting.
    pub compare: Option<PathBuf>,
    /// Write batches to files with this prefix instead of posting.
    pub dump_prefix: Option<String>,
}

impl UpdateOptions {
    fn offline(&self) -> bool {
        self.compare.is_some() || self.dump_prefix.is_some()
    }
}

/// Outcome counters for one update run.
#[derive(Debug, Default, Clone)]
pub struct UpdateStats {
    pub updated: u64,
    pub deleted: u64,
    pub batches: u64,
}

/// The Solr update pipeline.
pub struct SolrUpdater<'a> {
    settings: &'a Settings,
    records: &'a RecordRepository,
    groups: &'a DedupRepository,
    queues: &'a QueueRepository,
    state: &'a StateRepository,
    mapper: &'a FieldMapper,
    enrichers: Vec<Box<dyn Enricher + 'a>>,
    client: SolrClient,
    terminated: Arc<AtomicBool>,
}

impl<'a> SolrUpdater<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &'a Settings,
        records: &'a RecordRepository,
        groups: &'a DedupRepository,
        queues: &'a QueueRepository,
        state: &'a StateRepository,
        mapper: &'a FieldMapper,
        enrichers: Vec<Box<dyn Enricher + 'a>>,
        terminated: Arc<AtomicBool>,
    ) -> Result<Self> {
        let client = SolrClient::new(&settings.solr, &settings.http)?;
        Ok(Self {
            settings,
            records,
            groups,
            queues,
            state,
            mapper,
            enrichers,
            client,
            terminated,
        })
    }

    /// Run the update pipeline.
    pub async fn update(&self, opts: &UpdateOptions) -> Result<UpdateStats> {
        let index_key = last_index_update_key(opts.source.as_deref().unwrap_or(""));
        let from = match opts.from {
            Some(from) => from,
            None => self
                .state
                .get_datetime(&index_key)?
                .unwrap_or(DateTime::UNIX_EPOCH),
        };
        let checkpoint = crate::repository::now();
        let last_record_time = self
            .records
            .newest_updated()?
            .unwrap_or(DateTime::UNIX_EPOCH);

        let hash = self.param_hash(&from, opts);
        let from_unix = from.timestamp();
        let last_unix = last_record_time.timestamp();

        let queue = match self.queues.find_finalized(&hash, from_unix, last_unix)? {
            Some(queue) => {
                info!("Reusing finalized queue {queue}");
                queue
            }
            None => self.build_queue(&hash, &from, from_unix, last_unix, opts)?,
        };
        self.queues.cleanup_old(last_unix)?;

        let total = self.queues.count(&queue)?;
        info!("Processing {total} queue entries (from {from})");

        let mut ids = Vec::with_capacity(total as usize);
        self.queues.iterate(&queue, |id| {
            ids.push(id);
            Ok(true)
        })?;

        let mut stats = UpdateStats::default();
        let mut buffer = UpdateBuffer::new(
            self.settings.solr.max_update_records,
            self.settings.solr.max_update_size,
        );
        let mut since_commit = 0usize;

        for id in ids {
            if self.terminated.load(Ordering::Relaxed) {
                self.flush(&mut buffer, opts, &mut stats).await?;
                return Err(SolrError::Cancelled);
            }

            match self.process_id(&id, opts).await? {
                Built::Doc(doc) => {
                    stats.updated += 1;
                    if buffer.add(doc)? {
                        self.flush(&mut buffer, opts, &mut stats).await?;
                    }
                }
                Built::Delete(id) => {
                    stats.deleted += 1;
                    if opts.offline() {
                        debug!("Would delete {id}");
                    } else {
                        self.client.delete_id(&id).await?;
                    }
                }
                Built::Skip => {}
            }

            since_commit += 1;
            if since_commit >= self.settings.solr.max_commit_interval {
                since_commit = 0;
                self.flush(&mut buffer, opts, &mut stats).await?;
                if !opts.no_commit && !opts.offline() {
                    self.client.commit().await?;
                }
            }
        }

        self.flush(&mut buffer, opts, &mut stats).await?;
        if !opts.no_commit && !opts.offline() {
            self.client.commit().await?;
        }

        // the checkpoint only advances on a clean, complete, online run
        if opts.single.is_none() && !opts.offline() {
            self.state.set_datetime(&index_key, &checkpoint)?;
        }

        info!(
            "Solr update done: {} updated, {} deleted, {} batches",
            stats.updated, stats.deleted, stats.batches
        );
        Ok(stats)
    }

    /// Stable hash over the parameters that shape queue contents.
    fn param_hash(&self, from: &DateTime<Utc>, opts: &UpdateOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(from.timestamp().to_string());
        hasher.update("\x1f");
        hasher.update(opts.source.as_deref().unwrap_or(""));
        hasher.update("\x1f");
        hasher.update(opts.single.as_deref().unwrap_or(""));
        hasher.update("\x1f");
        hasher.update(&self.settings.solr.update_url);
        hex::encode(&hasher.finalize()[..8])
    }

    /// Scan the record store into a fresh queue of canonical ids.
    fn build_queue(
        &self,
        hash: &str,
        from: &DateTime<Utc>,
        from_unix: i64,
        last_unix: i64,
        opts: &UpdateOptions,
    ) -> Result<String> {
        let tmp = self.queues.new_queue(hash, from_unix, last_unix)?;

        if let Some(single) = &opts.single {
            let canonical = match self.records.get(single)? {
                Some(record) => record.dedup_id.unwrap_or(record.id),
                None => single.clone(),
            };
            self.queues.push(&tmp, &canonical)?;
            return Ok(self.queues.finalize(&tmp)?);
        }

        let filter = RecordFilter {
            source_id: opts.source.clone(),
            update_needed: Some(false),
            updated_since: Some(*from),
            ..Default::default()
        };
        let queues = self.queues;
        let records = self.records;
        let settings = self.settings;
        records.iterate(&filter, |record| {
            if record.is_component_part() {
                let policy = settings
                    .sources
                    .get(&record.source_id)
                    .map(|s| (s.component_parts, s.index_merged_parts))
                    .unwrap_or((ComponentPartsPolicy::AsIs, false));
                match policy {
                    (ComponentPartsPolicy::AsIs, _) | (_, true) => {
                        queues.push(&tmp, &record.id)?;
                    }
                    _ => {}
                }
                if policy.0 != ComponentPartsPolicy::AsIs {
                    // a changed part re-renders its host document
                    for host in
                        records.find_by_linking_id(&record.source_id, &record.host_record_id)?
                    {
                        queues.push(&tmp, &host.dedup_id.unwrap_or(host.id))?;
                    }
                }
            } else {
                match &record.dedup_id {
                    Some(group_id) => queues.push(&tmp, group_id)?,
                    None => queues.push(&tmp, &record.id)?,
                }
            }
            Ok(true)
        })?;

        // groups whose membership changed must be re-rendered even when no
        // member record itself changed
        for group_id in self.records.dedup_ids_updated_since(from)? {
            self.queues.push(&tmp, &group_id)?;
        }
        for group_id in self.groups.ids_updated_since(from)? {
            self.queues.push(&tmp, &group_id)?;
        }

        Ok(self.queues.finalize(&tmp)?)
    }

    async fn process_id(&self, id: &str, opts: &UpdateOptions) -> Result<Built> {
        if let Some(group) = self.groups.get(id)? {
            let members: Vec<Record> = self
                .records
                .find_by_dedup_id(id)?
                .into_iter()
                .filter(|r| !r.deleted)
                .collect();
            if group.deleted || members.is_empty() {
                return Ok(Built::Delete(group.id));
            }

            let mut member_docs = Vec::with_capacity(members.len());
            for member in &members {
                if let Some(doc) = self.build_record_doc(member).await? {
                    member_docs.push(doc);
                }
            }
            if member_docs.is_empty() {
                return Ok(Built::Delete(group.id));
            }
            let mut merged = merge_documents(&group.id, &member_docs);
            self.stamp_index_times(&mut merged, None);
            return Ok(Built::Doc(merged));
        }

        let Some(record) = self.records.get(id)? else {
            // the record vanished between scan and delivery; an accepted
            // race under at-least-once reprocessing
            debug!("Queued id {id} no longer exists");
            return Ok(Built::Skip);
        };
        if record.deleted {
            return Ok(Built::Delete(record.id));
        }
        if record.is_component_part() {
            let suppressed = self
                .settings
                .sources
                .get(&record.source_id)
                .map(|s| s.component_parts != ComponentPartsPolicy::AsIs && !s.index_merged_parts)
                .unwrap_or(false);
            if suppressed && opts.single.is_none() {
                return Ok(Built::Skip);
            }
        }

        match self.build_record_doc(&record).await? {
            Some(doc) => Ok(Built::Doc(doc)),
            None => Ok(Built::Skip),
        }
    }

    /// Build the full index document for one record: driver fields,
    /// component folding, mapping, enrichment, identity fields.
    async fn build_record_doc(&self, record: &Record) -> Result<Option<SolrDoc>> {
        let Some(source) = self.settings.sources.get(&record.source_id) else {
            warn!("Record {} belongs to unconfigured source; skipping", record.id);
            return Ok(None);
        };

        let driver = match drivers::create_driver(
            &record.format,
            record.payload(),
            &record.oai_id,
            &record.source_id,
            &source.driver_params,
        ) {
            Ok(driver) => driver,
            Err(e) => {
                warn!("Cannot build document for {}: {e}", record.id);
                return Ok(None);
            }
        };

        let mut doc = driver.to_solr_array();

        if !record.is_component_part()
            && source.component_parts != ComponentPartsPolicy::AsIs
            && !record.linking_id.is_empty()
        {
            let parts = self.records.find(&RecordFilter {
                source_id: Some(record.source_id.clone()),
                host_record_id: Some(record.linking_id.clone()),
                deleted: Some(false),
                ..Default::default()
            })?;
            if !parts.is_empty() {
                let mut part_drivers: Vec<Box<dyn RecordDriver>> = Vec::with_capacity(parts.len());
                for part in &parts {
                    match drivers::create_driver(
                        &part.format,
                        part.payload(),
                        &part.oai_id,
                        &part.source_id,
                        &source.driver_params,
                    ) {
                        Ok(driver) => part_drivers.push(driver),
                        Err(e) => warn!("Skipping component {} of {}: {e}", part.id, record.id),
                    }
                }
                let merged = driver.merge_component_parts(&part_drivers, &mut doc);
                debug!("Merged {merged} component parts into {}", record.id);
            }
        }

        self.mapper.map_values(&record.source_id, &mut doc);

        for enricher in &self.enrichers {
            if let Err(e) = enricher.enrich(&record.source_id, driver.as_ref(), &mut doc).await {
                warn!("Enrichment of {} failed: {e}", record.id);
                return Ok(None);
            }
        }

        drop_empty_values(&mut doc);

        doc.insert("id".to_string(), Value::String(record.id.clone()));
        let institution = if source.institution.is_empty() {
            &self.settings.site.default_institution
        } else {
            &source.institution
        };
        doc.insert(
            "institution".to_string(),
            Value::String(institution.clone()),
        );
        doc.insert(
            "collection".to_string(),
            Value::String(
                source
                    .collection
                    .clone()
                    .unwrap_or_else(|| self.settings.site.default_collection.clone()),
            ),
        );
        self.stamp_index_times(&mut doc, Some(record));

        if self.settings.solr.building_hierarchy {
            explode_building_hierarchy(&mut doc, institution);
        }

        Ok(Some(doc))
    }

    fn stamp_index_times(&self, doc: &mut SolrDoc, record: Option<&Record>) {
        let format = "%Y-%m-%dT%H:%M:%SZ";
        let first = record
            .map(|r| r.created)
            .unwrap_or_else(Utc::now)
            .format(format)
            .to_string();
        doc.insert("first_indexed".to_string(), Value::String(first));
        doc.insert(
            "last_indexed".to_string(),
            Value::String(Utc::now().format(format).to_string()),
        );
    }

    async fn flush(
        &self,
        buffer: &mut UpdateBuffer,
        opts: &UpdateOptions,
        stats: &mut UpdateStats,
    ) -> Result<()> {
        let docs = buffer.take();
        if docs.is_empty() {
            return Ok(());
        }
        stats.batches += 1;

        if let Some(path) = &opts.compare {
            self.write_comparison(path, &docs).await?;
        } else if let Some(prefix) = &opts.dump_prefix {
            let path = format!("{prefix}-batch-{:06}.json", stats.batches);
            let body = serde_json::to_string_pretty(&docs)?;
            std::fs::write(&path, body).map_err(|e| SolrError::Io { path, source: e })?;
        } else {
            self.client.add(&docs).await?;
        }
        Ok(())
    }

    /// Compare mode: diff each candidate document against the live index
    /// and append the differences to a file.
    async fn write_comparison(&self, path: &PathBuf, docs: &[SolrDoc]) -> Result<()> {
        // volatile fields differ on every run and carry no signal
        const IGNORED: [&str; 3] = ["_version_", "first_indexed", "last_indexed"];

        let mut out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SolrError::Io {
                path: path.display().to_string(),
                source: e,
            })?;

        for doc in docs {
            let id = doc.get("id").and_then(Value::as_str).unwrap_or("");
            let live = self.client.fetch_document(id).await?;
            let live_map = live
                .as_ref()
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let mut lines = Vec::new();
            for (field, value) in doc {
                if IGNORED.contains(&field.as_str()) {
                    continue;
                }
                match live_map.get(field) {
                    Some(live_value) if live_value == value => {}
                    Some(live_value) => {
                        lines.push(format!("  {field}: {live_value} -> {value}"));
                    }
                    None => lines.push(format!("  {field}: (absent) -> {value}")),
                }
            }
            for field in live_map.keys() {
                if !IGNORED.contains(&field.as_str()) && !doc.contains_key(field) {
                    lines.push(format!("  {field}: removed"));
                }
            }

            if !lines.is_empty() {
                writeln!(out, "{id}:\n{}", lines.join("\n")).map_err(|e| SolrError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }

    /// Remove a data source from the index: rewrite merged documents the
    /// source participated in, then delete its records by id prefix.
    pub async fn delete_datasource(&self, source_id: &str) -> Result<()> {
        let prefix = self.settings.source(source_id)?.id_prefix().to_string();
        let member_prefix = format!("{prefix}.");

        let mut affected = Vec::new();
        self.groups.iterate(|group| {
            if !group.deleted && group.ids.iter().any(|id| id.starts_with(&member_prefix)) {
                affected.push(group.id.clone());
            }
            Ok(true)
        })?;

        info!(
            "Rewriting {} merged documents before deleting source {source_id}",
            affected.len()
        );
        for group_id in affected {
            let members: Vec<Record> = self
                .records
                .find_by_dedup_id(&group_id)?
                .into_iter()
                .filter(|r| !r.deleted && r.source_id != source_id)
                .collect();

            let mut member_docs = Vec::new();
            for member in &members {
                if let Some(doc) = self.build_record_doc(member).await? {
                    member_docs.push(doc);
                }
            }
            if member_docs.is_empty() {
                self.client.delete_id(&group_id).await?;
            } else {
                let mut merged = merge_documents(&group_id, &member_docs);
                self.stamp_index_times(&mut merged, None);
                self.client.add(&[merged]).await?;
            }
        }

        self.client.delete_query(&format!("id:{prefix}.*")).await?;
        self.client.commit().await?;
        Ok(())
    }

    /// Issue an index optimize.
    pub async fn optimize(&self) -> Result<()> {
        self.client.optimize().await
    }

    /// Render the full pipeline for one canonical id without touching
    /// Solr.
    pub async fn preview(&self, id: &str) -> Result<Option<SolrDoc>> {
        let opts = UpdateOptions {
            single: Some(id.to_string()),
            ..Default::default()
        };
        match self.process_id(id, &opts).await? {
            Built::Doc(doc) => Ok(Some(doc)),
            _ => Ok(None),
        }
    }
}

enum Built {
    Doc(SolrDoc),
    Delete(String),
    Skip,
}

/// Buffer of documents bounded by count and serialized size.
struct UpdateBuffer {
    docs: Vec<SolrDoc>,
    bytes: usize,
    max_records: usize,
    max_bytes: usize,
}

impl UpdateBuffer {
    fn new(max_records: usize, max_bytes: usize) -> Self {
        Self {
            docs: Vec::new(),
            bytes: 0,
            max_records: max_records.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Add a document; returns true when the buffer wants flushing.
    fn add(&mut self, doc: SolrDoc) -> Result<bool> {
        self.bytes += serde_json::to_string(&doc)?.len();
        self.docs.push(doc);
        Ok(self.docs.len() >= self.max_records || self.bytes >= self.max_bytes)
    }

    fn take(&mut self) -> Vec<SolrDoc> {
        self.bytes = 0;
        std::mem::take(&mut self.docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_flush_thresholds() {
        let mut buffer = UpdateBuffer::new(2, 1_000_000);
        let mut doc = SolrDoc::new();
        doc.insert("id".into(), Value::String("x".into()));
        assert!(!buffer.add(doc.clone()).unwrap());
        assert!(buffer.add(doc.clone()).unwrap());
        assert_eq!(buffer.take().len(), 2);

        let mut buffer = UpdateBuffer::new(1000, 10);
        assert!(buffer.add(doc).unwrap());
    }
}
