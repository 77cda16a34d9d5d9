//! Deduplication engine: candidate generation over blocking keys,
//! pairwise matching, and equivalence-class maintenance.

mod check;
mod matcher;

pub use check::{check_dedup_consistency, RepairStats};
pub use matcher::records_match;

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DataSourceConfig, DedupConfig};
use crate::drivers::{self, DriverError, RecordDriver};
use crate::models::{DedupGroup, Record, RecordFilter};
use crate::repository::{
    DedupRepository, RecordRepository, RepositoryError, KEY_KIND_ID, KEY_KIND_ISBN,
    KEY_KIND_TITLE,
};

#[derive(Error, Debug)]
pub enum DedupError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("Terminated by signal")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DedupError>;

/// Outcome counters for one dedup pass.
#[derive(Debug, Default, Clone)]
pub struct DedupStats {
    pub processed: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub skipped_keys: u64,
}

/// Deduplication pass over dirty records.
pub struct DedupHandler<'a> {
    records: &'a RecordRepository,
    groups: &'a DedupRepository,
    sources: &'a HashMap<String, DataSourceConfig>,
    /// Blocking keys found over-broad during this pass.
    too_many: LruCache<String, ()>,
    max_candidates: u64,
}

impl<'a> DedupHandler<'a> {
    pub fn new(
        records: &'a RecordRepository,
        groups: &'a DedupRepository,
        sources: &'a HashMap<String, DataSourceConfig>,
        config: &DedupConfig,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(config.too_many_cache_size.max(1)).unwrap();
        Self {
            records,
            groups,
            sources,
            too_many: LruCache::new(capacity),
            max_candidates: config.max_candidates,
        }
    }

    /// Deduplicate every dirty record, optionally restricted to one source.
    /// Stops between records when the termination flag is raised.
    pub fn deduplicate(
        &mut self,
        source_id: Option<&str>,
        terminated: &Arc<AtomicBool>,
    ) -> Result<DedupStats> {
        let filter = RecordFilter {
            source_id: source_id.map(str::to_string),
            deleted: Some(false),
            update_needed: Some(true),
            ..Default::default()
        };

        let mut stats = DedupStats::default();
        let mut cancelled = false;
        let records = self.records;
        records.iterate(&filter, |record| {
            if terminated.load(Ordering::Relaxed) {
                cancelled = true;
                return Ok(false);
            }
            stats.processed += 1;
            match self.dedup_record(&record) {
                Ok(true) => stats.matched += 1,
                Ok(false) => stats.unmatched += 1,
                Err(DedupError::Repository(e)) => return Err(e),
                Err(e) => {
                    // a bad record must not sink the whole pass
                    warn!("Deduplicating {} failed: {}", record.id, e);
                }
            }
            Ok(true)
        })?;

        if cancelled {
            return Err(DedupError::Cancelled);
        }
        info!(
            "Dedup pass done: {} processed, {} matched, {} unmatched",
            stats.processed, stats.matched, stats.unmatched
        );
        Ok(stats)
    }

    /// Deduplicate a single record. Returns whether it ended up in a group.
    pub fn dedup_record(&mut self, record: &Record) -> Result<bool> {
        let dedup_enabled = self
            .sources
            .get(&record.source_id)
            .map(|s| s.dedup)
            .unwrap_or(false);

        if record.is_component_part() || record.deleted || !dedup_enabled {
            if record.dedup_id.is_some() {
                detach_record(self.records, self.groups, record)?;
            }
            self.records.set_update_needed(&record.id, false)?;
            return Ok(false);
        }

        let driver = self.driver_for(record)?;

        // keys in priority order: ISBN, then format-specific ids, then title
        let mut keys: Vec<(&str, String)> = Vec::new();
        for key in &record.isbn_keys {
            keys.push((KEY_KIND_ISBN, key.clone()));
        }
        for key in &record.id_keys {
            keys.push((KEY_KIND_ID, key.clone()));
        }
        for key in &record.title_keys {
            keys.push((KEY_KIND_TITLE, key.clone()));
        }

        for (kind, key) in keys {
            let cache_key = format!("{kind}:{key}");
            if self.too_many.contains(&cache_key) {
                continue;
            }
            let count = self.records.count_key_matches(kind, &key, &record.source_id)?;
            if count > self.max_candidates {
                debug!("Skipping over-broad key {cache_key} ({count} candidates)");
                self.too_many.put(cache_key, ());
                continue;
            }

            let mut candidates = self.records.find_by_key(kind, &key, &record.source_id)?;
            if let Some(group_id) = &record.dedup_id {
                // prefer confirming the existing membership over moving the
                // record to another group
                candidates.sort_by_key(|c| c.dedup_id.as_deref() != Some(group_id.as_str()));
            }
            for candidate in candidates {
                if candidate.id == record.id {
                    continue;
                }
                let candidate_driver = self.driver_for(&candidate)?;
                if !records_match(driver.as_ref(), candidate_driver.as_ref()) {
                    continue;
                }
                if self.merge_pair(record, &candidate)? {
                    self.co_dedup_components(record, &candidate)?;
                    return Ok(true);
                }
                // group already holds a record of ours; keep searching
            }
        }

        // no match: the record keeps no group membership
        if record.dedup_id.is_some() {
            detach_record(self.records, self.groups, record)?;
        }
        self.records.set_update_needed(&record.id, false)?;
        Ok(false)
    }

    fn driver_for(&self, record: &Record) -> Result<Box<dyn RecordDriver>> {
        let empty = HashMap::new();
        let params = self
            .sources
            .get(&record.source_id)
            .map(|s| &s.driver_params)
            .unwrap_or(&empty);
        Ok(drivers::create_driver(
            &record.format,
            record.payload(),
            &record.oai_id,
            &record.source_id,
            params,
        )?)
    }

    /// Attach `record` to `candidate`'s group, or found a new group over
    /// the pair. Returns false when the candidate's group already holds
    /// another record from `record`'s source.
    fn merge_pair(&mut self, record: &Record, candidate: &Record) -> Result<bool> {
        let target = match &candidate.dedup_id {
            Some(group_id) => self.groups.get(group_id)?.filter(|g| !g.deleted),
            None => None,
        };

        match target {
            Some(mut group) => {
                let own_prefix = format!("{}.", record.source_id);
                let other_from_same_source = group
                    .ids
                    .iter()
                    .any(|id| id != &record.id && id.starts_with(&own_prefix));
                if other_from_same_source {
                    return Ok(false);
                }

                if group.ids.contains(&record.id) {
                    // membership confirmed; the back-pointer may be stale
                    // when the pair was grouped earlier in this pass
                    self.records.set_dedup_id(&record.id, Some(&group.id))?;
                    self.records.set_update_needed(&record.id, false)?;
                    self.records.set_update_needed(&candidate.id, false)?;
                    return Ok(true);
                }

                if record.dedup_id.is_some() {
                    detach_record(self.records, self.groups, record)?;
                }
                group.ids.push(record.id.clone());
                group.changed = true;
                group.updated = crate::repository::now();
                self.groups.save(&group)?;
                self.records.set_dedup_id(&record.id, Some(&group.id))?;
            }
            None => {
                if record.dedup_id.is_some() {
                    detach_record(self.records, self.groups, record)?;
                }
                let group = DedupGroup::new(vec![record.id.clone(), candidate.id.clone()]);
                self.groups.save(&group)?;
                self.records.set_dedup_id(&record.id, Some(&group.id))?;
                self.records.set_dedup_id(&candidate.id, Some(&group.id))?;
            }
        }

        self.records.set_update_needed(&record.id, false)?;
        self.records.set_update_needed(&candidate.id, false)?;
        Ok(true)
    }

    /// Pair up the component parts of two matched hosts. Parts are aligned
    /// in numeric-suffix order and grouped only when the full sequences
    /// align; partial alignment leaves them unduplicated.
    fn co_dedup_components(&mut self, host_a: &Record, host_b: &Record) -> Result<()> {
        let parts_a = self.component_parts_of(host_a)?;
        let parts_b = self.component_parts_of(host_b)?;
        if parts_a.is_empty() || parts_a.len() != parts_b.len() {
            return Ok(());
        }

        let mut pairs = Vec::with_capacity(parts_a.len());
        for (a, b) in parts_a.iter().zip(parts_b.iter()) {
            let driver_a = self.driver_for(a)?;
            let driver_b = self.driver_for(b)?;
            if !records_match(driver_a.as_ref(), driver_b.as_ref()) {
                debug!(
                    "Component sequences of {} and {} do not align",
                    host_a.id, host_b.id
                );
                return Ok(());
            }
            pairs.push((a, b));
        }

        for (a, b) in pairs {
            self.merge_pair(a, b)?;
        }
        Ok(())
    }

    fn component_parts_of(&self, host: &Record) -> Result<Vec<Record>> {
        if host.linking_id.is_empty() {
            return Ok(Vec::new());
        }
        let mut parts = self.records.find(&RecordFilter {
            source_id: Some(host.source_id.clone()),
            host_record_id: Some(host.linking_id.clone()),
            deleted: Some(false),
            ..Default::default()
        })?;
        // numeric id suffixes give the stable sibling order
        parts.sort_by_key(|r| numeric_suffix(&r.id));
        Ok(parts)
    }
}

/// Remove a record from its dedup group, marking the group deleted when it
/// collapses below two distinct sources and re-queueing the remaining
/// member for deduplication.
pub fn detach_record(
    records: &RecordRepository,
    groups: &DedupRepository,
    record: &Record,
) -> std::result::Result<(), RepositoryError> {
    let Some(group_id) = &record.dedup_id else {
        return Ok(());
    };

    if let Some(mut group) = groups.get(group_id)? {
        group.ids.retain(|id| id != &record.id);
        group.changed = true;
        group.updated = crate::repository::now();
        if !group.spans_two_sources() {
            group.deleted = true;
            for member_id in &group.ids {
                records.set_dedup_id(member_id, None)?;
                records.set_update_needed(member_id, true)?;
            }
            group.ids.clear();
        }
        groups.save(&group)?;
    }

    records.set_dedup_id(&record.id, None)?;
    Ok(())
}

/// Trailing digits of a record id, used to order component-part siblings.
fn numeric_suffix(id: &str) -> u64 {
    let digits: String = id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupConfig;
    use crate::ingest::keys::title_key;
    use tempfile::TempDir;

    fn dc_payload(title: &str, isbn: &str, year: i32) -> String {
        format!(
            "<dc><title>{title}</title><creator>Knuth, Donald E.</creator>\
             <identifier>ISBN {isbn}</identifier><date>{year}</date><type>Book</type></dc>"
        )
    }

    fn stored(repo: &RecordRepository, id: &str, source: &str, payload: &str) -> Record {
        let mut record = Record::new(id.to_string(), source.to_string(), "dc".to_string());
        record.original_data = payload.to_string();
        record.update_needed = true;
        let driver =
            drivers::create_driver("dc", payload, "", source, &HashMap::new()).unwrap();
        if let Some(key) = title_key(&driver.get_title(true)) {
            record.title_keys = vec![key];
        }
        record.isbn_keys = driver.get_isbns();
        repo.save(&record).unwrap();
        record
    }

    fn sources() -> HashMap<String, DataSourceConfig> {
        let mut sources = HashMap::new();
        for id in ["s1", "s2", "s3"] {
            let mut source: DataSourceConfig = toml::from_str(r#"format = "dc""#).unwrap();
            source.id = id.to_string();
            sources.insert(id.to_string(), source);
        }
        sources
    }

    #[test]
    fn test_matching_records_form_group() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let records = RecordRepository::new(&db).unwrap();
        let groups = DedupRepository::new(&db).unwrap();
        let sources = sources();
        let config = DedupConfig::default();

        let a = stored(
            &records,
            "s1.a",
            "s1",
            &dc_payload("The Art of Computer Programming", "0-201-03801-3", 1997),
        );
        stored(
            &records,
            "s2.b",
            "s2",
            &dc_payload("Art of Computer Programming", "9780201038019", 1997),
        );

        let mut handler = DedupHandler::new(&records, &groups, &sources, &config);
        assert!(handler.dedup_record(&a).unwrap());

        let a = records.get("s1.a").unwrap().unwrap();
        let b = records.get("s2.b").unwrap().unwrap();
        let group_id = a.dedup_id.clone().unwrap();
        assert_eq!(b.dedup_id.as_deref(), Some(group_id.as_str()));
        assert!(!a.update_needed);
        assert!(!b.update_needed);

        let group = groups.get(&group_id).unwrap().unwrap();
        assert_eq!(group.ids.len(), 2);
        assert!(group.ids.contains(&"s1.a".to_string()));
        assert!(group.ids.contains(&"s2.b".to_string()));
    }

    #[test]
    fn test_group_rejects_second_record_from_same_source() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let records = RecordRepository::new(&db).unwrap();
        let groups = DedupRepository::new(&db).unwrap();
        let sources = sources();
        let config = DedupConfig::default();

        let payload = dc_payload("The Art of Computer Programming", "0-201-03801-3", 1997);
        let a = stored(&records, "s1.a", "s1", &payload);
        stored(&records, "s2.b", "s2", &payload);
        let mut handler = DedupHandler::new(&records, &groups, &sources, &config);
        assert!(handler.dedup_record(&a).unwrap());

        // second s1 record matching the same pair must not join the group
        let a2 = stored(&records, "s1.a2", "s1", &payload);
        assert!(!handler.dedup_record(&a2).unwrap());
        assert!(records.get("s1.a2").unwrap().unwrap().dedup_id.is_none());
    }

    #[test]
    fn test_detach_collapses_group() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let records = RecordRepository::new(&db).unwrap();
        let groups = DedupRepository::new(&db).unwrap();
        let sources = sources();
        let config = DedupConfig::default();

        let payload = dc_payload("The Art of Computer Programming", "0-201-03801-3", 1997);
        let a = stored(&records, "s1.a", "s1", &payload);
        stored(&records, "s2.b", "s2", &payload);
        let mut handler = DedupHandler::new(&records, &groups, &sources, &config);
        handler.dedup_record(&a).unwrap();

        let a = records.get("s1.a").unwrap().unwrap();
        let group_id = a.dedup_id.clone().unwrap();
        detach_record(&records, &groups, &a).unwrap();

        let group = groups.get(&group_id).unwrap().unwrap();
        assert!(group.deleted);
        let b = records.get("s2.b").unwrap().unwrap();
        assert!(b.dedup_id.is_none());
        assert!(b.update_needed);
    }

    #[test]
    fn test_numeric_suffix_order() {
        assert_eq!(numeric_suffix("s1.rec10"), 10);
        assert_eq!(numeric_suffix("s1.rec2"), 2);
        assert_eq!(numeric_suffix("s1.rec"), 0);
    }
}
