//! Full-set reconciliation for sources whose protocol can only deliver the
//! complete record set: diff the harvested set against the store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use super::{HarvestError, Result};
use crate::config::DataSourceConfig;
use crate::drivers;
use crate::ingest::Ingestor;
use crate::models::RecordFilter;
use crate::repository::RecordRepository;

/// Diff counters for one full-set pass.
#[derive(Debug, Default, Clone)]
pub struct FullSetOutcome {
    pub added: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub deleted: u64,
}

/// Reconcile a complete harvested set: new and changed payloads go through
/// ingestion, records missing from the set are soft-deleted. Change
/// detection is serialized-payload equality.
pub fn reconcile_full_set(
    source: &DataSourceConfig,
    records: &RecordRepository,
    ingestor: &Ingestor<'_>,
    payloads: &[String],
    terminated: &Arc<AtomicBool>,
) -> Result<FullSetOutcome> {
    let mut outcome = FullSetOutcome::default();
    let mut harvested: HashSet<String> = HashSet::with_capacity(payloads.len());

    for payload in payloads {
        if terminated.load(Ordering::Relaxed) {
            return Err(HarvestError::Cancelled);
        }
        let driver = match drivers::create_driver(
            &source.format,
            payload,
            "",
            &source.id,
            &source.driver_params,
        ) {
            Ok(driver) => driver,
            Err(e) => {
                warn!("Skipping unparseable record in {} set: {e}", source.id);
                continue;
            }
        };
        let local_id = driver.id();
        if local_id.is_empty() {
            warn!("Skipping record without id in {} set", source.id);
            continue;
        }
        let id = format!("{}.{}", source.id_prefix(), local_id);
        harvested.insert(id.clone());

        match records.get(&id)? {
            Some(existing)
                if !existing.deleted && existing.original_data == driver.serialize() =>
            {
                outcome.unchanged += 1;
            }
            Some(_) => {
                ingestor.store_record("", false, payload)?;
                outcome.changed += 1;
            }
            None => {
                ingestor.store_record("", false, payload)?;
                outcome.added += 1;
            }
        }
    }

    if harvested.is_empty() {
        warn!("Full set of {} came back empty; skipping deletions", source.id);
        return Ok(outcome);
    }

    let live = records.find(&RecordFilter::live_source(&source.id))?;
    for record in live {
        if !harvested.contains(&record.id) {
            ingestor.tombstone(record)?;
            outcome.deleted += 1;
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{DedupRepository, RecordRepository};
    use tempfile::TempDir;

    fn payload(id: &str, title: &str) -> String {
        format!("<dc><title>{title}</title><identifier>{id}</identifier></dc>")
    }

    #[test]
    fn test_diff_adds_changes_and_deletes() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let records = RecordRepository::new(&db).unwrap();
        let groups = DedupRepository::new(&db).unwrap();
        let mut source: DataSourceConfig = toml::from_str(r#"format = "dc""#).unwrap();
        source.id = "ml".to_string();
        let ingestor = Ingestor::new(&source, &records, &groups).unwrap();
        let terminated = Arc::new(AtomicBool::new(false));

        // first run: two records
        let set1 = vec![payload("a", "Alpha"), payload("b", "Beta")];
        let outcome =
            reconcile_full_set(&source, &records, &ingestor, &set1, &terminated).unwrap();
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.deleted, 0);

        // second run: a changed, c new, b missing
        let set2 = vec![payload("a", "Alpha revised"), payload("c", "Gamma")];
        let outcome =
            reconcile_full_set(&source, &records, &ingestor, &set2, &terminated).unwrap();
        assert_eq!(outcome.changed, 1);
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.deleted, 1);

        assert!(records.get("ml.b").unwrap().unwrap().deleted);
        assert!(!records.get("ml.a").unwrap().unwrap().deleted);
        assert!(!records.get("ml.c").unwrap().unwrap().deleted);
    }

    #[test]
    fn test_empty_set_skips_deletions() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let records = RecordRepository::new(&db).unwrap();
        let groups = DedupRepository::new(&db).unwrap();
        let mut source: DataSourceConfig = toml::from_str(r#"format = "dc""#).unwrap();
        source.id = "ml".to_string();
        let ingestor = Ingestor::new(&source, &records, &groups).unwrap();
        let terminated = Arc::new(AtomicBool::new(false));

        reconcile_full_set(
            &source,
            &records,
            &ingestor,
            &[payload("a", "Alpha")],
            &terminated,
        )
        .unwrap();
        let outcome =
            reconcile_full_set(&source, &records, &ingestor, &[], &terminated).unwrap();
        assert_eq!(outcome.deleted, 0);
        assert!(!records.get("ml.a").unwrap().unwrap().deleted);
    }
}
