//! Ingestion and normalization: turn harvested payloads into stored,
//! dedup-keyed records.

pub mod keys;
mod splitter;

pub use splitter::{create_splitter, RecordSplitter, XmlChildrenSplitter};

use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ConfigError, DataSourceConfig};
use crate::dedup::detach_record;
use crate::drivers::{self, DriverError, RecordDriver};
use crate::models::{Record, RecordFilter};
use crate::repository::{DedupRepository, RecordRepository, RepositoryError};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Record has neither a driver id nor an OAI id")]
    EmptyId,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Ingestion pipeline for one data source.
pub struct Ingestor<'a> {
    source: &'a DataSourceConfig,
    records: &'a RecordRepository,
    groups: &'a DedupRepository,
    splitter: Option<Box<dyn RecordSplitter>>,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        source: &'a DataSourceConfig,
        records: &'a RecordRepository,
        groups: &'a DedupRepository,
    ) -> Result<Self> {
        let splitter = match &source.record_splitter {
            Some(name) => Some(create_splitter(name)?),
            None => None,
        };
        Ok(Self {
            source,
            records,
            groups,
            splitter,
        })
    }

    /// Store one harvested item: split, normalize, upsert and wire the
    /// dedup dirty bits. Returns the number of records written or
    /// tombstoned.
    pub fn store_record(&self, oai_id: &str, deleted: bool, payload: &str) -> Result<u64> {
        if deleted {
            if oai_id.is_empty() {
                return Ok(0);
            }
            let mut count = 0;
            for record in self.records.find_by_oai_id(&self.source.id, oai_id)? {
                if !record.deleted {
                    self.tombstone(record)?;
                    count += 1;
                }
            }
            return Ok(count);
        }

        let hierarchical = self.splitter.is_some();
        let parts = match &self.splitter {
            Some(splitter) => splitter.split(payload)?,
            None => vec![payload.to_string()],
        };
        // captured before any write so vanished hierarchy members can be
        // told apart from the ones this batch refreshed
        let start_time = crate::repository::now();

        let mut main_id = String::new();
        let mut stored = 0;
        for part in &parts {
            let id = self.store_single(part, oai_id, &mut main_id, hierarchical)?;
            debug!("Stored {id}");
            stored += 1;
        }

        if hierarchical && !self.source.keep_missing_hierarchy_members && !main_id.is_empty() {
            let vanished = self.records.find(&RecordFilter {
                main_id: Some(main_id),
                updated_before: Some(start_time),
                deleted: Some(false),
                ..Default::default()
            })?;
            for record in vanished {
                warn!("Hierarchy member {} vanished from batch, deleting", record.id);
                self.tombstone(record)?;
                stored += 1;
            }
        }

        Ok(stored)
    }

    /// Re-run normalization and key derivation over a stored record's
    /// original payload.
    pub fn renormalize(&self, record: &Record) -> Result<()> {
        let mut main_id = record.main_id.clone();
        self.store_single(&record.original_data, &record.oai_id, &mut main_id, false)?;
        Ok(())
    }

    /// Soft-delete a record, detaching it from its dedup group first.
    pub fn tombstone(&self, mut record: Record) -> Result<()> {
        detach_record(self.records, self.groups, &record)?;
        record.dedup_id = None;
        record.deleted = true;
        record.update_needed = false;
        record.updated = crate::repository::now();
        self.records.save(&record)?;
        Ok(())
    }

    fn store_single(
        &self,
        payload: &str,
        oai_id: &str,
        main_id: &mut String,
        hierarchical: bool,
    ) -> Result<String> {
        let params: &HashMap<String, String> = &self.source.driver_params;
        let original =
            drivers::create_driver(&self.source.format, payload, oai_id, &self.source.id, params)?;
        let mut normalized =
            drivers::create_driver(&self.source.format, payload, oai_id, &self.source.id, params)?;
        normalized.normalize();

        let original_data = original.serialize();
        let mut normalized_data = normalized.serialize();
        if normalized_data == original_data {
            // identical after normalization; store once
            normalized_data = String::new();
        }

        let local_id = {
            let id = normalized.id();
            if id.is_empty() {
                oai_id.to_string()
            } else {
                id
            }
        };
        if local_id.is_empty() {
            return Err(IngestError::EmptyId);
        }
        let id = format!("{}.{}", self.source.id_prefix(), local_id);

        let existing = self.records.get(&id)?;
        let data_changed = match &existing {
            Some(record) => {
                record.original_data != original_data
                    || record.normalized_data != normalized_data
                    || record.deleted
            }
            None => true,
        };

        let mut record = existing
            .unwrap_or_else(|| Record::new(id.clone(), self.source.id.clone(), self.source.format.clone()));
        record.format = self.source.format.clone();
        record.oai_id = oai_id.to_string();
        record.original_data = original_data;
        record.normalized_data = normalized_data;
        record.linking_id = normalized.get_linking_id();
        record.host_record_id = normalized.get_host_record_id();
        record.deleted = false;
        record.updated = crate::repository::now();
        record.date = record.updated;

        if hierarchical {
            if main_id.is_empty() {
                *main_id = id.clone();
            }
            record.main_id = main_id.clone();
        }

        self.wire_dedup(&mut record, normalized.as_ref(), data_changed)?;
        self.records.save(&record)?;
        Ok(id)
    }

    /// Step 7 of the ingest flow: refresh blocking keys and dirty bits.
    fn wire_dedup(
        &self,
        record: &mut Record,
        driver: &dyn RecordDriver,
        data_changed: bool,
    ) -> Result<()> {
        if record.is_component_part() {
            // component parts are deduplicated through their host
            for host in self
                .records
                .find_by_linking_id(&self.source.id, &record.host_record_id)?
            {
                self.records.set_update_needed(&host.id, true)?;
            }
            record.update_needed = false;
            return Ok(());
        }

        if !self.source.dedup {
            if record.dedup_id.is_some() {
                detach_record(self.records, self.groups, record)?;
                record.dedup_id = None;
            }
            record.title_keys.clear();
            record.isbn_keys.clear();
            record.id_keys.clear();
            record.update_needed = false;
            return Ok(());
        }

        let (title_keys, isbn_keys, id_keys) = dedup_candidate_keys(driver);
        let keys_changed = record.title_keys != title_keys
            || record.isbn_keys != isbn_keys
            || record.id_keys != id_keys;
        record.title_keys = title_keys;
        record.isbn_keys = isbn_keys;
        record.id_keys = id_keys;
        record.update_needed = keys_changed || data_changed;
        Ok(())
    }
}

/// Compute the blocking keys for a record.
pub fn dedup_candidate_keys(
    driver: &dyn RecordDriver,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let title_keys = keys::title_key(&driver.get_title(true))
        .into_iter()
        .collect();
    (title_keys, driver.get_isbns(), driver.get_id_keys())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSourceConfig;
    use crate::repository::{DedupRepository, RecordRepository};
    use tempfile::TempDir;

    fn source(id: &str) -> DataSourceConfig {
        let mut source: DataSourceConfig = toml::from_str(r#"format = "dc""#).unwrap();
        source.id = id.to_string();
        source
    }

    fn setup() -> (TempDir, RecordRepository, DedupRepository) {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let records = RecordRepository::new(&db).unwrap();
        let groups = DedupRepository::new(&db).unwrap();
        (dir, records, groups)
    }

    const PAYLOAD: &str = "<dc><title>The Art of Computer Programming</title>\
        <creator>Knuth, Donald E.</creator>\
        <identifier>taocp-1</identifier>\
        <identifier>ISBN 0-201-03801-3</identifier>\
        <date>1997</date><type>Book</type></dc>";

    #[test]
    fn test_store_creates_record_with_keys() {
        let (_dir, records, groups) = setup();
        let source = source("s1");
        let ingestor = Ingestor::new(&source, &records, &groups).unwrap();

        let stored = ingestor.store_record("oai:x:1", false, PAYLOAD).unwrap();
        assert_eq!(stored, 1);

        let record = records.get("s1.taocp-1").unwrap().unwrap();
        assert_eq!(record.oai_id, "oai:x:1");
        assert!(record.update_needed);
        assert_eq!(record.isbn_keys, vec!["9780201038019".to_string()]);
        assert_eq!(record.title_keys, vec!["artofcomputerprogramming".to_string()]);
        // normalization of an already-clean payload is a no-op
        assert!(record.normalized_data.is_empty() || record.normalized_data != record.original_data);
    }

    #[test]
    fn test_restore_unchanged_keeps_clean() {
        let (_dir, records, groups) = setup();
        let source = source("s1");
        let ingestor = Ingestor::new(&source, &records, &groups).unwrap();

        ingestor.store_record("oai:x:1", false, PAYLOAD).unwrap();
        records.set_update_needed("s1.taocp-1", false).unwrap();

        ingestor.store_record("oai:x:1", false, PAYLOAD).unwrap();
        let record = records.get("s1.taocp-1").unwrap().unwrap();
        assert!(!record.update_needed);
    }

    #[test]
    fn test_delete_by_oai_id() {
        let (_dir, records, groups) = setup();
        let source = source("s1");
        let ingestor = Ingestor::new(&source, &records, &groups).unwrap();

        ingestor.store_record("oai:x:1", false, PAYLOAD).unwrap();
        let deleted = ingestor.store_record("oai:x:1", true, "").unwrap();
        assert_eq!(deleted, 1);

        let record = records.get("s1.taocp-1").unwrap().unwrap();
        assert!(record.deleted);
        assert!(!record.update_needed);

        // deleting again is a no-op
        assert_eq!(ingestor.store_record("oai:x:1", true, "").unwrap(), 0);
    }

    #[test]
    fn test_empty_id_rejected() {
        let (_dir, records, groups) = setup();
        let source = source("s1");
        let ingestor = Ingestor::new(&source, &records, &groups).unwrap();

        let err = ingestor
            .store_record("", false, "<dc><title>No identifier at all</title></dc>")
            .unwrap_err();
        assert!(matches!(err, IngestError::EmptyId));
    }

    #[test]
    fn test_split_ingest_sets_main_id_and_tombstones() {
        let (_dir, records, groups) = setup();
        let mut source = source("s1");
        source.record_splitter = Some("xml-children".to_string());
        let ingestor = Ingestor::new(&source, &records, &groups).unwrap();

        let batch = "<records>\
            <dc><title>Top</title><identifier>top</identifier></dc>\
            <dc><title>Child</title><identifier>child</identifier></dc>\
            </records>";
        assert_eq!(ingestor.store_record("oai:x:h", false, batch).unwrap(), 2);

        let top = records.get("s1.top").unwrap().unwrap();
        let child = records.get("s1.child").unwrap().unwrap();
        assert_eq!(top.main_id, "s1.top");
        assert_eq!(child.main_id, "s1.top");

        // re-ingest without the child: it gets tombstoned
        let smaller = "<records>\
            <dc><title>Top</title><identifier>top</identifier></dc>\
            </records>";
        ingestor.store_record("oai:x:h", false, smaller).unwrap();
        let child = records.get("s1.child").unwrap().unwrap();
        assert!(child.deleted);
    }

    #[test]
    fn test_component_part_marks_host_dirty() {
        let (_dir, records, groups) = setup();
        let source = source("s1");
        let ingestor = Ingestor::new(&source, &records, &groups).unwrap();

        let host = "<dc><title>Journal of Tests</title><identifier>host1</identifier></dc>";
        ingestor.store_record("oai:x:host", false, host).unwrap();
        records.set_update_needed("s1.host1", false).unwrap();

        let part = "<dc><title>An Article</title><identifier>part1</identifier>\
            <ispartof>host1</ispartof></dc>";
        ingestor.store_record("oai:x:part", false, part).unwrap();

        let host = records.get("s1.host1").unwrap().unwrap();
        assert!(host.update_needed);
        let part = records.get("s1.part1").unwrap().unwrap();
        assert!(!part.update_needed);
        assert!(part.is_component_part());
    }

    #[test]
    fn test_dedup_disabled_clears_keys() {
        let (_dir, records, groups) = setup();
        let mut source = source("s1");
        source.dedup = false;
        let ingestor = Ingestor::new(&source, &records, &groups).unwrap();

        ingestor.store_record("oai:x:1", false, PAYLOAD).unwrap();
        let record = records.get("s1.taocp-1").unwrap().unwrap();
        assert!(record.title_keys.is_empty());
        assert!(record.isbn_keys.is_empty());
        assert!(!record.update_needed);
    }
}
