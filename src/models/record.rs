//! Record model: one row per incoming metadata item.
//!
//! Records carry both the original payload as received from the source and
//! a normalized form, plus the blocking keys and dirty bit that drive the
//! deduplication passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored metadata record.
///
/// The id is `"{source_id}.{local_id}"`; the local part comes from the
/// format driver or, failing that, from the OAI identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier, `"{source_id}.{local_id}"`.
    pub id: String,
    /// Originating data source key.
    pub source_id: String,
    /// External identifier assigned by the harvest endpoint. Empty for
    /// file imports.
    pub oai_id: String,
    /// Format driver name (`marc`, `dc`, `ese`).
    pub format: String,
    /// Payload exactly as received, serialized by the driver.
    pub original_data: String,
    /// Normalized payload. Empty when normalization was a no-op, in which
    /// case `original_data` is authoritative.
    pub normalized_data: String,
    /// Identifier other records use to reference this one.
    pub linking_id: String,
    /// For component parts, id of the host record; else empty.
    pub host_record_id: String,
    /// For hierarchically split records, id of the topmost record produced
    /// in the same ingest batch.
    pub main_id: String,
    /// Tombstone flag.
    pub deleted: bool,
    /// Dedup dirty bit: set when a change may invalidate the record's
    /// current group membership.
    pub update_needed: bool,
    /// Dedup group membership back-pointer.
    pub dedup_id: Option<String>,
    /// Title blocking keys.
    pub title_keys: Vec<String>,
    /// ISBN blocking keys (normalized ISBN-13).
    pub isbn_keys: Vec<String>,
    /// Format-specific identifier blocking keys.
    pub id_keys: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Source-reported datestamp.
    pub date: DateTime<Utc>,
    /// Transient flag used by the ListIdentifiers deletion sweep.
    pub mark: bool,
}

impl Record {
    /// Create a fresh record shell with all flags cleared.
    pub fn new(id: String, source_id: String, format: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_id,
            oai_id: String::new(),
            format,
            original_data: String::new(),
            normalized_data: String::new(),
            linking_id: String::new(),
            host_record_id: String::new(),
            main_id: String::new(),
            deleted: false,
            update_needed: false,
            dedup_id: None,
            title_keys: Vec::new(),
            isbn_keys: Vec::new(),
            id_keys: Vec::new(),
            created: now,
            updated: now,
            date: now,
            mark: false,
        }
    }

    /// The payload the drivers should work from: normalized when present,
    /// otherwise the original.
    pub fn payload(&self) -> &str {
        if self.normalized_data.is_empty() {
            &self.original_data
        } else {
            &self.normalized_data
        }
    }

    /// Whether this record is a component part of a host record.
    pub fn is_component_part(&self) -> bool {
        !self.host_record_id.is_empty()
    }
}

/// Filter for record queries. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub source_id: Option<String>,
    pub oai_id: Option<String>,
    pub main_id: Option<String>,
    pub host_record_id: Option<String>,
    pub deleted: Option<bool>,
    pub update_needed: Option<bool>,
    pub has_dedup_id: Option<bool>,
    pub updated_since: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub mark: Option<bool>,
}

impl RecordFilter {
    /// Filter for the live records of one source.
    pub fn live_source(source_id: &str) -> Self {
        Self {
            source_id: Some(source_id.to_string()),
            deleted: Some(false),
            ..Default::default()
        }
    }
}
