//! Data models for bibfuse.

mod group;
mod record;

pub use group::DedupGroup;
pub use record::{Record, RecordFilter};

/// State key for the last successful harvest window of a source.
pub fn last_harvest_date_key(source_id: &str) -> String {
    format!("Last Harvest Date {source_id}")
}

/// State key for the last clean Solr index checkpoint of a source.
pub fn last_index_update_key(source_id: &str) -> String {
    format!("Last Index Update {source_id}")
}

/// State key for the last deletion-reconciliation sweep of a source.
pub fn last_deletion_key(source_id: &str) -> String {
    format!("Last Deletion Processing Time {source_id}")
}

/// State key for a persisted OAI-PMH resumption token.
pub fn resumption_token_key(source_id: &str) -> String {
    format!("Resumption Token {source_id}")
}
