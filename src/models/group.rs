//! Dedup group model: an equivalence class of records across sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A deduplication group.
///
/// Groups own the membership list; records only hold a single `dedup_id`
/// back-pointer. A live group always spans at least two distinct sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupGroup {
    pub id: String,
    /// Record ids currently claiming membership.
    pub ids: Vec<String>,
    pub deleted: bool,
    /// Set when membership changed since the last index update.
    pub changed: bool,
    pub updated: DateTime<Utc>,
}

impl DedupGroup {
    /// Create a new group with a random id over the given members.
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            ids,
            deleted: false,
            changed: true,
            updated: Utc::now(),
        }
    }

    /// Whether the group still spans two distinct sources, given that
    /// member ids are prefixed with `"{source_id}."`.
    pub fn spans_two_sources(&self) -> bool {
        let mut first: Option<&str> = None;
        for id in &self.ids {
            let source = id.split('.').next().unwrap_or("");
            match first {
                None => first = Some(source),
                Some(s) if s != source => return true,
                Some(_) => {}
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_two_sources() {
        let mut group = DedupGroup::new(vec!["s1.a".into(), "s2.b".into()]);
        assert!(group.spans_two_sources());

        group.ids = vec!["s1.a".into(), "s1.b".into()];
        assert!(!group.spans_two_sources());

        group.ids = vec!["s1.a".into()];
        assert!(!group.spans_two_sources());
    }
}
