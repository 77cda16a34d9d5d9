//! Sierra REST API harvesting: offset-paged bib listing with embedded
//! MARC-in-JSON payloads and per-entry deletion flags.

use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use super::{HarvestError, Result};

/// Entries requested per page.
pub const PAGE_SIZE: u64 = 500;

/// One bib entry from the listing.
#[derive(Debug, Clone)]
pub struct SierraEntry {
    pub id: String,
    pub deleted: bool,
    /// MARC-in-JSON payload; empty for deleted entries.
    pub payload: String,
}

/// Build a bib listing request.
pub fn build_request(
    base_url: &str,
    offset: u64,
    limit: u64,
    from: Option<DateTime<Utc>>,
    until: DateTime<Utc>,
) -> Result<String> {
    let base = format!("{}/bibs", base_url.trim_end_matches('/'));
    let mut url =
        Url::parse(&base).map_err(|e| HarvestError::Parse(format!("bad base URL: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("offset", &offset.to_string());
        query.append_pair("limit", &limit.to_string());
        query.append_pair("fields", "id,deleted,marc");
        query.append_pair("deleted", "false");
        let from = from
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_default();
        query.append_pair(
            "updatedDate",
            &format!("[{},{}]", from, until.format("%Y-%m-%dT%H:%M:%SZ")),
        );
    }
    Ok(url.to_string())
}

/// Parse a bib listing response.
pub fn parse_response(json: &str) -> Result<Vec<SierraEntry>> {
    let root: Value = serde_json::from_str(json)
        .map_err(|e| HarvestError::Parse(format!("invalid Sierra response: {e}")))?;
    let Some(entries) = root.get("entries").and_then(Value::as_array) else {
        // an empty window returns a 404-shaped body with a code field
        if root.get("code").is_some() {
            return Ok(Vec::new());
        }
        return Err(HarvestError::Parse(
            "Sierra response without entries".to_string(),
        ));
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = match entry.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(HarvestError::Parse(
                    "Sierra entry without id".to_string(),
                ))
            }
        };
        let deleted = entry.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        let payload = entry
            .get("marc")
            .map(|marc| marc.to_string())
            .unwrap_or_default();
        out.push(SierraEntry { id, deleted, payload });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request() {
        let until = DateTime::parse_from_rfc3339("2024-02-01T00:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        let url = build_request("https://sierra.example.org/iii/v6", 500, 500, None, until).unwrap();
        assert!(url.contains("/bibs?"));
        assert!(url.contains("offset=500"));
        assert!(url.contains("2024-02-01"));
    }

    #[test]
    fn test_parse_entries() {
        let json = r#"{
            "total": 2,
            "entries": [
                {"id": 100, "deleted": false, "marc": {"leader": "", "fields": [{"001": "100"}]}},
                {"id": "101", "deleted": true}
            ]
        }"#;
        let entries = parse_response(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "100");
        assert!(entries[0].payload.contains("\"001\""));
        assert!(entries[1].deleted);
        assert!(entries[1].payload.is_empty());
    }

    #[test]
    fn test_parse_empty_window() {
        let json = r#"{"code": 107, "specificCode": 0, "httpStatus": 404, "name": "Record not found"}"#;
        assert!(parse_response(json).unwrap().is_empty());
    }
}
