//! Merged-document synthesis and document-level field helpers.

use serde_json::Value;

use crate::drivers::SolrDoc;

/// Combine the member documents of a dedup group into one merged
/// document: multi-valued fields are unioned in first-seen order,
/// single-valued fields take the first non-empty value.
pub fn merge_documents(group_id: &str, member_docs: &[SolrDoc]) -> SolrDoc {
    let mut merged = SolrDoc::new();

    for doc in member_docs {
        for (field, value) in doc {
            if field == "id" {
                continue;
            }
            match value {
                Value::Array(items) => {
                    for item in items {
                        if let Value::String(s) = item {
                            union_push(&mut merged, field, s);
                        }
                    }
                }
                Value::String(s) if !s.is_empty() => {
                    if !merged.contains_key(field) {
                        merged.insert(field.clone(), value.clone());
                    }
                }
                _ => {}
            }
        }
    }

    merged.insert("id".to_string(), Value::String(group_id.to_string()));
    merged.insert("merged_boolean".to_string(), Value::Bool(true));
    merged
}

fn union_push(doc: &mut SolrDoc, field: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    match doc.get_mut(field) {
        Some(Value::Array(items)) => {
            if !items.iter().any(|v| v.as_str() == Some(value)) {
                items.push(Value::String(value.to_string()));
            }
        }
        Some(_) => {}
        None => {
            doc.insert(
                field.to_string(),
                Value::Array(vec![Value::String(value.to_string())]),
            );
        }
    }
}

/// Remove empty strings, empty arrays and empty array members.
pub fn drop_empty_values(doc: &mut SolrDoc) {
    let keys: Vec<String> = doc.keys().cloned().collect();
    for key in keys {
        let remove = match doc.get_mut(&key) {
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(items)) => {
                items.retain(|v| !matches!(v, Value::String(s) if s.is_empty()));
                items.is_empty()
            }
            Some(Value::Null) => true,
            _ => false,
        };
        if remove {
            doc.remove(&key);
        }
    }
}

/// Explode `building` values into hierarchical facet entries:
/// `["A", "A/2"]` with institution `Inst` becomes
/// `["0/Inst", "1/Inst/A", "2/Inst/A/2"]`.
pub fn explode_building_hierarchy(doc: &mut SolrDoc, institution: &str) {
    let values: Vec<String> = match doc.get("building") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    };

    let mut exploded = vec![format!("0/{institution}")];
    for value in values {
        if value.is_empty() || value.starts_with(|c: char| c.is_ascii_digit()) {
            // already hierarchy-encoded by the driver; keep as is
            exploded.push(value);
            continue;
        }
        let depth = value.split('/').count();
        exploded.push(format!("{depth}/{institution}/{value}"));
    }
    exploded.dedup();

    doc.insert(
        "building".to_string(),
        Value::Array(exploded.into_iter().map(Value::String).collect()),
    );
}
