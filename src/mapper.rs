//! Declarative field-value remapping.
//!
//! Each data source may attach an ordered list of mapping files to a Solr
//! field. A mapping file is a newline-delimited `key = value` table with
//! `;` comments, `[]` list-append keys and the special fallback keys
//! `##default`, `##empty` and `##emptyarray`. Three flavors exist: exact
//! lookup, first-match regexp and collect-all regexp.
//!
//! Hierarchical values (`"A1/2"`) are mapped level by level, the mapping
//! entry index selecting the file for each level, and expand into the
//! cumulative prefixes of the mapped hierarchy.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{DataSourceConfig, MappingKind};

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("Malformed mapping in {file} line {line}: missing ' = '")]
    Malformed { file: String, line: usize },
    #[error("Invalid regexp in {file}: {pattern}: {source}")]
    InvalidRegex {
        file: String,
        pattern: String,
        source: regex::Error,
    },
    #[error("Cannot read mapping file {file}: {source}")]
    Io {
        file: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, MappingError>;

/// One parsed mapping file.
#[derive(Debug)]
pub struct MappingFile {
    kind: MappingKind,
    /// Exact-lookup table, `[]`-appended values collected per key.
    map: HashMap<String, Vec<String>>,
    /// Pattern table in file order, compiled for the regexp kinds.
    patterns: Vec<(Regex, String)>,
    default_value: Option<String>,
    empty_value: Option<String>,
    empty_array: Option<Vec<String>>,
}

impl MappingFile {
    /// Parse a mapping file from disk.
    pub fn load(path: &Path, kind: MappingKind) -> Result<Self> {
        let name = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|e| MappingError::Io {
            file: name.clone(),
            source: e,
        })?;
        Self::parse(&name, &content, kind)
    }

    /// Parse mapping file content.
    pub fn parse(file: &str, content: &str, kind: MappingKind) -> Result<Self> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        let mut order: Vec<(String, String)> = Vec::new();
        let mut default_value = None;
        let mut empty_value = None;
        let mut empty_array: Option<Vec<String>> = None;

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') {
                continue;
            }
            // split on the raw line: "key = " legitimately maps to empty
            let Some((key, value)) = line.split_once(" = ") else {
                return Err(MappingError::Malformed {
                    file: file.to_string(),
                    line: lineno + 1,
                });
            };
            let mut key = key.trim().to_string();
            let value = value.trim().to_string();

            let append = key.ends_with("[]");
            if append {
                key.truncate(key.len() - 2);
            }

            match key.as_str() {
                "##default" => default_value = Some(value),
                "##empty" => empty_value = Some(value),
                "##emptyarray" => empty_array.get_or_insert_with(Vec::new).push(value),
                _ => {
                    let entry = map.entry(key.clone()).or_default();
                    if append || entry.is_empty() {
                        entry.push(value.clone());
                    } else {
                        *entry = vec![value.clone()];
                    }
                    order.push((key, value));
                }
            }
        }

        let mut patterns = Vec::new();
        if matches!(kind, MappingKind::Regexp | MappingKind::RegexpMulti) {
            for (pattern, replacement) in &order {
                let re = Regex::new(pattern).map_err(|e| MappingError::InvalidRegex {
                    file: file.to_string(),
                    pattern: pattern.clone(),
                    source: e,
                })?;
                patterns.push((re, replacement.clone()));
            }
        }

        Ok(Self {
            kind,
            map,
            patterns,
            default_value,
            empty_value,
            empty_array,
        })
    }

    /// Map a single non-empty value. Unmapped values fall back to
    /// `##default` when present, else pass through unchanged.
    fn map_value(&self, value: &str) -> Vec<String> {
        match self.kind {
            MappingKind::Normal => match self.map.get(value) {
                Some(mapped) => mapped.clone(),
                None => vec![self
                    .default_value
                    .clone()
                    .unwrap_or_else(|| value.to_string())],
            },
            MappingKind::Regexp => {
                for (re, replacement) in &self.patterns {
                    if re.is_match(value) {
                        return vec![re.replace_all(value, replacement.as_str()).into_owned()];
                    }
                }
                vec![self
                    .default_value
                    .clone()
                    .unwrap_or_else(|| value.to_string())]
            }
            MappingKind::RegexpMulti => {
                let mut out = Vec::new();
                for (re, replacement) in &self.patterns {
                    if re.is_match(value) {
                        out.push(re.replace_all(value, replacement.as_str()).into_owned());
                    }
                }
                if out.is_empty() {
                    out.push(
                        self.default_value
                            .clone()
                            .unwrap_or_else(|| value.to_string()),
                    );
                }
                out
            }
        }
    }
}

/// Field mapper for all configured data sources, constructed once per run.
#[derive(Debug, Default)]
pub struct FieldMapper {
    /// source id -> field name -> mapping files in configuration order.
    mappings: HashMap<String, HashMap<String, Vec<MappingFile>>>,
}

impl FieldMapper {
    /// Build the mapper from per-source configuration, loading every
    /// referenced mapping file from `mappings_dir`.
    pub fn load(mappings_dir: &Path, sources: &HashMap<String, DataSourceConfig>) -> Result<Self> {
        let mut mappings: HashMap<String, HashMap<String, Vec<MappingFile>>> = HashMap::new();
        for (source_id, source) in sources {
            for (field, entries) in &source.field_mappings {
                let mut files = Vec::new();
                for entry in entries {
                    let path: PathBuf = mappings_dir.join(&entry.file);
                    files.push(MappingFile::load(&path, entry.kind)?);
                }
                mappings
                    .entry(source_id.clone())
                    .or_default()
                    .insert(field.clone(), files);
            }
        }
        Ok(Self { mappings })
    }

    /// Build a mapper from already-parsed mapping files.
    pub fn from_parsed(
        mappings: HashMap<String, HashMap<String, Vec<MappingFile>>>,
    ) -> Self {
        Self { mappings }
    }

    /// Whether any field of a source has mappings configured.
    pub fn has_mappings(&self, source_id: &str) -> bool {
        self.mappings.get(source_id).is_some_and(|m| !m.is_empty())
    }

    /// Remap every configured field present in the document.
    pub fn map_values(&self, source_id: &str, doc: &mut serde_json::Map<String, Value>) {
        let Some(fields) = self.mappings.get(source_id) else {
            return;
        };

        for (field, files) in fields {
            let Some(value) = doc.get(field) else {
                continue;
            };
            let (inputs, was_array) = match value {
                Value::String(s) => (vec![s.clone()], false),
                Value::Array(items) => (
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect(),
                    true,
                ),
                _ => continue,
            };

            let mut outputs: Vec<String> = Vec::new();
            for input in &inputs {
                outputs.extend(Self::map_one(files, input));
            }
            if outputs == inputs {
                // nothing mapped; leave the field untouched
                continue;
            }

            // de-duplicate preserving first-seen order, drop mapped-away values
            let mut seen = std::collections::HashSet::new();
            let outputs: Vec<String> = outputs
                .into_iter()
                .filter(|v| !v.is_empty() && seen.insert(v.clone()))
                .collect();

            let mapped = if was_array || outputs.len() != 1 {
                Value::Array(outputs.into_iter().map(Value::String).collect())
            } else {
                Value::String(outputs.into_iter().next().unwrap())
            };
            doc.insert(field.clone(), mapped);
        }
    }

    fn map_one(files: &[MappingFile], input: &str) -> Vec<String> {
        if files.is_empty() {
            return vec![input.to_string()];
        }

        if input.is_empty() {
            let first = &files[0];
            if let Some(values) = &first.empty_array {
                return values.clone();
            }
            if let Some(value) = &first.empty_value {
                return vec![value.clone()];
            }
            return vec![input.to_string()];
        }

        if input.contains('/') && files.len() > 1 {
            return Self::map_hierarchy(files, input);
        }

        // chain the files in order, feeding each one's output into the next
        let mut values = vec![input.to_string()];
        for file in files {
            values = values
                .iter()
                .flat_map(|v| file.map_value(v))
                .collect();
        }
        values
    }

    /// Map one hierarchical value level by level. Level `i` uses mapping
    /// file `i` (the last file covers any deeper levels). An empty mapped
    /// level truncates the hierarchy. The output is the list of cumulative
    /// prefixes of the mapped levels.
    fn map_hierarchy(files: &[MappingFile], input: &str) -> Vec<String> {
        let mut mapped_levels: Vec<String> = Vec::new();
        for (i, level) in input.split('/').enumerate() {
            let file = files.get(i).unwrap_or_else(|| files.last().unwrap());
            let mapped = file
                .map_value(level)
                .into_iter()
                .next()
                .unwrap_or_default();
            if mapped.is_empty() {
                break;
            }
            mapped_levels.push(mapped);
        }

        let mut out = Vec::new();
        for i in 0..mapped_levels.len() {
            out.push(mapped_levels[..=i].join("/"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapper_for(
        field: &str,
        files: Vec<MappingFile>,
    ) -> FieldMapper {
        let mut by_field = HashMap::new();
        by_field.insert(field.to_string(), files);
        let mut by_source = HashMap::new();
        by_source.insert("s1".to_string(), by_field);
        FieldMapper::from_parsed(by_source)
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        let err = MappingFile::parse("t.map", "foo=bar", MappingKind::Normal).unwrap_err();
        assert!(matches!(err, MappingError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_parse_comments_and_append() {
        let file = MappingFile::parse(
            "t.map",
            "; comment\nk = v1\nk[] = v2\n\n##default = other\n",
            MappingKind::Normal,
        )
        .unwrap();
        assert_eq!(file.map.get("k").unwrap(), &vec!["v1".to_string(), "v2".to_string()]);
        assert_eq!(file.default_value.as_deref(), Some("other"));
    }

    #[test]
    fn test_normal_mapping_with_default() {
        let file =
            MappingFile::parse("t.map", "fi = Finnish\n##default = Other\n", MappingKind::Normal)
                .unwrap();
        let mapper = mapper_for("language", vec![file]);

        let mut doc = serde_json::Map::new();
        doc.insert("language".into(), json!(["fi", "sv"]));
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc["language"], json!(["Finnish", "Other"]));
    }

    #[test]
    fn test_regexp_first_match_wins() {
        let file = MappingFile::parse(
            "t.map",
            "^CD = disc\n^C = other\n",
            MappingKind::Regexp,
        )
        .unwrap();
        let mapper = mapper_for("format", vec![file]);

        let mut doc = serde_json::Map::new();
        doc.insert("format".into(), json!("CD-ROM"));
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc["format"], json!("disc-ROM"));
    }

    #[test]
    fn test_regexp_multi_collects_all_matches() {
        let file = MappingFile::parse(
            "t.map",
            "map = cartographic\npaper = physical\n",
            MappingKind::RegexpMulti,
        )
        .unwrap();
        let mapper = mapper_for("format", vec![file]);

        let mut doc = serde_json::Map::new();
        doc.insert("format".into(), json!("paper map"));
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc["format"], json!(["cartographic", "physical"]));
    }

    #[test]
    fn test_array_values_deduplicated_first_seen() {
        let file = MappingFile::parse("t.map", "a = x\nb = x\n", MappingKind::Normal).unwrap();
        let mapper = mapper_for("f", vec![file]);

        let mut doc = serde_json::Map::new();
        doc.insert("f".into(), json!(["a", "b"]));
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc["f"], json!(["x"]));
    }

    #[test]
    fn test_empty_value_mapping() {
        let file =
            MappingFile::parse("t.map", "##empty = Unknown\n", MappingKind::Normal).unwrap();
        let mapper = mapper_for("f", vec![file]);

        let mut doc = serde_json::Map::new();
        doc.insert("f".into(), json!(""));
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc["f"], json!("Unknown"));
    }

    #[test]
    fn test_hierarchy_mapping_expands_prefixes() {
        let level0 = MappingFile::parse("l0.map", "A1 = A\n", MappingKind::Normal).unwrap();
        let level1 = MappingFile::parse("l1.map", "2 = 2\n", MappingKind::Normal).unwrap();
        let mapper = mapper_for("building", vec![level0, level1]);

        let mut doc = serde_json::Map::new();
        doc.insert("building".into(), json!(["A1/2"]));
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc["building"], json!(["A", "A/2"]));
    }

    #[test]
    fn test_hierarchy_truncated_on_empty_level() {
        let level0 = MappingFile::parse("l0.map", "A1 = A\n", MappingKind::Normal).unwrap();
        let level1 = MappingFile::parse("l1.map", "2 = \n##default = \n", MappingKind::Normal)
            .unwrap();
        let mapper = mapper_for("building", vec![level0, level1]);

        let mut doc = serde_json::Map::new();
        doc.insert("building".into(), json!(["A1/2"]));
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc["building"], json!(["A"]));
    }

    #[test]
    fn test_normal_mapping_idempotent() {
        let file = MappingFile::parse("t.map", "x = y\n", MappingKind::Normal).unwrap();
        let mapper = mapper_for("f", vec![file]);

        let mut doc = serde_json::Map::new();
        doc.insert("f".into(), json!("x"));
        mapper.map_values("s1", &mut doc);
        let once = doc.clone();
        mapper.map_values("s1", &mut doc);
        assert_eq!(doc, once);
    }
}
