//! MARC driver over the MARC-in-JSON representation.
//!
//! Payloads look like
//! `{"leader":"...","fields":[{"001":"123"},{"245":{"ind1":"1","ind2":"0",
//! "subfields":[{"a":"Title"}]}}]}`. Field order is preserved; it is
//! significant in MARC.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::{push_field, set_field, DriverError, RecordDriver, Result, SolrDoc};
use crate::ingest::keys::normalize_isbn;

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)").unwrap())
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(1[0-9]{3}|20[0-9]{2})\b").unwrap())
}

#[derive(Debug, Clone)]
enum MarcField {
    Control {
        tag: String,
        value: String,
    },
    Data {
        tag: String,
        ind1: String,
        ind2: String,
        subfields: Vec<(String, String)>,
    },
}

/// MARC format driver.
#[derive(Debug)]
pub struct MarcDriver {
    leader: String,
    fields: Vec<MarcField>,
    oai_id: String,
    source_id: String,
}

impl MarcDriver {
    /// Parse a MARC-in-JSON payload.
    pub fn parse(data: &str, oai_id: &str, source_id: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(data)
            .map_err(|e| DriverError::Parse(format!("invalid MARC JSON: {e}")))?;

        let leader = root
            .get("leader")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let mut fields = Vec::new();
        let raw_fields = root
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| DriverError::Parse("MARC record without fields".to_string()))?;

        for raw in raw_fields {
            let Some(obj) = raw.as_object() else {
                return Err(DriverError::Parse("MARC field is not an object".to_string()));
            };
            let Some((tag, body)) = obj.iter().next() else {
                continue;
            };
            match body {
                Value::String(value) => fields.push(MarcField::Control {
                    tag: tag.clone(),
                    value: value.clone(),
                }),
                Value::Object(data) => {
                    let mut subfields = Vec::new();
                    if let Some(subs) = data.get("subfields").and_then(Value::as_array) {
                        for sub in subs {
                            if let Some(pair) = sub.as_object().and_then(|o| o.iter().next()) {
                                if let Some(text) = pair.1.as_str() {
                                    subfields.push((pair.0.clone(), text.to_string()));
                                }
                            }
                        }
                    }
                    fields.push(MarcField::Data {
                        tag: tag.clone(),
                        ind1: data.get("ind1").and_then(Value::as_str).unwrap_or(" ").to_string(),
                        ind2: data.get("ind2").and_then(Value::as_str).unwrap_or(" ").to_string(),
                        subfields,
                    });
                }
                _ => {
                    return Err(DriverError::Parse(format!("malformed MARC field {tag}")));
                }
            }
        }

        Ok(Self {
            leader,
            fields,
            oai_id: oai_id.to_string(),
            source_id: source_id.to_string(),
        })
    }

    fn control(&self, tag: &str) -> &str {
        self.fields
            .iter()
            .find_map(|f| match f {
                MarcField::Control { tag: t, value } if t == tag => Some(value.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    fn subfield(&self, tag: &str, code: &str) -> &str {
        self.subfields(tag, code).into_iter().next().unwrap_or("")
    }

    fn subfields(&self, tag: &str, code: &str) -> Vec<&str> {
        let mut out = Vec::new();
        for field in &self.fields {
            if let MarcField::Data { tag: t, subfields, .. } = field {
                if t == tag {
                    for (c, value) in subfields {
                        if c == code {
                            out.push(value.as_str());
                        }
                    }
                }
            }
        }
        out
    }

    fn indicator2(&self, tag: &str) -> &str {
        self.fields
            .iter()
            .find_map(|f| match f {
                MarcField::Data { tag: t, ind2, .. } if t == tag => Some(ind2.as_str()),
                _ => None,
            })
            .unwrap_or(" ")
    }

    fn leader_char(&self, index: usize) -> char {
        self.leader.chars().nth(index).unwrap_or(' ')
    }
}

impl RecordDriver for MarcDriver {
    fn id(&self) -> String {
        self.control("001").to_string()
    }

    fn serialize(&self) -> String {
        let mut raw_fields = Vec::new();
        for field in &self.fields {
            let mut obj = serde_json::Map::new();
            match field {
                MarcField::Control { tag, value } => {
                    obj.insert(tag.clone(), Value::String(value.clone()));
                }
                MarcField::Data {
                    tag,
                    ind1,
                    ind2,
                    subfields,
                } => {
                    let mut body = serde_json::Map::new();
                    body.insert("ind1".to_string(), Value::String(ind1.clone()));
                    body.insert("ind2".to_string(), Value::String(ind2.clone()));
                    let subs: Vec<Value> = subfields
                        .iter()
                        .map(|(code, value)| {
                            let mut sub = serde_json::Map::new();
                            sub.insert(code.clone(), Value::String(value.clone()));
                            Value::Object(sub)
                        })
                        .collect();
                    body.insert("subfields".to_string(), Value::Array(subs));
                    obj.insert(tag.clone(), Value::Object(body));
                }
            }
            raw_fields.push(Value::Object(obj));
        }

        let mut root = serde_json::Map::new();
        root.insert("leader".to_string(), Value::String(self.leader.clone()));
        root.insert("fields".to_string(), Value::Array(raw_fields));
        Value::Object(root).to_string()
    }

    fn normalize(&mut self) {
        for field in self.fields.iter_mut() {
            if let MarcField::Data { subfields, .. } = field {
                for (_, value) in subfields.iter_mut() {
                    *value = value.trim().to_string();
                }
                subfields.retain(|(_, value)| !value.is_empty());
            }
        }
        self.fields.retain(|field| match field {
            MarcField::Control { value, .. } => !value.is_empty(),
            MarcField::Data { subfields, .. } => !subfields.is_empty(),
        });
    }

    fn get_host_record_id(&self) -> String {
        let raw = self.subfield("773", "w");
        // "(FI-MELINDA)123456" carries the catalog prefix; linkage uses the
        // bare identifier
        match raw.find(')') {
            Some(pos) if raw.starts_with('(') => raw[pos + 1..].to_string(),
            _ => raw.to_string(),
        }
    }

    fn get_linking_id(&self) -> String {
        let id = self.id();
        if id.is_empty() {
            self.oai_id.clone()
        } else {
            id
        }
    }

    fn get_title(&self, for_filing: bool) -> String {
        let a = self.subfield("245", "a");
        let b = self.subfield("245", "b");
        let mut title = a.trim_end_matches(['/', ':', ';', ' ']).to_string();
        if !b.is_empty() {
            title.push(' ');
            title.push_str(b.trim_end_matches(['/', ':', ';', ' ']));
        }
        if for_filing {
            let skip = self
                .indicator2("245")
                .parse::<usize>()
                .unwrap_or(0)
                .min(title.chars().count());
            title.chars().skip(skip).collect()
        } else {
            title
        }
    }

    fn get_main_author(&self) -> String {
        let author = self.subfield("100", "a");
        if author.is_empty() {
            self.subfield("110", "a").to_string()
        } else {
            author.to_string()
        }
    }

    fn get_isbns(&self) -> Vec<String> {
        let mut isbns = Vec::new();
        for value in self.subfields("020", "a") {
            if let Some(isbn) = normalize_isbn(value) {
                if !isbns.contains(&isbn) {
                    isbns.push(isbn);
                }
            }
        }
        isbns
    }

    fn get_issns(&self) -> Vec<String> {
        let mut issns = Vec::new();
        for value in self.subfields("022", "a") {
            let issn = value.trim().to_uppercase();
            if !issn.is_empty() && !issns.contains(&issn) {
                issns.push(issn);
            }
        }
        issns
    }

    fn get_format(&self) -> String {
        let record_type = self.leader_char(6);
        let bib_level = self.leader_char(7);
        match (record_type, bib_level) {
            ('a', 's') | ('a', 'b') => "Journal",
            ('a', 'a') => "BookSection",
            ('a', _) | ('t', _) => "Book",
            ('e', _) | ('f', _) => "Map",
            ('c', _) | ('d', _) => "MusicalScore",
            ('i', _) | ('j', _) => "SoundRecording",
            ('g', _) => "Video",
            ('m', _) => "Electronic",
            _ => "Other",
        }
        .to_string()
    }

    fn get_publication_year(&self) -> Option<i32> {
        let f008 = self.control("008");
        if f008.len() >= 11 {
            if let Ok(year) = f008[7..11].parse::<i32>() {
                return Some(year);
            }
        }
        for value in self.subfields("260", "c").into_iter().chain(self.subfields("264", "c")) {
            if let Some(m) = year_re().captures(value) {
                return m[1].parse().ok();
            }
        }
        None
    }

    fn get_page_count(&self) -> Option<u32> {
        let physical = self.subfield("300", "a");
        number_re()
            .captures(physical)
            .and_then(|m| m[1].parse().ok())
    }

    fn get_series_issn(&self) -> String {
        let issn = self.subfield("490", "x");
        if issn.is_empty() {
            self.subfield("440", "x").to_string()
        } else {
            issn.to_string()
        }
    }

    fn get_series_numbering(&self) -> String {
        let numbering = self.subfield("490", "v");
        if numbering.is_empty() {
            self.subfield("440", "v").to_string()
        } else {
            numbering.to_string()
        }
    }

    fn get_id_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for value in self.subfields("035", "a") {
            let key = value.trim();
            if !key.is_empty() && !keys.contains(&key.to_string()) {
                keys.push(key.to_string());
            }
        }
        keys
    }

    fn to_solr_array(&self) -> SolrDoc {
        let mut doc = SolrDoc::new();

        set_field(&mut doc, "record_format", "marc");
        set_field(&mut doc, "title", self.get_title(false));
        set_field(&mut doc, "title_short", self.subfield("245", "a").trim_end_matches(['/', ':', ' ']));
        set_field(&mut doc, "title_sort", self.get_title(true).to_lowercase());
        set_field(&mut doc, "author", self.get_main_author());
        for author in self.subfields("700", "a") {
            push_field(&mut doc, "author2", author);
        }
        for author in self.subfields("710", "a") {
            push_field(&mut doc, "author2", author);
        }
        set_field(&mut doc, "format", self.get_format());
        if let Some(year) = self.get_publication_year() {
            set_field(&mut doc, "publishDate", year.to_string());
        }
        for publisher in self.subfields("260", "b").into_iter().chain(self.subfields("264", "b")) {
            push_field(&mut doc, "publisher", publisher.trim_end_matches([',', ' ']));
        }
        set_field(&mut doc, "physical", self.subfield("300", "a"));
        for isbn in self.get_isbns() {
            push_field(&mut doc, "isbn", isbn);
        }
        for issn in self.get_issns() {
            push_field(&mut doc, "issn", issn);
        }
        for topic in self.subfields("650", "a") {
            push_field(&mut doc, "topic", topic);
        }
        for series in self.subfields("490", "a").into_iter().chain(self.subfields("440", "a")) {
            push_field(&mut doc, "series", series);
        }
        let f008 = self.control("008");
        if f008.len() >= 38 {
            let language = f008[35..38].trim();
            set_field(&mut doc, "language", language);
        }
        for building in self.subfields("852", "b") {
            push_field(&mut doc, "building", building);
        }
        set_field(&mut doc, "source_str_mv", self.source_id.clone());

        doc
    }

    fn merge_component_parts(
        &self,
        components: &[Box<dyn RecordDriver>],
        doc: &mut SolrDoc,
    ) -> usize {
        for component in components {
            push_field(doc, "contents", component.get_title(false));
            let author = component.get_main_author();
            if !author.is_empty() {
                push_field(doc, "author2", author);
            }
            for isbn in component.get_isbns() {
                push_field(doc, "isbn", isbn);
            }
        }
        components.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MarcDriver {
        let data = serde_json::json!({
            "leader": "00000cam a22000004i 4500",
            "fields": [
                {"001": "12345"},
                {"008": "970101s1997    xxu           000 0 eng d"},
                {"020": {"ind1": " ", "ind2": " ", "subfields": [{"a": "0-201-03801-3"}]}},
                {"035": {"ind1": " ", "ind2": " ", "subfields": [{"a": "(FI-X)99"}]}},
                {"100": {"ind1": "1", "ind2": " ", "subfields": [{"a": "Knuth, Donald E."}]}},
                {"245": {"ind1": "1", "ind2": "4", "subfields": [{"a": "The Art of Computer Programming /"}, {"b": "Fundamental algorithms"}]}},
                {"260": {"ind1": " ", "ind2": " ", "subfields": [{"b": "Addison-Wesley,"}, {"c": "1997."}]}},
                {"300": {"ind1": " ", "ind2": " ", "subfields": [{"a": "650 p."}]}}
            ]
        })
        .to_string();
        MarcDriver::parse(&data, "oai:x:12345", "s1").unwrap()
    }

    #[test]
    fn test_identity_and_features() {
        let driver = record();
        assert_eq!(driver.id(), "12345");
        assert_eq!(driver.get_linking_id(), "12345");
        assert_eq!(
            driver.get_title(false),
            "The Art of Computer Programming Fundamental algorithms"
        );
        assert_eq!(driver.get_main_author(), "Knuth, Donald E.");
        assert_eq!(driver.get_isbns(), vec!["9780201038019".to_string()]);
        assert_eq!(driver.get_publication_year(), Some(1997));
        assert_eq!(driver.get_page_count(), Some(650));
        assert_eq!(driver.get_format(), "Book");
        assert_eq!(driver.get_id_keys(), vec!["(FI-X)99".to_string()]);
    }

    #[test]
    fn test_filing_title_skips_nonfiling_chars() {
        let driver = record();
        assert!(driver.get_title(true).starts_with("Art of Computer"));
    }

    #[test]
    fn test_host_record_id_strips_prefix() {
        let data = serde_json::json!({
            "leader": "00000naa a22000004i 4500",
            "fields": [
                {"001": "c1"},
                {"773": {"ind1": "0", "ind2": " ", "subfields": [{"w": "(FI-X)12345"}]}}
            ]
        })
        .to_string();
        let driver = MarcDriver::parse(&data, "", "s1").unwrap();
        assert_eq!(driver.get_host_record_id(), "12345");
    }

    #[test]
    fn test_serialize_round_trip() {
        let driver = record();
        let reparsed = MarcDriver::parse(&driver.serialize(), "", "s1").unwrap();
        assert_eq!(reparsed.serialize(), driver.serialize());
    }

    #[test]
    fn test_normalize_drops_empty_subfields() {
        let data = serde_json::json!({
            "leader": "",
            "fields": [
                {"245": {"ind1": " ", "ind2": " ", "subfields": [{"a": "  T  "}, {"b": "   "}]}}
            ]
        })
        .to_string();
        let mut driver = MarcDriver::parse(&data, "", "s1").unwrap();
        driver.normalize();
        assert_eq!(driver.subfields("245", "b"), Vec::<&str>::new());
        assert_eq!(driver.subfield("245", "a"), "T");
    }

    #[test]
    fn test_missing_fields_is_parse_error() {
        assert!(MarcDriver::parse("{}", "", "s1").is_err());
        assert!(MarcDriver::parse("not json", "", "s1").is_err());
    }
}
