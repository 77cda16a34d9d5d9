//! Dublin Core driver.
//!
//! Payloads are the `oai_dc` XML container (or any element whose children
//! are DC elements). Elements are kept in document order as lowercased
//! local names, so qualified forms like `dcterms:isPartOf` land under
//! `ispartof`.

use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::sync::OnceLock;

use super::{push_field, set_field, strip_filing_articles, DriverError, RecordDriver, Result, SolrDoc};
use crate::ingest::keys::normalize_isbn;

fn issn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4}-\d{3}[\dxX])\b").unwrap())
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(1[0-9]{3}|20[0-9]{2})\b").unwrap())
}

/// Dublin Core format driver.
#[derive(Debug)]
pub struct DcDriver {
    /// `(lowercased local name, text)` in document order.
    fields: Vec<(String, String)>,
    oai_id: String,
    source_id: String,
}

impl DcDriver {
    /// Parse a DC payload.
    pub fn parse(data: &str, oai_id: &str, source_id: &str) -> Result<Self> {
        let mut reader = Reader::from_str(data);

        let mut fields = Vec::new();
        let mut depth = 0usize;
        let mut current: Option<String> = None;
        let mut text = String::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    depth += 1;
                    if depth == 2 {
                        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                        current = Some(name);
                        text.clear();
                    }
                }
                Ok(Event::Text(ref e)) => {
                    if current.is_some() {
                        if let Ok(decoded) = e.decode() {
                            if let Ok(t) = quick_xml::escape::unescape(&decoded) {
                                text.push_str(&t);
                            }
                        }
                    }
                }
                Ok(Event::GeneralRef(ref e)) => {
                    if current.is_some() {
                        if let Ok(Some(ch)) = e.resolve_char_ref() {
                            text.push(ch);
                        } else if let Ok(name) = e.decode() {
                            if let Some(resolved) = quick_xml::escape::resolve_predefined_entity(&name) {
                                text.push_str(resolved);
                            }
                        }
                    }
                }
                Ok(Event::CData(ref e)) => {
                    if current.is_some() {
                        if let Ok(t) = std::str::from_utf8(e.as_ref()) {
                            text.push_str(t);
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    if depth == 2 {
                        if let Some(name) = current.take() {
                            fields.push((name, text.trim().to_string()));
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                Ok(Event::Empty(ref e)) => {
                    if depth == 1 {
                        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                        fields.push((name, String::new()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(DriverError::Parse(format!("invalid DC XML: {e}"))),
            }
        }

        if depth != 0 {
            return Err(DriverError::Parse("unclosed DC element".to_string()));
        }

        Ok(Self {
            fields,
            oai_id: oai_id.to_string(),
            source_id: source_id.to_string(),
        })
    }

    fn first(&self, name: &str) -> &str {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    fn all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

impl RecordDriver for DcDriver {
    fn id(&self) -> String {
        self.first("identifier").to_string()
    }

    fn serialize(&self) -> String {
        let mut out = String::from("<dc>");
        for (name, value) in &self.fields {
            out.push('<');
            out.push_str(name);
            out.push('>');
            out.push_str(&quick_xml::escape::escape(value.as_str()));
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        out.push_str("</dc>");
        out
    }

    fn normalize(&mut self) {
        // trim values and drop empty elements
        for (_, value) in self.fields.iter_mut() {
            *value = value.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        self.fields.retain(|(_, value)| !value.is_empty());
    }

    fn get_host_record_id(&self) -> String {
        self.first("ispartof").to_string()
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
        let title = self.first("title");
        if for_filing {
            strip_filing_articles(title)
        } else {
            title.to_string()
        }
    }

    fn get_main_author(&self) -> String {
        self.first("creator").to_string()
    }

    fn get_isbns(&self) -> Vec<String> {
        let mut isbns = Vec::new();
        for value in self.all("identifier") {
            let candidate = value
                .trim_start_matches("urn:")
                .trim_start_matches("URN:")
                .trim_start_matches("isbn:")
                .trim_start_matches("ISBN:")
                .trim_start_matches("ISBN ")
                .trim();
            if let Some(isbn) = normalize_isbn(candidate) {
                if !isbns.contains(&isbn) {
                    isbns.push(isbn);
                }
            }
        }
        isbns
    }

    fn get_issns(&self) -> Vec<String> {
        let mut issns = Vec::new();
        for (name, value) in &self.fields {
            if name != "identifier" && name != "relation" {
                continue;
            }
            if let Some(m) = issn_re().captures(value) {
                let issn = m[1].to_uppercase();
                if !issns.contains(&issn) {
                    issns.push(issn);
                }
            }
        }
        issns
    }

    fn get_format(&self) -> String {
        let value = self.first("type");
        if value.is_empty() {
            "Unknown".to_string()
        } else {
            value.to_string()
        }
    }

    fn get_publication_year(&self) -> Option<i32> {
        for value in self.all("date") {
            if let Some(m) = year_re().captures(value) {
                return m[1].parse().ok();
            }
        }
        None
    }

    fn get_page_count(&self) -> Option<u32> {
        for value in self.all("format") {
            let lowered = value.to_lowercase();
            if let Some(rest) = lowered.split(" p").next() {
                if let Ok(pages) = rest.trim().parse::<u32>() {
                    return Some(pages);
                }
            }
        }
        None
    }

    fn get_series_issn(&self) -> String {
        String::new()
    }

    fn get_series_numbering(&self) -> String {
        String::new()
    }

    fn to_solr_array(&self) -> SolrDoc {
        let mut doc = SolrDoc::new();

        set_field(&mut doc, "record_format", "dc");
        set_field(&mut doc, "title", self.get_title(false));
        set_field(&mut doc, "title_short", self.get_title(false));
        set_field(&mut doc, "title_sort", self.get_title(true).to_lowercase());
        set_field(&mut doc, "author", self.get_main_author());
        for creator in self.all("creator").iter().skip(1) {
            push_field(&mut doc, "author2", *creator);
        }
        for contributor in self.all("contributor") {
            push_field(&mut doc, "author2", contributor);
        }
        set_field(&mut doc, "format", self.get_format());
        for subject in self.all("subject") {
            push_field(&mut doc, "topic", subject);
        }
        for description in self.all("description") {
            push_field(&mut doc, "description", description);
        }
        for publisher in self.all("publisher") {
            push_field(&mut doc, "publisher", publisher);
        }
        for language in self.all("language") {
            push_field(&mut doc, "language", language);
        }
        if let Some(year) = self.get_publication_year() {
            set_field(&mut doc, "publishDate", year.to_string());
        }
        for isbn in self.get_isbns() {
            push_field(&mut doc, "isbn", isbn);
        }
        for issn in self.get_issns() {
            push_field(&mut doc, "issn", issn);
        }
        for rights in self.all("rights") {
            push_field(&mut doc, "rights", rights);
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
        }
        components.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAOCP: &str = r#"
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/"
                   xmlns:dc="http://purl.org/dc/elements/1.1/">
            <dc:title>The Art of Computer Programming</dc:title>
            <dc:creator>Knuth, Donald E.</dc:creator>
            <dc:identifier>taocp-1</dc:identifier>
            <dc:identifier>ISBN 0-201-03801-3</dc:identifier>
            <dc:date>1997</dc:date>
            <dc:type>Book</dc:type>
            <dc:language>eng</dc:language>
        </oai_dc:dc>"#;

    #[test]
    fn test_parse_and_extract() {
        let driver = DcDriver::parse(TAOCP, "oai:x:1", "s1").unwrap();
        assert_eq!(driver.id(), "taocp-1");
        assert_eq!(driver.get_title(false), "The Art of Computer Programming");
        assert_eq!(driver.get_title(true), "Art of Computer Programming");
        assert_eq!(driver.get_main_author(), "Knuth, Donald E.");
        assert_eq!(driver.get_isbns(), vec!["9780201038019".to_string()]);
        assert_eq!(driver.get_publication_year(), Some(1997));
        assert_eq!(driver.get_format(), "Book");
        assert_eq!(driver.get_host_record_id(), "");
    }

    #[test]
    fn test_normalize_drops_empty_and_collapses() {
        let xml = "<dc><title>  A   Title </title><creator></creator></dc>";
        let mut driver = DcDriver::parse(xml, "", "s1").unwrap();
        driver.normalize();
        assert_eq!(driver.serialize(), "<dc><title>A Title</title></dc>");
    }

    #[test]
    fn test_serialize_escapes() {
        let xml = "<dc><title>Cats &amp; Dogs</title></dc>";
        let driver = DcDriver::parse(xml, "", "s1").unwrap();
        assert_eq!(driver.serialize(), "<dc><title>Cats &amp; Dogs</title></dc>");
    }

    #[test]
    fn test_invalid_xml_is_parse_error() {
        assert!(matches!(
            DcDriver::parse("<dc><title>open", "", "s1"),
            Err(DriverError::Parse(_))
        ));
    }

    #[test]
    fn test_solr_array_fields() {
        let driver = DcDriver::parse(TAOCP, "oai:x:1", "s1").unwrap();
        let doc = driver.to_solr_array();
        assert_eq!(doc["title"], serde_json::json!("The Art of Computer Programming"));
        assert_eq!(doc["isbn"], serde_json::json!(["9780201038019"]));
        assert_eq!(doc["publishDate"], serde_json::json!("1997"));
    }
}
