//! OAI-PMH protocol support: request URL building and envelope parsing.
//!
//! The metadata payload of each record is carried through verbatim as a
//! serialized XML subtree; format drivers take it from there.

use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use url::Url;

use super::{HarvestError, Result};

/// Record header from `ListRecords`/`ListIdentifiers`.
#[derive(Debug, Clone)]
pub struct OaiHeader {
    pub identifier: String,
    pub datestamp: String,
    pub deleted: bool,
}

/// One harvested record: header plus serialized metadata payload. The
/// payload is empty for deletion records.
#[derive(Debug, Clone)]
pub struct OaiRecord {
    pub header: OaiHeader,
    pub payload: String,
}

/// One parsed response page.
#[derive(Debug, Default)]
pub struct OaiPage {
    /// Records from `ListRecords`.
    pub records: Vec<OaiRecord>,
    /// Bare headers from `ListIdentifiers`.
    pub headers: Vec<OaiHeader>,
    pub resumption_token: Option<String>,
}

/// Build a `ListRecords`/`ListIdentifiers` request URL.
pub fn build_request(
    base_url: &str,
    verb: &str,
    metadata_prefix: &str,
    set: Option<&str>,
    from: Option<&str>,
    until: Option<&str>,
    resumption_token: Option<&str>,
) -> Result<String> {
    let mut url =
        Url::parse(base_url).map_err(|e| HarvestError::Parse(format!("bad base URL: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("verb", verb);
        if let Some(token) = resumption_token {
            // an exclusive argument per the protocol
            query.append_pair("resumptionToken", token);
        } else {
            query.append_pair("metadataPrefix", metadata_prefix);
            if let Some(set) = set {
                query.append_pair("set", set);
            }
            if let Some(from) = from {
                query.append_pair("from", from);
            }
            if let Some(until) = until {
                query.append_pair("until", until);
            }
        }
    }
    Ok(url.to_string())
}

/// Parse one OAI-PMH response page.
///
/// `noRecordsMatch` yields an empty page; `badResumptionToken` surfaces as
/// an expired-token error for the operator; other protocol errors fail the
/// page.
pub fn parse_response(xml: &str) -> Result<OaiPage> {
    let mut reader = Reader::from_str(xml);

    let mut page = OaiPage::default();
    let mut path: Vec<String> = Vec::new();
    let mut header: Option<OaiHeader> = None;
    let mut record_payload: Option<String> = None;
    let mut text = String::new();
    let mut error_code: Option<String> = None;
    let mut metadata_writer: Option<Writer<Vec<u8>>> = None;
    let mut metadata_depth = 0usize;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| HarvestError::Parse(format!("invalid OAI-PMH response: {e}")))?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();

                if let Some(writer) = metadata_writer.as_mut() {
                    metadata_depth += 1;
                    writer
                        .write_event(Event::Start(e))
                        .map_err(|e| HarvestError::Parse(e.to_string()))?;
                    path.push(name);
                    continue;
                }

                match name.as_str() {
                    "header" => {
                        let mut deleted = false;
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"status" {
                                deleted = attr
                                    .unescape_value()
                                    .map(|v| v == "deleted")
                                    .unwrap_or(false);
                            }
                        }
                        header = Some(OaiHeader {
                            identifier: String::new(),
                            datestamp: String::new(),
                            deleted,
                        });
                    }
                    "metadata" => {
                        metadata_writer = Some(Writer::new(Vec::new()));
                        metadata_depth = 0;
                    }
                    "error" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"code" {
                                error_code =
                                    attr.unescape_value().ok().map(|v| v.into_owned());
                            }
                        }
                    }
                    _ => {}
                }
                text.clear();
                path.push(name);
            }
            Event::End(e) => {
                let name = path.pop().unwrap_or_default();

                if let Some(writer) = metadata_writer.as_mut() {
                    if name == "metadata" && metadata_depth == 0 {
                        let bytes = metadata_writer.take().unwrap().into_inner();
                        record_payload =
                            Some(String::from_utf8_lossy(&bytes).into_owned());
                        continue;
                    }
                    metadata_depth = metadata_depth.saturating_sub(1);
                    writer
                        .write_event(Event::End(e))
                        .map_err(|e| HarvestError::Parse(e.to_string()))?;
                    continue;
                }

                match name.as_str() {
                    "identifier" => {
                        if let Some(h) = header.as_mut() {
                            h.identifier = text.trim().to_string();
                        }
                    }
                    "datestamp" => {
                        if let Some(h) = header.as_mut() {
                            h.datestamp = text.trim().to_string();
                        }
                    }
                    "header" => {
                        // bare headers belong to ListIdentifiers responses
                        if path.last().map(String::as_str) == Some("ListIdentifiers") {
                            if let Some(h) = header.take() {
                                page.headers.push(h);
                            }
                        }
                    }
                    "record" => {
                        if let Some(h) = header.take() {
                            page.records.push(OaiRecord {
                                header: h,
                                payload: record_payload.take().unwrap_or_default(),
                            });
                        }
                    }
                    "resumptionToken" => {
                        let token = text.trim().to_string();
                        if !token.is_empty() {
                            page.resumption_token = Some(token);
                        }
                    }
                    "error" => {
                        let code = error_code.take().unwrap_or_default();
                        let message = text.trim().to_string();
                        match code.as_str() {
                            "noRecordsMatch" => {}
                            "badResumptionToken" => {
                                return Err(HarvestError::TokenExpired(message));
                            }
                            _ => {
                                return Err(HarvestError::Parse(format!(
                                    "OAI-PMH error {code}: {message}"
                                )));
                            }
                        }
                    }
                    _ => {}
                }
                text.clear();
            }
            Event::Empty(e) => {
                if let Some(writer) = metadata_writer.as_mut() {
                    writer
                        .write_event(Event::Empty(e))
                        .map_err(|e| HarvestError::Parse(e.to_string()))?;
                }
            }
            Event::Text(e) => {
                if let Some(writer) = metadata_writer.as_mut() {
                    writer
                        .write_event(Event::Text(e))
                        .map_err(|e| HarvestError::Parse(e.to_string()))?;
                } else if let Ok(decoded) = e.decode() {
                    if let Ok(t) = quick_xml::escape::unescape(&decoded) {
                        text.push_str(&t);
                    }
                }
            }
            Event::CData(e) => {
                if let Some(writer) = metadata_writer.as_mut() {
                    writer
                        .write_event(Event::CData(e))
                        .map_err(|e| HarvestError::Parse(e.to_string()))?;
                }
            }
            Event::GeneralRef(ref e) => {
                if let Some(writer) = metadata_writer.as_mut() {
                    writer
                        .write_event(Event::GeneralRef(e.borrow()))
                        .map_err(|e| HarvestError::Parse(e.to_string()))?;
                } else if let Ok(Some(ch)) = e.resolve_char_ref() {
                    text.push(ch);
                } else if let Ok(name) = e.decode() {
                    if let Some(resolved) = quick_xml::escape::resolve_predefined_entity(&name) {
                        text.push_str(resolved);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_with_window() {
        let url = build_request(
            "https://example.org/oai",
            "ListRecords",
            "oai_dc",
            Some("books"),
            Some("2024-01-01T00:00:00Z"),
            None,
            None,
        )
        .unwrap();
        assert!(url.contains("verb=ListRecords"));
        assert!(url.contains("metadataPrefix=oai_dc"));
        assert!(url.contains("set=books"));
        assert!(url.contains("from=2024-01-01"));
    }

    #[test]
    fn test_build_request_with_token_is_exclusive() {
        let url = build_request(
            "https://example.org/oai",
            "ListRecords",
            "oai_dc",
            Some("books"),
            None,
            None,
            Some("tok123"),
        )
        .unwrap();
        assert!(url.contains("resumptionToken=tok123"));
        assert!(!url.contains("metadataPrefix"));
    }

    #[test]
    fn test_parse_list_records() {
        let xml = r#"<?xml version="1.0"?>
        <OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
          <ListRecords>
            <record>
              <header>
                <identifier>oai:x:1</identifier>
                <datestamp>2024-01-01</datestamp>
              </header>
              <metadata>
                <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/">
                  <title>A Title</title>
                </oai_dc:dc>
              </metadata>
            </record>
            <record>
              <header status="deleted">
                <identifier>oai:x:2</identifier>
                <datestamp>2024-01-02</datestamp>
              </header>
            </record>
            <resumptionToken>page2</resumptionToken>
          </ListRecords>
        </OAI-PMH>"#;

        let page = parse_response(xml).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].header.identifier, "oai:x:1");
        assert!(!page.records[0].header.deleted);
        assert!(page.records[0].payload.contains("<title>A Title</title>"));
        assert!(page.records[1].header.deleted);
        assert!(page.records[1].payload.is_empty());
        assert_eq!(page.resumption_token.as_deref(), Some("page2"));
    }

    #[test]
    fn test_parse_list_identifiers() {
        let xml = r#"<OAI-PMH>
          <ListIdentifiers>
            <header><identifier>oai:x:1</identifier><datestamp>2024-01-01</datestamp></header>
            <header status="deleted"><identifier>oai:x:2</identifier><datestamp>2024-01-02</datestamp></header>
          </ListIdentifiers>
        </OAI-PMH>"#;

        let page = parse_response(xml).unwrap();
        assert_eq!(page.headers.len(), 2);
        assert_eq!(page.headers[0].identifier, "oai:x:1");
        assert!(page.headers[1].deleted);
        assert!(page.resumption_token.is_none());
    }

    #[test]
    fn test_no_records_match_is_empty_page() {
        let xml = r#"<OAI-PMH><error code="noRecordsMatch">nothing</error></OAI-PMH>"#;
        let page = parse_response(xml).unwrap();
        assert!(page.records.is_empty());
    }

    #[test]
    fn test_bad_resumption_token_is_reported() {
        let xml = r#"<OAI-PMH><error code="badResumptionToken">expired</error></OAI-PMH>"#;
        assert!(matches!(
            parse_response(xml),
            Err(HarvestError::TokenExpired(_))
        ));
    }
}
