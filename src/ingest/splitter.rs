//! Record splitters: named plugins turning one harvested payload into
//! zero or more sub-records.

use quick_xml::events::Event;
use quick_xml::{Reader, Writer};

use crate::config::ConfigError;
use crate::drivers::DriverError;

/// Splits one payload into sub-record payloads.
pub trait RecordSplitter: Send + Sync {
    fn split(&self, payload: &str) -> Result<Vec<String>, DriverError>;
}

/// Construct a splitter by its configured name.
pub fn create_splitter(name: &str) -> Result<Box<dyn RecordSplitter>, ConfigError> {
    match name {
        "xml-children" => Ok(Box::new(XmlChildrenSplitter)),
        other => Err(ConfigError::Invalid(format!(
            "unknown record splitter '{other}'"
        ))),
    }
}

/// Splits an XML container into its immediate child elements, each
/// serialized as a standalone payload. A container with no element
/// children yields nothing.
pub struct XmlChildrenSplitter;

impl RecordSplitter for XmlChildrenSplitter {
    fn split(&self, payload: &str) -> Result<Vec<String>, DriverError> {
        let mut reader = Reader::from_str(payload);
        reader.config_mut().trim_text(true);

        let mut parts = Vec::new();
        let mut depth = 0usize;
        let mut writer: Option<Writer<Vec<u8>>> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| DriverError::Parse(format!("invalid container XML: {e}")))?;
            match event {
                Event::Start(e) => {
                    depth += 1;
                    if depth == 2 {
                        writer = Some(Writer::new(Vec::new()));
                    }
                    if let Some(w) = writer.as_mut() {
                        w.write_event(Event::Start(e))
                            .map_err(|e| DriverError::Parse(e.to_string()))?;
                    }
                }
                Event::End(e) => {
                    if let Some(w) = writer.as_mut() {
                        w.write_event(Event::End(e))
                            .map_err(|e| DriverError::Parse(e.to_string()))?;
                    }
                    if depth == 2 {
                        let bytes = writer.take().unwrap().into_inner();
                        parts.push(String::from_utf8_lossy(&bytes).into_owned());
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Empty(e) => {
                    if let Some(w) = writer.as_mut() {
                        w.write_event(Event::Empty(e))
                            .map_err(|e| DriverError::Parse(e.to_string()))?;
                    } else if depth == 1 {
                        let mut w = Writer::new(Vec::new());
                        w.write_event(Event::Empty(e))
                            .map_err(|e| DriverError::Parse(e.to_string()))?;
                        parts.push(String::from_utf8_lossy(&w.into_inner()).into_owned());
                    }
                }
                Event::Text(e) => {
                    if let Some(w) = writer.as_mut() {
                        w.write_event(Event::Text(e))
                            .map_err(|e| DriverError::Parse(e.to_string()))?;
                    }
                }
                Event::CData(e) => {
                    if let Some(w) = writer.as_mut() {
                        w.write_event(Event::CData(e))
                            .map_err(|e| DriverError::Parse(e.to_string()))?;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_container_children() {
        let payload = r#"<records>
            <dc><title>One</title></dc>
            <dc><title>Two</title><creator>X</creator></dc>
        </records>"#;
        let parts = XmlChildrenSplitter.split(payload).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "<dc><title>One</title></dc>");
        assert!(parts[1].contains("<creator>X</creator>"));
    }

    #[test]
    fn test_empty_container_yields_nothing() {
        assert!(XmlChildrenSplitter.split("<records></records>").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_splitter_name() {
        assert!(create_splitter("xslt:foo.xsl").is_err());
        assert!(create_splitter("xml-children").is_ok());
    }
}
