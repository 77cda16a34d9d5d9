//! ESE (Europeana Semantic Elements) driver.
//!
//! ESE payloads are Dublin Core with Europeana extensions; the driver
//! delegates to the DC parsing and overrides the bits the extensions
//! change: object type, rights and data-provider handling.

use std::collections::HashMap;

use super::{set_field, DcDriver, RecordDriver, Result, SolrDoc};

/// ESE format driver.
#[derive(Debug)]
pub struct EseDriver {
    inner: DcDriver,
    /// `driverParams` override for the document type field.
    default_format: String,
}

impl EseDriver {
    /// Parse an ESE payload.
    pub fn parse(
        data: &str,
        oai_id: &str,
        source_id: &str,
        driver_params: &HashMap<String, String>,
    ) -> Result<Self> {
        Ok(Self {
            inner: DcDriver::parse(data, oai_id, source_id)?,
            default_format: driver_params
                .get("defaultFormat")
                .cloned()
                .unwrap_or_else(|| "Image".to_string()),
        })
    }
}

impl RecordDriver for EseDriver {
    fn id(&self) -> String {
        self.inner.id()
    }

    fn serialize(&self) -> String {
        self.inner.serialize()
    }

    fn normalize(&mut self) {
        self.inner.normalize();
    }

    fn get_host_record_id(&self) -> String {
        self.inner.get_host_record_id()
    }

    fn get_linking_id(&self) -> String {
        self.inner.get_linking_id()
    }

    fn get_title(&self, for_filing: bool) -> String {
        self.inner.get_title(for_filing)
    }

    fn get_main_author(&self) -> String {
        self.inner.get_main_author()
    }

    fn get_isbns(&self) -> Vec<String> {
        self.inner.get_isbns()
    }

    fn get_issns(&self) -> Vec<String> {
        self.inner.get_issns()
    }

    fn get_format(&self) -> String {
        let format = self.inner.get_format();
        if format == "Unknown" {
            self.default_format.clone()
        } else {
            format
        }
    }

    fn get_publication_year(&self) -> Option<i32> {
        self.inner.get_publication_year()
    }

    fn get_page_count(&self) -> Option<u32> {
        self.inner.get_page_count()
    }

    fn get_series_issn(&self) -> String {
        self.inner.get_series_issn()
    }

    fn get_series_numbering(&self) -> String {
        self.inner.get_series_numbering()
    }

    fn to_solr_array(&self) -> SolrDoc {
        let mut doc = self.inner.to_solr_array();
        set_field(&mut doc, "record_format", "ese");
        set_field(&mut doc, "format", self.get_format());
        doc
    }

    fn merge_component_parts(
        &self,
        components: &[Box<dyn RecordDriver>],
        doc: &mut SolrDoc,
    ) -> usize {
        self.inner.merge_component_parts(components, doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_from_driver_params() {
        let xml = "<dc><title>Poster</title><identifier>p1</identifier></dc>";
        let mut params = HashMap::new();
        params.insert("defaultFormat".to_string(), "Poster".to_string());
        let driver = EseDriver::parse(xml, "", "s1", &params).unwrap();
        assert_eq!(driver.get_format(), "Poster");

        let driver = EseDriver::parse(xml, "", "s1", &HashMap::new()).unwrap();
        assert_eq!(driver.get_format(), "Image");
    }
}
