//! DC transformer: turns attribute-only records into simple Dublin Core.
//!
//! Records that already carry XML pass through untouched. For anything
//! else an `rdf:RDF` document is built from the well-known attributes
//! (see [`crate::models::wka`]), falling back to the record id, source URI
//! and last-modified time where an attribute is missing.

use async_trait::async_trait;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::Value;
use std::io::Cursor;

use crate::definition::DefinitionAdaptor;
use crate::error::{HarvestError, Result};
use crate::mime::MimeType;
use crate::models::{wka, DataReference, EntityDefinition};
use crate::template::UiTemplate;
use crate::traits::{Descriptor, Transformer, TransformerInstance};

pub const TYPE: &str = "DC";

const RDF: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
const DC: &str = "http://purl.org/dc/elements/1.1/";
const DCT: &str = "http://purl.org/dc/terms/";
const OWS: &str = "http://www.opengis.net/ows";

/// Attribute holding the last modification date.
const MODIFIED: &str = "modified";
/// Attribute holding extra reference URLs, as strings or
/// `{resource.url, resource.url.scheme}` objects.
const REFERENCES: &str = "references";

#[derive(Debug, Default)]
pub struct DcTransformer;

impl Descriptor for DcTransformer {
    fn entity_type(&self) -> &str {
        TYPE
    }

    fn template(&self) -> UiTemplate {
        UiTemplate::new(TYPE, "Dublin Core", Vec::new())
    }
}

impl Transformer for DcTransformer {
    fn create_instance(&self, def: &EntityDefinition) -> Result<Box<dyn TransformerInstance>> {
        let adaptor = DefinitionAdaptor::new(def, TYPE)?;
        Ok(Box::new(DcTransformerInstance { adaptor }))
    }
}

struct DcTransformerInstance {
    adaptor: DefinitionAdaptor,
}

#[async_trait]
impl TransformerInstance for DcTransformerInstance {
    fn entity_definition(&self) -> &EntityDefinition {
        self.adaptor.entity_definition()
    }

    async fn transform(&self, data: &DataReference) -> Result<Vec<DataReference>> {
        if data.is_xml() {
            return Ok(vec![data.clone()]);
        }
        let xml = encode_dc(data)?;
        Ok(vec![data.derive(xml.into_bytes(), Some(MimeType::xml()))])
    }
}

fn attr<'a>(data: &'a DataReference, key: &str) -> Option<&'a str> {
    match data.attributes.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim()),
        _ => None,
    }
}

/// Dublin Core RDF document describing `data`.
pub fn encode_dc(data: &DataReference) -> Result<String> {
    let identifier = attr(data, wka::IDENTIFIER).unwrap_or(&data.id);
    let modified = attr(data, MODIFIED)
        .map(str::to_string)
        .or_else(|| data.last_modified.map(|ts| ts.to_rfc3339()));
    let resource_url = attr(data, wka::RESOURCE_URL).unwrap_or(data.source_uri.as_str());

    let mut w = DcWriter::new();
    w.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    w.start(
        "rdf:RDF",
        &[
            ("xmlns:rdf", RDF),
            ("xmlns:dc", DC),
            ("xmlns:dct", DCT),
            ("xmlns:ows", OWS),
        ],
    )?;
    w.start("rdf:Description", &[("rdf:about", identifier)])?;

    w.element("dc:identifier", &[], identifier)?;
    if let Some(title) = attr(data, wka::TITLE) {
        w.element("dc:title", &[], title)?;
    }
    if let Some(description) = attr(data, wka::DESCRIPTION) {
        w.element("dc:description", &[], description)?;
        w.element("dct:abstract", &[], description)?;
    }
    if let Some(modified) = &modified {
        w.element("dc:date", &[], modified)?;
    }
    match attr(data, wka::RESOURCE_URL_SCHEME) {
        Some(scheme) => w.element("dct:references", &[("scheme", scheme)], resource_url)?,
        None => w.element("dct:references", &[], resource_url)?,
    }

    if let Some(Value::Array(refs)) = data.attributes.get(REFERENCES) {
        for r in refs {
            match r {
                Value::String(url) if !url.is_empty() => {
                    w.element("dct:references", &[], url)?
                }
                Value::Object(map) => {
                    let url = map.get(wka::RESOURCE_URL).and_then(Value::as_str);
                    let scheme = map.get(wka::RESOURCE_URL_SCHEME).and_then(Value::as_str);
                    match (url, scheme) {
                        (Some(url), Some(scheme)) => {
                            w.element("dct:references", &[("dct:scheme", scheme)], url)?
                        }
                        (Some(url), None) => w.element("dct:references", &[], url)?,
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    if let Some((lower, upper)) = attr(data, wka::BBOX).and_then(bbox_corners) {
        w.start("ows:WGS84BoundingBox", &[])?;
        w.element("ows:LowerCorner", &[], &lower)?;
        w.element("ows:UpperCorner", &[], &upper)?;
        w.end("ows:WGS84BoundingBox")?;
    }

    w.end("rdf:Description")?;
    w.end("rdf:RDF")?;
    w.finish()
}

/// `minx,miny,maxx,maxy` or `"minx miny","maxx maxy"` into lower and upper
/// corner strings.
fn bbox_corners(bbox: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = bbox.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [minx, miny, maxx, maxy] => {
            Some((format!("{} {}", minx, miny), format!("{} {}", maxx, maxy)))
        }
        [lower, upper] => Some((lower.to_string(), upper.to_string())),
        _ => None,
    }
}

struct DcWriter {
    inner: Writer<Cursor<Vec<u8>>>,
}

impl DcWriter {
    fn new() -> Self {
        Self {
            inner: Writer::new(Cursor::new(Vec::new())),
        }
    }

    fn event(&mut self, event: Event<'_>) -> Result<()> {
        self.inner
            .write_event(event)
            .map_err(|e| HarvestError::processor("error writing Dublin Core").with_source(e))
    }

    fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut start = BytesStart::new(name);
        for attr in attrs {
            start.push_attribute(*attr);
        }
        self.event(Event::Start(start))
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn element(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> Result<()> {
        self.start(name, attrs)?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn finish(self) -> Result<String> {
        String::from_utf8(self.inner.into_inner().into_inner())
            .map_err(|e| HarvestError::processor("Dublin Core is not UTF-8").with_source(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta;
    use reqwest::Url;
    use serde_json::json;

    fn record() -> DataReference {
        let mut data = DataReference::new(
            "item-1",
            Url::parse("http://host/items/1").unwrap(),
            "WAF:http://host/",
            Vec::new(),
        );
        data.content_type = MimeType::parse("application/json");
        data.attributes.insert(wka::TITLE.into(), json!("Roads & Rails"));
        data.attributes.insert(wka::DESCRIPTION.into(), json!("Transport network"));
        data.attributes.insert(wka::BBOX.into(), json!("-10,40,5,50"));
        data.attributes.insert(
            REFERENCES.into(),
            json!(["http://host/a", {"resource.url": "http://host/b", "resource.url.scheme": "WMS"}]),
        );
        data
    }

    #[test]
    fn builds_rdf_from_attributes() {
        let xml = encode_dc(&record()).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<rdf:Description rdf:about=\"item-1\">"));
        assert!(xml.contains("<dc:identifier>item-1</dc:identifier>"));
        assert!(xml.contains("<dc:title>Roads &amp; Rails</dc:title>"));
        assert!(xml.contains("<dct:abstract>Transport network</dct:abstract>"));
        assert!(xml.contains("<dct:references>http://host/items/1</dct:references>"));
        assert!(xml.contains("<dct:references>http://host/a</dct:references>"));
        assert!(xml.contains("<dct:references dct:scheme=\"WMS\">http://host/b</dct:references>"));
        assert!(xml.contains("<ows:LowerCorner>-10 40</ows:LowerCorner>"));
        assert!(xml.contains("<ows:UpperCorner>5 50</ows:UpperCorner>"));
        assert_eq!(meta::extract_title(xml.as_bytes()).as_deref(), Some("Roads & Rails"));
    }

    #[tokio::test]
    async fn non_xml_records_are_derived() {
        let instance = DcTransformer
            .create_instance(&EntityDefinition::new(TYPE))
            .unwrap();
        let source = record();
        let out = instance.transform(&source).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_xml());
        assert_eq!(out[0].id, "item-1");
        assert_eq!(out[0].origin.as_ref().map(|o| o.id.as_str()), Some("item-1"));
        assert_eq!(out[0].title(), "Roads & Rails");
    }

    #[tokio::test]
    async fn xml_records_pass_through() {
        let instance = DcTransformer
            .create_instance(&EntityDefinition::new(TYPE))
            .unwrap();
        let mut source = record();
        source.content = b"<md/>".to_vec();
        source.content_type = Some(MimeType::xml());
        let out = instance.transform(&source).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, b"<md/>");
        assert!(out[0].origin.is_none());
    }

    #[test]
    fn bbox_forms() {
        assert_eq!(
            bbox_corners("1, 2, 3, 4"),
            Some(("1 2".to_string(), "3 4".to_string()))
        );
        assert_eq!(
            bbox_corners("1 2,3 4"),
            Some(("1 2".to_string(), "3 4".to_string()))
        );
        assert_eq!(bbox_corners("1,2,3"), None);
    }
}
