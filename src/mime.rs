//! MIME type handling and the extension ↔ MIME type mapping used when a
//! source does not report a content type, and when an output broker has to
//! pick a file extension.

use serde::{Deserialize, Serialize};
use std::fmt;

/// `(mime type, extensions)`; the first extension is the preferred one.
const MAPPING: &[(&str, &[&str])] = &[
    ("application/xml", &["xml", "xsd", "xsl"]),
    ("text/xml", &["xml"]),
    ("application/json", &["json"]),
    ("application/geo+json", &["geojson"]),
    ("application/pdf", &["pdf"]),
    ("application/zip", &["zip"]),
    ("application/vnd.google-earth.kml+xml", &["kml"]),
    ("application/vnd.google-earth.kmz", &["kmz"]),
    ("application/x-netcdf", &["nc", "cdf"]),
    ("text/plain", &["txt", "text", "log"]),
    ("text/html", &["html", "htm"]),
    ("text/csv", &["csv"]),
    ("text/markdown", &["md"]),
    ("image/jpeg", &["jpg", "jpeg", "jpe"]),
    ("image/png", &["png"]),
    ("image/gif", &["gif"]),
    ("image/tiff", &["tif", "tiff"]),
    ("application/octet-stream", &["bin"]),
];

/// A `type/subtype` MIME type, lowercased and without parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MimeType(String);

impl MimeType {
    /// Parse a `Content-Type` style value. Returns `None` unless the value
    /// has the `type/subtype` shape.
    pub fn parse(value: &str) -> Option<Self> {
        let essence = value.split(';').next()?.trim().to_ascii_lowercase();
        let (primary, sub) = essence.split_once('/')?;
        if primary.is_empty() || sub.is_empty() || sub.contains('/') {
            return None;
        }
        Some(Self(essence))
    }

    /// Map a file extension (without the dot) to a MIME type.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        MAPPING
            .iter()
            .find(|(_, exts)| exts.contains(&ext.as_str()))
            .map(|(mime, _)| Self(mime.to_string()))
    }

    /// Map the extension of a path or URL to a MIME type.
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        let (_, ext) = name.rsplit_once('.')?;
        Self::from_extension(ext)
    }

    /// Known extensions for this MIME type, preferred first.
    pub fn extensions(&self) -> &'static [&'static str] {
        MAPPING
            .iter()
            .find(|(mime, _)| *mime == self.0)
            .map(|(_, exts)| *exts)
            .unwrap_or(&[])
    }

    pub fn is_xml(&self) -> bool {
        self.0 == "application/xml" || self.0 == "text/xml" || self.0.ends_with("+xml")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn xml() -> Self {
        Self("application/xml".to_string())
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_parameters() {
        let mt = MimeType::parse("Text/XML; charset=UTF-8").unwrap();
        assert_eq!(mt.as_str(), "text/xml");
        assert!(mt.is_xml());
        assert!(MimeType::parse("garbage").is_none());
        assert!(MimeType::parse("a/b/c").is_none());
    }

    #[test]
    fn extension_lookup_is_case_insensitive() {
        assert_eq!(MimeType::from_extension("XML"), Some(MimeType::xml()));
        assert_eq!(
            MimeType::from_path("http://host/data/record.JSON").unwrap().as_str(),
            "application/json"
        );
        assert!(MimeType::from_path("/no/extension").is_none());
    }

    #[test]
    fn reverse_lookup_prefers_first_extension() {
        let jpeg = MimeType::parse("image/jpeg").unwrap();
        assert_eq!(jpeg.extensions().first(), Some(&"jpg"));
        assert!(MimeType::parse("x-unknown/thing").unwrap().extensions().is_empty());
    }
}
