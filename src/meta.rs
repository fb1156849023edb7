//! Light metadata inspection of XML records.

use quick_xml::events::Event;

/// Text of the first element whose local name is `title`.
pub fn extract_title(xml: &[u8]) -> Option<String> {
    extract_first(xml, "title")
}

/// Text of the first element with the given local name (namespace prefix
/// ignored), nested text included. Empty or whitespace-only text counts as
/// absent.
pub fn extract_first(xml: &[u8], local_name: &str) -> Option<String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut out = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if depth > 0 {
                    depth += 1;
                } else if e.local_name().as_ref() == local_name.as_bytes() {
                    depth = 1;
                }
            }
            Ok(Event::Text(te)) if depth > 0 => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::CData(cd)) if depth > 0 => {
                out.push_str(&String::from_utf8_lossy(&cd.into_inner()));
            }
            Ok(Event::End(_)) if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let text = out.trim();
                    if !text.is_empty() {
                        return Some(text.to_string());
                    }
                    out.clear();
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}
