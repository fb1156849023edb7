//! Reversible obfuscation of stored passwords.
//!
//! A scrambled value is the base64 encoding of the text prefixed with its
//! CRC32 checksum, right-aligned in ten characters. Decoding verifies the
//! checksum, so plain (never scrambled) values are told apart from scrambled
//! ones.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const CRC_WIDTH: usize = 10;

pub fn encode(text: &str) -> String {
    let crc = crc32fast::hash(text.as_bytes());
    STANDARD.encode(format!("{:>width$}{}", crc, text, width = CRC_WIDTH))
}

/// Returns `None` when `scrambled` was not produced by [`encode`].
pub fn decode(scrambled: &str) -> Option<String> {
    let bytes = STANDARD.decode(scrambled.trim()).ok()?;
    let payload = String::from_utf8(bytes).ok()?;
    if payload.len() < CRC_WIDTH || !payload.is_char_boundary(CRC_WIDTH) {
        return None;
    }
    let (crc, text) = payload.split_at(CRC_WIDTH);
    let crc: u32 = crc.trim().parse().ok()?;
    (crc32fast::hash(text.as_bytes()) == crc).then(|| text.to_string())
}
