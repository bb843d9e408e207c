//! Transport codec for the remote host's wire-safe payloads.
//!
//! Text is encoded as UTF-8 first and the resulting bytes are base64 encoded.
//! Encoding UTF-16 code units directly would corrupt every character above U+007F.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{StorageError, SyncResult};

/// Encode arbitrary Unicode text into a base64 payload.
pub fn encode(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Decode a base64 payload back into Unicode text.
///
/// ASCII whitespace is ignored: the remote host wraps long payloads at a fixed width.
pub fn decode(wire: &str) -> SyncResult<String> {
    let compact: String = wire
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| StorageError::Encoding(format!("malformed base64 payload: {}", e)))?;

    String::from_utf8(bytes)
        .map_err(|e| StorageError::Encoding(format!("payload is not valid UTF-8: {}", e)))
}
