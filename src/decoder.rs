/*!
Payload decoder: raw request body chunks to JSON.

Only the first chunk is authoritative. The context fragment is expected to fit
in it; a payload split across chunks fails with `Parse` instead of being
reassembled.
*/

use serde_json::Value;

use crate::errors::CaptureError;

const UTF8_BOM: char = '\u{feff}';

/// Decode the first body chunk of a captured request into a JSON value.
pub fn decode_payload(chunks: &[Vec<u8>]) -> Result<Value, CaptureError> {
    let first = match chunks.first() {
        Some(c) if !c.is_empty() => c,
        _ => return Err(CaptureError::NoBody),
    };
    let text = std::str::from_utf8(first).map_err(|e| CaptureError::Decode(e.to_string()))?;
    // A leading BOM is not part of the payload.
    let text = text.strip_prefix(UTF8_BOM).unwrap_or(text);
    serde_json::from_str(text).map_err(|e| CaptureError::Parse(e.to_string()))
}
