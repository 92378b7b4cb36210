use serde_json::Value;

use crate::errors::CaptureError;
use crate::fragment::ContextFragment;

/// Top-level key carrying the context in session-prepare payloads.
pub const CONTEXT_KEY: &str = "context";

/// Pull the context fragment out of a decoded payload.
///
/// Any non-null value is accepted as is; there is no schema check.
pub fn extract_context(payload: &Value) -> Result<ContextFragment, CaptureError> {
    payload
        .get(CONTEXT_KEY)
        .cloned()
        .and_then(ContextFragment::from_value)
        .ok_or(CaptureError::FieldMissing)
}
