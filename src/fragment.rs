use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The session/request context captured from the observed application.
///
/// Opaque on purpose: any JSON value except `null` is accepted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextFragment(Value);

impl ContextFragment {
    /// Wrap a value, refusing `null` (a null slot means "nothing captured").
    pub fn from_value(value: Value) -> Option<Self> {
        if value.is_null() {
            None
        } else {
            Some(ContextFragment(value))
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}
