/*!
Renderings of a retrieved context for foreground tooling.

- pretty: two-space indented JSON
- escaped: compact JSON escaped for embedding inside another string literal
- json: compact JSON
*/

use clap::ValueEnum;
use serde_json::Value;

/// Shown whenever there is no fragment to render, whether nothing was captured
/// yet or retrieval failed.
pub const EMPTY_STATE: &str = "no context captured yet";

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, ValueEnum)]
pub enum RenderFormat {
    #[default]
    Pretty,
    Escaped,
    Json,
}

pub fn render_pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Compact JSON with quotes, backslashes and control characters escaped, without
/// surrounding quotes: `{"a":"b"}` becomes `{\"a\":\"b\"}`.
pub fn render_escaped(value: &Value) -> String {
    let compact = value.to_string();
    let quoted = Value::String(compact).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Render an optional fragment; `None` yields the explicit empty state.
pub fn render(format: RenderFormat, fragment: Option<&Value>) -> String {
    match fragment {
        None => EMPTY_STATE.to_string(),
        Some(v) => match format {
            RenderFormat::Pretty => render_pretty(v),
            RenderFormat::Escaped => render_escaped(v),
            RenderFormat::Json => v.to_string(),
        },
    }
}
