//! Coercion of arbitrary backend tool output into the canonical result envelope.
//!
//! [`normalize`] is total and idempotent: every input produces a valid envelope, and an
//! envelope fed back in comes out unchanged. Envelope fields other than `content`
//! (`isError`, `structuredContent`, `_meta`) survive whenever the input carries them.

use rmcp::model::{CallToolResult, Content, Meta};
use serde_json::{Map, Value};

/// Text returned when a backend produced nothing at all.
pub const EMPTY_RESULT_TEXT: &str = "no result returned";

/// Fields searched, in order, when a backend returns a bare object.
pub const PRIORITY_FIELDS: &[&str] = &[
    "text",
    "content",
    "message",
    "result",
    "output",
    "transcript",
    "description",
    "summary",
    "response",
    "value",
    "body",
    "data",
];

/// Convert any value a backend returned into a canonical tool result.
pub fn normalize(raw: &Value) -> CallToolResult {
    if let Some(canonical) = as_canonical(raw) {
        return canonical;
    }
    let mut result = CallToolResult::success(vec![Content::text(extract_text(raw))]);
    if let Value::Object(map) = raw {
        carry_envelope_fields(map, &mut result);
    }
    result
}

/// Pass a validated result through, filling in content only if it carries none.
pub fn normalize_result(mut result: CallToolResult) -> CallToolResult {
    if result.content.is_empty() {
        let text = result
            .structured_content
            .as_ref()
            .filter(|v| !v.is_null())
            .map_or_else(|| EMPTY_RESULT_TEXT.to_string(), pretty);
        result.content.push(Content::text(text));
    }
    result
}

fn as_canonical(raw: &Value) -> Option<CallToolResult> {
    if !raw.get("content").is_some_and(Value::is_array) {
        return None;
    }
    serde_json::from_value::<CallToolResult>(raw.clone())
        .ok()
        .filter(|result| !result.content.is_empty())
}

fn carry_envelope_fields(map: &Map<String, Value>, result: &mut CallToolResult) {
    if let Some(is_error) = map.get("isError").and_then(Value::as_bool) {
        result.is_error = Some(is_error);
    }
    result.structured_content = map.get("structuredContent").filter(|v| !v.is_null()).cloned();
    result.meta = map
        .get("_meta")
        .and_then(Value::as_object)
        .map(|meta| Meta(meta.clone()));
}

fn extract_text(raw: &Value) -> String {
    match raw {
        Value::Null => EMPTY_RESULT_TEXT.to_string(),
        Value::String(s) => s.clone(),
        Value::Object(map) => PRIORITY_FIELDS
            .iter()
            .find_map(|field| map.get(*field).filter(|v| has_payload(v)))
            .or_else(|| map.get("structuredContent").filter(|v| !v.is_null()))
            .map_or_else(|| whole_object(raw, map), render_field),
        Value::Array(_) => pretty(raw),
        Value::Bool(_) | Value::Number(_) => raw.to_string(),
    }
}

/// An empty `content` array is an envelope with nothing in it, not a payload.
fn has_payload(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

fn whole_object(raw: &Value, map: &Map<String, Value>) -> String {
    if map.get("content").is_some_and(Value::is_array) {
        EMPTY_RESULT_TEXT.to_string()
    } else {
        pretty(raw)
    }
}

fn render_field(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => pretty(other),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
