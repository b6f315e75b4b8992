//! Lenient extraction of JSON from free-form model output.

use serde_json::{Map, Value};

/// Parses the span from the first `{` to the last `}` as a JSON object.
///
/// Models frequently wrap JSON in prose or code fences; anything outside the
/// outermost braces is ignored. Returns `None` when no object can be parsed.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Parses the span from the first `[` to the last `]` as a JSON array.
pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

/// Parses the whole text as a JSON object, without any trimming heuristics.
pub fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
