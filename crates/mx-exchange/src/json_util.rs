//! Shared JSON parsing helpers used by all adapters.
//!
//! Exchanges encode numbers as JSON strings (`"30000.5"`) or native numbers
//! interchangeably, sometimes within one payload.

use serde_json::Value;

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    match v.as_str() {
        Some(s) if s.is_empty() => None,
        Some(s) => s.parse().ok(),
        None => v.as_f64(),
    }
}

/// Parse a named field as `f64` (string or number).
#[inline]
pub fn f64_field(v: &Value, key: &str) -> Option<f64> {
    parse_str_f64(v.get(key))
}

/// Parse a named field as `i64` (string or number).
#[inline]
pub fn i64_field(v: &Value, key: &str) -> Option<i64> {
    let v = v.get(key)?;
    match v.as_str() {
        Some(s) => s.parse().ok(),
        None => v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)),
    }
}

/// A named field as an owned string; numbers are rendered.
#[inline]
pub fn str_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse `[[price, size, ...], ...]` levels, skipping malformed entries.
pub fn parse_levels(levels: Option<&Value>) -> Vec<[f64; 2]> {
    let Some(arr) = levels.and_then(Value::as_array) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|level| {
            let level = level.as_array()?;
            Some([parse_str_f64(level.first())?, parse_str_f64(level.get(1))?])
        })
        .collect()
}

/// `data` as an array, or an empty slice.
pub fn array_of<'a>(v: &'a Value, key: &str) -> &'a [Value] {
    v.get(key).and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}
