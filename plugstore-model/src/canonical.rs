//! Canonical JSON encoding.
//!
//! All byte-size checks, primary-key encodings and index values go through
//! [`canonical_json`] so that the same logical value always yields the same
//! bytes, whichever backend or process produced it.

use serde_json::{Map, Value};

/// A stored row: a JSON object keyed by field name.
pub type Row = Map<String, Value>;

/// Serialize `value` as RFC 8785 canonical JSON (sorted keys, no whitespace).
pub fn canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    serde_jcs::to_string(value)
}

/// Byte length of the canonical UTF-8 encoding of `value`.
pub fn canonical_len(value: &Value) -> Result<usize, serde_json::Error> {
    canonical_json(value).map(|s| s.len())
}

/// True for null, booleans, numbers and strings.
pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}
