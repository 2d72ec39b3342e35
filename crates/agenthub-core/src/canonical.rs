//! Canonical JSON for hashing/signatures
//!
//! Every signed envelope in AgentHub (delegation tokens, attestations,
//! policy decisions) is serialized with sorted keys, compact separators and
//! UTF-8 output before it is signed or hashed. Two processes producing the
//! same logical payload must produce byte-identical canonical text.

use serde_json::Value;

use crate::error::{Error, Result};

/// Canonicalize a JSON value: sorted object keys, no whitespace.
pub fn canonicalize(value: &Value) -> Result<String> {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));

            let mut out = String::from("{");
            for (idx, (k, v)) in pairs.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(&escape_json_string(k));
                out.push_str("\":");
                out.push_str(&canonicalize(v)?);
            }
            out.push('}');
            Ok(out)
        }
        Value::Array(arr) => {
            let mut out = String::from("[");
            for (idx, v) in arr.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&canonicalize(v)?);
            }
            out.push(']');
            Ok(out)
        }
        Value::String(s) => Ok(format!("\"{}\"", escape_json_string(s))),
        Value::Number(n) => canonicalize_number(n),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("null".to_string()),
    }
}

/// Canonicalize a JSON value into bytes (the form that gets signed).
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    Ok(canonicalize(value)?.into_bytes())
}

fn canonicalize_number(n: &serde_json::Number) -> Result<String> {
    if let Some(i) = n.as_i64() {
        return Ok(i.to_string());
    }
    if let Some(u) = n.as_u64() {
        return Ok(u.to_string());
    }
    if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            return Err(Error::NonFiniteNumber);
        }
        if f == 0.0 {
            // Normalize -0 to 0
            return Ok("0".to_string());
        }
        // Shortest round-trip representation. std float formatting is not a
        // stable cross-version contract; ryu is.
        let mut buf = ryu::Buffer::new();
        let rendered = buf.format_finite(f);
        // ryu renders integral floats as "x.0"; canonical form drops the
        // trailing ".0" so 12.0 and 12 hash identically.
        if let Some(stripped) = rendered.strip_suffix(".0") {
            return Ok(stripped.to_string());
        }
        return Ok(rendered.to_string());
    }
    Err(Error::JsonError("Unsupported JSON number".into()))
}

fn escape_json_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\u{08}' => result.push_str("\\b"),
            '\u{0C}' => result.push_str("\\f"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            c if c.is_control() => {
                result.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => result.push(c),
        }
    }
    result
}
