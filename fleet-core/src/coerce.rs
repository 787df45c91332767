//! Lenient conversions from loosely-typed JSON payload values.
//!
//! Devices in the field are not consistent about types: counters arrive as
//! strings, flags as booleans, serial numbers as numbers. These helpers
//! convert what can be converted and report `None` for everything else so a
//! single odd field never rejects a whole packet.

use serde_json::Value;

/// String form of a scalar. Containers serialize to their JSON text.
pub fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Integer form of a value.
///
/// Booleans map to 0/1, floats truncate toward zero, strings must hold an
/// integer literal.
pub fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i);
            }
            let f = n.as_f64()?;
            if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Some(f.trunc() as i64)
            } else {
                None
            }
        }
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Integer form, with anything missing or unconvertible counted as zero.
pub fn integer_or_zero(value: Option<&Value>) -> i64 {
    value.and_then(integer).unwrap_or(0)
}

/// Floating point form of a value. Booleans map to 0.0/1.0.
pub fn float(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
