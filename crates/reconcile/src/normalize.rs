//! Canonical comparable forms of resources
//!
//! Two semantically equal resources must normalize to identical values.
//! `serde_json::Map` keeps keys sorted, so key order is already stable;
//! what is left is dropping noise: `null`s, server-assigned fields, and
//! integral floats that would compare unequal to the integers they denote.

use serde::Serialize;
use serde_json::{Map, Number, Value};

/// Canonical form of a mapping with the given top-level keys omitted.
pub fn canonical(value: &Value, omit: &[&str]) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                if omit.contains(&key.as_str()) || inner.is_null() {
                    continue;
                }
                out.insert(key.clone(), canonical(inner, &[]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| canonical(v, &[])).collect()),
        Value::Number(n) => Value::Number(canonical_number(n)),
        other => other.clone(),
    }
}

/// Serialize a model and canonicalize the result.
pub fn canonical_of<T: Serialize>(item: &T, omit: &[&str]) -> Value {
    match serde_json::to_value(item) {
        Ok(value) => canonical(&value, omit),
        Err(e) => {
            // Only non-string map keys fail here; keep the diff conservative.
            log::warn!("failed to serialize resource for comparison: {e}");
            Value::Null
        }
    }
}

fn canonical_number(n: &Number) -> Number {
    if n.is_f64()
        && let Some(f) = n.as_f64()
        && f.fract() == 0.0
        && f.abs() < 9.0e15
    {
        return Number::from(f as i64);
    }
    n.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_drops_nulls_and_omitted_keys() {
        let raw = json!({
            "externalId": "pump",
            "description": null,
            "createdTime": 1700000000000_i64,
            "nested": {"a": null, "b": 1}
        });

        let out = canonical(&raw, &["createdTime"]);
        assert_eq!(out, json!({"externalId": "pump", "nested": {"b": 1}}));
    }

    #[test]
    fn test_omit_only_applies_at_top_level() {
        let raw = json!({"id": 1, "inner": {"id": 2}});
        assert_eq!(canonical(&raw, &["id"]), json!({"inner": {"id": 2}}));
    }

    #[test]
    fn test_integral_floats_equal_integers() {
        assert_eq!(
            canonical(&json!({"value": 1.0}), &[]),
            canonical(&json!({"value": 1}), &[])
        );
        assert_eq!(canonical(&json!(1.5), &[]), json!(1.5));
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": [1, 2], "b": 1}"#).unwrap();
        assert_eq!(
            serde_json::to_string(&canonical(&a, &[])).unwrap(),
            serde_json::to_string(&canonical(&b, &[])).unwrap()
        );
    }
}
