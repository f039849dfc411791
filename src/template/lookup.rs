//! Shared nested-value lookup.
//!
//! Templates, conditions, and the scheduler's field extraction all address
//! payloads with the same dotted paths, so the walk lives here once.

use serde_json::Value;

/// Resolve a dotted path against a JSON value.
///
/// Splits on `.` and walks left to right: a mapping yields the value for a
/// matching key, a sequence yields the element when the segment parses as a
/// non-negative in-bounds index. Anything else short-circuits to `None`.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                if !segment.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let index = segment.parse::<usize>().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Convert bracket path syntax to dotted form: `a['b']['0']` -> `a.b.0`.
/// Dotted paths pass through unchanged.
pub fn normalize_path(path: &str) -> String {
    path.replace("['", ".").replace("']", "")
}

/// Canonical string form of a value, used for change comparison.
///
/// Scalars print bare (`10`, not `"10"`); mappings and sequences serialize
/// compactly. serde_json's map is key-sorted, so two payloads that differ
/// only in key order canonicalize identically.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Human-facing string form for template substitution: scalars print bare,
/// mappings and sequences pretty-print.
pub fn display_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_mapping_keys() {
        let data = json!({"a": {"b": {"c": 42}}});
        assert_eq!(lookup_path(&data, "a.b.c"), Some(&json!(42)));
        assert_eq!(lookup_path(&data, "a.b.missing"), None);
    }

    #[test]
    fn test_lookup_sequence_index() {
        let data = json!({"a": {"b": [10, 20]}});
        assert_eq!(lookup_path(&data, "a.b.0"), Some(&json!(10)));
        assert_eq!(lookup_path(&data, "a.b.1"), Some(&json!(20)));
        assert_eq!(lookup_path(&data, "a.b.2"), None);
        // Non-numeric segment against a sequence is "not found".
        assert_eq!(lookup_path(&data, "a.b.x"), None);
    }

    #[test]
    fn test_lookup_short_circuits_on_scalar() {
        let data = json!({"a": 1});
        assert_eq!(lookup_path(&data, "a.b"), None);
    }

    #[test]
    fn test_normalize_bracket_path() {
        assert_eq!(normalize_path("result['0']['web_title']"), "result.0.web_title");
        assert_eq!(normalize_path("a.b.c"), "a.b.c");
    }

    #[test]
    fn test_canonical_string_ignores_key_order() {
        // serde_json maps are key-sorted, so insertion order is irrelevant.
        let a: Value = serde_json::from_str(r#"{"x": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "x": 1}"#).unwrap();
        assert_eq!(canonical_string(&a), canonical_string(&b));
    }

    #[test]
    fn test_canonical_string_scalars_bare() {
        assert_eq!(canonical_string(&json!("A")), "A");
        assert_eq!(canonical_string(&json!(10)), "10");
        assert_eq!(canonical_string(&json!(true)), "true");
    }
}
