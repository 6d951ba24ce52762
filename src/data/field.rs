//! Dot-path field access over JSON payloads.

use serde_json::Value;

/// Resolves a dot-separated path (`"metrics.score"`, `"items.0.name"`)
/// against a JSON value. Numeric segments index into arrays.
///
/// An empty path resolves to the value itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Casts a value to `f64`, accepting numbers and numeric strings.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Renders a value as comparison text (strings unquoted).
pub fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested_object() {
        let value = json!({"metrics": {"score": 72, "grade": "B"}});
        assert_eq!(lookup(&value, "metrics.score"), Some(&json!(72)));
        assert_eq!(lookup(&value, "metrics.grade"), Some(&json!("B")));
    }

    #[test]
    fn test_lookup_array_index() {
        let value = json!({"factors": [{"name": "moat"}, {"name": "scale"}]});
        assert_eq!(lookup(&value, "factors.1.name"), Some(&json!("scale")));
        assert_eq!(lookup(&value, "factors.7.name"), None);
    }

    #[test]
    fn test_lookup_missing_and_empty_path() {
        let value = json!({"a": 1});
        assert!(lookup(&value, "b").is_none());
        assert!(lookup(&value, "a.b").is_none());
        assert_eq!(lookup(&value, ""), Some(&value));
    }

    #[test]
    fn test_as_number_casts() {
        assert_eq!(as_number(&json!(3)), Some(3.0));
        assert_eq!(as_number(&json!(" 4.5 ")), Some(4.5));
        assert_eq!(as_number(&json!("high")), None);
        assert_eq!(as_number(&json!(true)), None);
        assert_eq!(as_number(&json!("NaN")), None);
    }

    #[test]
    fn test_as_text() {
        assert_eq!(as_text(&json!("Tech")), "Tech");
        assert_eq!(as_text(&json!(12)), "12");
        assert_eq!(as_text(&Value::Null), "null");
    }
}
