//! Helpers for working with untyped JSON values
//!
//! Node inputs, outputs, and configs are `serde_json::Value` throughout; the
//! dotted-path helpers here back the template engine, the transform node's
//! field mapping, and condition expressions.

use serde_json::{Map, Value};

/// Resolve a dotted path (`a.b.c`) against a value.
///
/// Returns `None` when any segment is missing or traverses a non-object.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
pub fn set_path(value: &mut Value, path: &str, new_value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = value;
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("object ensured above");
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), new_value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove a dotted path. Returns the removed value if it existed.
pub fn remove_path(value: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((p, l)) => (Some(p), l),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(p) => get_path_mut(value, p)?,
        None => value,
    };
    parent.as_object_mut()?.remove(leaf)
}

fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

/// Spread the fields of `input` (when it is an object) into `output` without
/// overwriting keys the node already produced.
pub fn merge_passthrough(output: &mut Map<String, Value>, input: &Value) {
    if let Some(obj) = input.as_object() {
        for (k, v) in obj {
            output.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

/// Approximate serialized size in bytes, for data-size limits.
pub fn approx_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(n) => n.to_string().len(),
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(approx_size).sum::<usize>() + items.len(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 3 + approx_size(v))
                .sum::<usize>()
        }
    }
}

/// Render a value as a plain string: strings unquoted, everything else JSON.
pub fn to_display_string(value: &Value) -> String {
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
    fn test_get_path() {
        let v = json!({"a": {"b": {"c": 42}}, "top": "x"});
        assert_eq!(get_path(&v, "a.b.c"), Some(&json!(42)));
        assert_eq!(get_path(&v, "top"), Some(&json!("x")));
        assert_eq!(get_path(&v, "a.missing"), None);
        assert_eq!(get_path(&v, "top.deeper"), None);
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut v = json!({});
        set_path(&mut v, "user.name.first", json!("Ada"));
        assert_eq!(v, json!({"user": {"name": {"first": "Ada"}}}));

        set_path(&mut v, "user.name.last", json!("Lovelace"));
        assert_eq!(get_path(&v, "user.name.last"), Some(&json!("Lovelace")));
    }

    #[test]
    fn test_remove_path() {
        let mut v = json!({"a": {"b": 1, "c": 2}});
        assert_eq!(remove_path(&mut v, "a.b"), Some(json!(1)));
        assert_eq!(v, json!({"a": {"c": 2}}));
        assert_eq!(remove_path(&mut v, "a.missing"), None);
    }

    #[test]
    fn test_merge_passthrough_keeps_existing() {
        let mut out = Map::new();
        out.insert("data".to_string(), json!(true));
        merge_passthrough(&mut out, &json!({"data": false, "extra": 1}));
        assert_eq!(out.get("data"), Some(&json!(true)));
        assert_eq!(out.get("extra"), Some(&json!(1)));
    }

    #[test]
    fn test_approx_size_scales() {
        let small = approx_size(&json!({"a": 1}));
        let big = approx_size(&json!({"a": "x".repeat(10_000)}));
        assert!(big > small + 9_000);
    }

    #[test]
    fn test_display_string() {
        assert_eq!(to_display_string(&json!("plain")), "plain");
        assert_eq!(to_display_string(&json!(12)), "12");
        assert_eq!(to_display_string(&json!({"k": 1})), r#"{"k":1}"#);
    }
}
