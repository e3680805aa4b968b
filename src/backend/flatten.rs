//! Shared flatten/unflatten helpers for nested JSON/YAML structures, used by
//! the file backend (spec §4.2, "File") and the Secrets Manager/Vault
//! backends' JSON-walk rules.

use std::collections::BTreeMap;

use serde_json::Value;

/// Flattens a nested JSON value into `/a/b/c = value` pairs. Arrays become
/// numeric segments (`/items/0`, `/items/1`); scalars are stringified
/// (`true`/`false`, decimal integer, default-precision float) (spec §4.2).
pub fn flatten(value: &Value, prefix: &str, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            if map.is_empty() && !prefix.is_empty() {
                return;
            }
            for (key, child) in map {
                let child_prefix = format!("{prefix}/{key}");
                flatten(child, &child_prefix, out);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                let child_prefix = format!("{prefix}/{idx}");
                flatten(child, &child_prefix, out);
            }
        }
        Value::Null => {
            out.insert(prefix.to_string(), "null".to_string());
        }
        Value::Bool(b) => {
            out.insert(prefix.to_string(), b.to_string());
        }
        Value::Number(n) => {
            out.insert(prefix.to_string(), n.to_string());
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
    }
}

/// Flattens a YAML value the same way, by first converting it to JSON.
pub fn flatten_yaml(value: &serde_yaml::Value, prefix: &str, out: &mut BTreeMap<String, String>) {
    if let Ok(json) = serde_json::to_value(value) {
        flatten(&json, prefix, out);
    }
}

/// Rebuilds a nested JSON value from `/a/b/c = value` pairs, the inverse of
/// [`flatten`]. Segments that are all-digit are treated as array indices.
/// Used by the idempotence test in spec §8 ("flatten(unflatten(m)) == m on
/// the common types").
pub fn unflatten(entries: &BTreeMap<String, String>) -> Value {
    let mut root = Value::Object(serde_json::Map::new());
    for (path, value) in entries {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        insert_path(&mut root, &segments, value);
    }
    root
}

fn insert_path(node: &mut Value, segments: &[&str], value: &str) {
    if segments.is_empty() {
        return;
    }
    let (head, rest) = (segments[0], &segments[1..]);
    if rest.is_empty() {
        set_child(node, head, Value::String(value.to_string()));
        return;
    }
    let child_is_array = rest[0].chars().all(|c| c.is_ascii_digit());
    let child = get_or_create_child(node, head, child_is_array);
    insert_path(child, rest, value);
}

fn get_or_create_child<'a>(node: &'a mut Value, key: &str, as_array: bool) -> &'a mut Value {
    match node {
        Value::Object(map) => map
            .entry(key.to_string())
            .or_insert_with(|| if as_array { Value::Array(vec![]) } else { Value::Object(serde_json::Map::new()) }),
        Value::Array(items) => {
            let idx: usize = key.parse().unwrap_or(0);
            while items.len() <= idx {
                items.push(if as_array {
                    Value::Array(vec![])
                } else {
                    Value::Object(serde_json::Map::new())
                });
            }
            &mut items[idx]
        }
        _ => unreachable!("leaf nodes are never descended into"),
    }
}

fn set_child(node: &mut Value, key: &str, value: Value) {
    match node {
        Value::Object(map) => {
            map.insert(key.to_string(), value);
        }
        Value::Array(items) => {
            let idx: usize = key.parse().unwrap_or(0);
            while items.len() <= idx {
                items.push(Value::Null);
            }
            items[idx] = value;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_nested_object() {
        let value = json!({"a": 1, "b": {"c": "x"}, "other": "y"});
        let mut out = BTreeMap::new();
        flatten(&value, "", &mut out);
        assert_eq!(out.get("/a"), Some(&"1".to_string()));
        assert_eq!(out.get("/b/c"), Some(&"x".to_string()));
        assert_eq!(out.get("/other"), Some(&"y".to_string()));
    }

    #[test]
    fn test_flatten_array_uses_numeric_segments() {
        let value = json!({"items": ["a", "b"]});
        let mut out = BTreeMap::new();
        flatten(&value, "", &mut out);
        assert_eq!(out.get("/items/0"), Some(&"a".to_string()));
        assert_eq!(out.get("/items/1"), Some(&"b".to_string()));
    }

    #[test]
    fn test_flatten_null_is_literal_string() {
        let value = json!({"x": null});
        let mut out = BTreeMap::new();
        flatten(&value, "", &mut out);
        assert_eq!(out.get("/x"), Some(&"null".to_string()));
    }

    #[test]
    fn test_flatten_unflatten_round_trip_scalars() {
        let value = json!({"a": "1", "b": {"c": "x", "d": "2"}});
        let mut out = BTreeMap::new();
        flatten(&value, "", &mut out);
        let rebuilt = unflatten(&out);
        let mut out2 = BTreeMap::new();
        flatten(&rebuilt, "", &mut out2);
        assert_eq!(out, out2);
    }
}
