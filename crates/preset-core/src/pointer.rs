//! JSON-pointer helpers (RFC 6901 subset used for trace paths).

use serde_json::{Map, Value};

/// Escape one reference token: `~` → `~0`, `/` → `~1`.
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Inverse of [`escape_token`].
pub fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Append an escaped token to `base`.
pub fn child(base: &str, token: &str) -> String {
    format!("{}/{}", base, escape_token(token))
}

/// Split a pointer into unescaped tokens. `""` and `"/"`-less input yield no tokens.
pub fn tokens(pointer: &str) -> Vec<String> {
    let trimmed = pointer.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return Vec::new();
    }
    trimmed
        .trim_start_matches('/')
        .split('/')
        .map(unescape_token)
        .collect()
}

/// Write `value` at `pointer`, creating intermediate objects. Non-object
/// intermediates are replaced. An empty pointer replaces the root.
pub fn set(root: &mut Value, pointer: &str, value: Value) {
    set_tokens(root, &tokens(pointer), value);
}

fn set_tokens(current: &mut Value, tokens: &[String], value: Value) {
    let Some((head, rest)) = tokens.split_first() else {
        *current = value;
        return;
    };
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        let entry = map.entry(head.clone()).or_insert(Value::Null);
        set_tokens(entry, rest, value);
    }
}

/// One leaf write produced by flattening a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafWrite {
    pub path: String,
    pub value: Value,
}

/// Flatten `value` under `base` into sorted leaf writes. Empty objects
/// produce a single `{}` write; null produces nothing.
pub fn leaf_writes(base: &str, value: &Value) -> Vec<LeafWrite> {
    let mut out = Vec::new();
    collect_leaves(base, value, &mut out);
    out
}

fn collect_leaves(base: &str, value: &Value, out: &mut Vec<LeafWrite>) {
    match value {
        Value::Null => {}
        Value::Object(map) if map.is_empty() => out.push(LeafWrite {
            path: base.to_string(),
            value: Value::Object(Map::new()),
        }),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                collect_leaves(&child(base, key), &map[key.as_str()], out);
            }
        }
        other => out.push(LeafWrite {
            path: base.to_string(),
            value: other.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_escape_round_trip() {
        assert_eq!(escape_token("a/b~c"), "a~1b~0c");
        assert_eq!(unescape_token("a~1b~0c"), "a/b~c");
        assert_eq!(tokens("/a~1b/c"), vec!["a/b".to_string(), "c".to_string()]);
        assert!(tokens("").is_empty());
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut root = json!({"a": 1});
        set(&mut root, "/b/c", json!(true));
        set(&mut root, "/a/x", json!("replaced"));
        assert_eq!(root, json!({"a": {"x": "replaced"}, "b": {"c": true}}));

        set(&mut root, "", json!([1]));
        assert_eq!(root, json!([1]));
    }

    #[test]
    fn test_leaf_writes_sorted() {
        let writes = leaf_writes("/x", &json!({"b": {"z": 1, "a": {}}, "a": [1, 2], "n": null}));
        let paths: Vec<_> = writes.iter().map(|w| w.path.as_str()).collect();
        assert_eq!(paths, vec!["/x/a", "/x/b/a", "/x/b/z"]);
        assert_eq!(writes[1].value, json!({}));
    }
}
