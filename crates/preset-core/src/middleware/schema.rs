//! Schema-directed projection and coercion.
//!
//! Only a subset of JSON Schema drives behaviour: `type` (object, array,
//! string, integer, number, boolean), `properties`, `required`,
//! `additionalProperties`, `items`, `default` and `enum`. Other keywords are
//! carried along untouched.

use serde_json::{Map, Number, Value};
use std::fmt;

use crate::pointer::child;

/// Why a value does not fit its schema. Nested causes are prefixed with the
/// field or item they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionError(pub String);

impl CoercionError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    fn within(self, prefix: impl fmt::Display) -> Self {
        Self(format!("{}: {}", prefix, self.0))
    }
}

impl fmt::Display for CoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CoercionError {}

/// The effective `type` of a schema, lower-cased. A `type` list yields its
/// first non-null entry; otherwise `properties` implies object and `items`
/// implies array. Empty when untyped.
pub fn schema_type(schema: &Value) -> String {
    match schema.get("type") {
        Some(Value::String(s)) => return s.trim().to_lowercase(),
        Some(Value::Array(list)) => {
            let first = list
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_lowercase())
                .find(|s| !s.is_empty() && s != "null");
            if let Some(t) = first {
                return t;
            }
        }
        _ => {}
    }
    if schema.get("properties").map_or(false, Value::is_object) {
        return "object".to_string();
    }
    if schema.get("items").map_or(false, Value::is_object) {
        return "array".to_string();
    }
    String::new()
}

/// Schema for `property` of an object schema, honoring
/// `additionalProperties`. `Ok(None)` means the property is not allowed.
pub fn child_schema(schema: &Value, property: &str) -> Result<Option<Value>, CoercionError> {
    if let Some(prop) = schema
        .get("properties")
        .and_then(|p| p.get(property))
        .filter(|p| p.is_object())
    {
        return Ok(Some(prop.clone()));
    }
    match schema.get("additionalProperties") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(true)) => Ok(Some(Value::Object(Map::new()))),
        Some(Value::Bool(false)) => Ok(None),
        Some(additional @ Value::Object(_)) => Ok(Some(additional.clone())),
        Some(_) => Err(CoercionError::new(
            "additionalProperties schema must be an object or boolean",
        )),
    }
}

/// Default value of a schema: its own `default`, or for object schemas the
/// object assembled from property defaults.
pub fn schema_default(schema: &Value) -> Option<Value> {
    if let Some(default) = schema.get("default") {
        return Some(default.clone());
    }
    if schema_type(schema) != "object" {
        return None;
    }
    let props = schema.get("properties")?.as_object()?;
    let mut keys: Vec<&String> = props.keys().collect();
    keys.sort();

    let mut out = Map::new();
    for key in keys {
        if let Some(default) = schema_default(&props[key.as_str()]) {
            out.insert(key.clone(), default);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

/// Defaults as an object payload, if the schema yields one.
pub fn schema_defaults_object(schema: &Value) -> Option<Map<String, Value>> {
    match schema_default(schema)? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// One path-level write produced by projecting a payload onto a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedWrite {
    pub path: String,
    pub schema: Value,
    pub raw: Value,
}

/// Flatten `payload` into writes addressed by JSON pointer, sorted by path.
///
/// Objects under object-typed properties are descended into; an empty
/// object becomes a single `{}` write, and a non-object value under an
/// object schema is written whole so coercion can reject it.
pub fn project_writes(
    schema: &Value,
    payload: &Map<String, Value>,
) -> Result<Vec<ProjectedWrite>, CoercionError> {
    let mut writes = Vec::new();
    project_into(schema, payload, "", &mut writes)?;
    writes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(writes)
}

fn project_into(
    schema: &Value,
    payload: &Map<String, Value>,
    base: &str,
    out: &mut Vec<ProjectedWrite>,
) -> Result<(), CoercionError> {
    let mut keys: Vec<&String> = payload.keys().collect();
    keys.sort();

    for key in keys {
        let value = &payload[key.as_str()];
        let path = child(base, key);
        let Some(child_schema) = child_schema(schema, key)? else {
            return Err(CoercionError::new(format!("path {} is not allowed by schema", path)));
        };

        match value {
            Value::Object(map) if schema_type(&child_schema) == "object" && !map.is_empty() => {
                project_into(&child_schema, map, &path, out)?;
            }
            _ => out.push(ProjectedWrite {
                path,
                schema: child_schema,
                raw: value.clone(),
            }),
        }
    }
    Ok(())
}

/// Coerce `raw` to the schema's type, then check `enum`.
pub fn coerce_and_validate(schema: &Value, raw: &Value) -> Result<Value, CoercionError> {
    let coerced = coerce_by_type(schema, raw)?;
    validate_enum(schema, &coerced)?;
    Ok(coerced)
}

fn coerce_by_type(schema: &Value, raw: &Value) -> Result<Value, CoercionError> {
    match schema_type(schema).as_str() {
        "object" => {
            let obj = raw
                .as_object()
                .ok_or_else(|| CoercionError::new("must be an object"))?;
            coerce_object(schema, obj).map(Value::Object)
        }
        "array" => {
            let items = raw
                .as_array()
                .ok_or_else(|| CoercionError::new("must be an array"))?;
            let item_schema = schema.get("items").filter(|s| s.is_object());
            items
                .iter()
                .enumerate()
                .map(|(i, item)| match item_schema {
                    Some(item_schema) => coerce_and_validate(item_schema, item)
                        .map_err(|e| e.within(format!("items[{}]", i))),
                    None => Ok(item.clone()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        "string" => match raw {
            Value::String(_) => Ok(raw.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(CoercionError::new("must be a string")),
        },
        "boolean" => match raw {
            Value::Bool(_) => Ok(raw.clone()),
            Value::String(s) => parse_bool(s.trim())
                .map(Value::Bool)
                .ok_or_else(|| CoercionError::new("must be a boolean")),
            _ => Err(CoercionError::new("must be a boolean")),
        },
        "integer" => to_integer(raw)
            .map(|i| Value::Number(i.into()))
            .ok_or_else(|| CoercionError::new("must be an integer")),
        "number" => to_number(raw)
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| CoercionError::new("must be a number")),
        _ => Ok(raw.clone()),
    }
}

fn coerce_object(schema: &Value, raw: &Map<String, Value>) -> Result<Map<String, Value>, CoercionError> {
    let mut keys: Vec<&String> = raw.keys().collect();
    keys.sort();

    let mut out = Map::new();
    for key in keys {
        let Some(child_schema) = child_schema(schema, key)? else {
            return Err(CoercionError::new(format!("field \"{}\" is not allowed", key)));
        };
        let coerced = coerce_and_validate(&child_schema, &raw[key.as_str()])
            .map_err(|e| e.within(format!("field \"{}\"", key)))?;
        out.insert(key.clone(), coerced);
    }

    for key in required_fields(schema) {
        if out.contains_key(&key) {
            continue;
        }
        let default = child_schema(schema, &key)?.and_then(|s| schema_default(&s));
        match default {
            Some(value) => {
                out.insert(key, value);
            }
            None => {
                return Err(CoercionError::new(format!("missing required field \"{}\"", key)))
            }
        }
    }
    Ok(out)
}

fn required_fields(schema: &Value) -> Vec<String> {
    let mut fields: Vec<String> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    fields.sort();
    fields
}

fn validate_enum(schema: &Value, value: &Value) -> Result<(), CoercionError> {
    let Some(candidates) = schema.get("enum").and_then(Value::as_array) else {
        return Ok(());
    };
    if candidates.is_empty() || candidates.iter().any(|c| values_equal(c, value)) {
        return Ok(());
    }
    Err(CoercionError::new(format!(
        "must be one of {}",
        Value::Array(candidates.clone())
    )))
}

/// Structural equality where numbers compare by value, so `2` matches `2.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map_or(false, |y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn to_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i);
            }
            if n.is_u64() {
                // above i64::MAX
                return None;
            }
            let f = n.as_f64()?;
            (f.trunc() == f && f >= i64::MIN as f64 && f <= i64::MAX as f64).then_some(f as i64)
        }
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn to_number(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_schema_type_inference() {
        assert_eq!(schema_type(&json!({"type": "Integer"})), "integer");
        assert_eq!(schema_type(&json!({"type": ["null", "string"]})), "string");
        assert_eq!(schema_type(&json!({"properties": {}})), "object");
        assert_eq!(schema_type(&json!({"items": {}})), "array");
        assert_eq!(schema_type(&json!({})), "");
    }

    #[test]
    fn test_scalar_coercion() {
        let int = json!({"type": "integer"});
        assert_eq!(coerce_and_validate(&int, &json!("5")).unwrap(), json!(5));
        assert_eq!(coerce_and_validate(&int, &json!(4.0)).unwrap(), json!(4));
        assert_eq!(coerce_and_validate(&int, &json!(4.5)).unwrap_err().to_string(), "must be an integer");
        assert!(coerce_and_validate(&int, &json!("nope")).is_err());

        let num = json!({"type": "number"});
        assert_eq!(coerce_and_validate(&num, &json!("0.25")).unwrap(), json!(0.25));
        assert_eq!(coerce_and_validate(&num, &json!(true)).unwrap_err().to_string(), "must be a number");

        let boolean = json!({"type": "boolean"});
        assert_eq!(coerce_and_validate(&boolean, &json!(" T ")).unwrap(), json!(true));
        assert_eq!(coerce_and_validate(&boolean, &json!("0")).unwrap(), json!(false));
        assert_eq!(coerce_and_validate(&boolean, &json!("yes")).unwrap_err().to_string(), "must be a boolean");

        let string = json!({"type": "string"});
        assert_eq!(coerce_and_validate(&string, &json!(7)).unwrap(), json!("7"));
        assert_eq!(coerce_and_validate(&string, &json!(false)).unwrap(), json!("false"));
    }

    #[test]
    fn test_enum_after_coercion() {
        let schema = json!({"type": "integer", "enum": [1.0, 2]});
        assert_eq!(coerce_and_validate(&schema, &json!("1")).unwrap(), json!(1));
        assert_eq!(
            coerce_and_validate(&schema, &json!(3)).unwrap_err().to_string(),
            "must be one of [1.0,2]"
        );
    }

    #[test]
    fn test_object_coercion_errors() {
        let schema = json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "default": "fast"},
                "limits": {"type": "array", "items": {"type": "integer"}},
                "name": {"type": "string"}
            },
            "required": ["mode", "name"]
        });

        let err = coerce_and_validate(&schema, &json!({"name": "x", "extra": 1})).unwrap_err();
        assert_eq!(err.to_string(), "field \"extra\" is not allowed");

        let err = coerce_and_validate(&schema, &json!({"name": "x", "limits": [1, "b"]})).unwrap_err();
        assert_eq!(err.to_string(), "field \"limits\": items[1]: must be an integer");

        let err = coerce_and_validate(&schema, &json!({})).unwrap_err();
        assert_eq!(err.to_string(), "missing required field \"name\"");

        let ok = coerce_and_validate(&schema, &json!({"name": "x"})).unwrap();
        assert_eq!(ok, json!({"mode": "fast", "name": "x"}));
    }

    #[test]
    fn test_additional_properties() {
        let open = json!({"type": "object", "additionalProperties": {"type": "integer"}});
        assert_eq!(coerce_and_validate(&open, &json!({"a": "3"})).unwrap(), json!({"a": 3}));

        let any = json!({"type": "object", "additionalProperties": true});
        assert_eq!(coerce_and_validate(&any, &json!({"a": [1]})).unwrap(), json!({"a": [1]}));

        let broken = json!({"type": "object", "additionalProperties": 1});
        assert!(coerce_and_validate(&broken, &json!({"a": 1})).is_err());
    }

    #[test]
    fn test_defaults() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer", "default": 1},
                "nested": {"type": "object", "properties": {"b": {"type": "string", "default": "x"}}},
                "none": {"type": "string"}
            }
        });
        assert_eq!(
            schema_defaults_object(&schema),
            Some(obj(json!({"a": 1, "nested": {"b": "x"}})))
        );
        assert_eq!(schema_defaults_object(&json!({"type": "object"})), None);
        assert_eq!(schema_defaults_object(&json!({"default": 3})), None);
    }

    #[test]
    fn test_projection() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a/b": {"type": "integer"},
                "nested": {"type": "object", "properties": {"x": {"type": "integer"}, "y": {"type": "string"}}},
                "empty": {"type": "object"}
            }
        });

        let writes = project_writes(
            &schema,
            &obj(json!({"nested": {"y": "s", "x": "1"}, "a/b": 2, "empty": {}})),
        )
        .unwrap();
        let paths: Vec<&str> = writes.iter().map(|w| w.path.as_str()).collect();
        assert_eq!(paths, vec!["/a~1b", "/empty", "/nested/x", "/nested/y"]);
        assert_eq!(writes[1].raw, json!({}));

        let whole = project_writes(&schema, &obj(json!({"nested": 5}))).unwrap();
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].path, "/nested");

        let err = project_writes(&schema, &obj(json!({"nested": {"z": 1}}))).unwrap_err();
        assert_eq!(err.to_string(), "path /nested/z is not allowed by schema");
    }
}
