// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration tree nodes.

use super::ConfigError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// One node of the configuration tree.
///
/// Arrays whose items are all objects carrying a string `name` become a
/// [`ConfigNode::NamedList`]; any other array is a scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNode {
    Scalar(Value),
    Object(BTreeMap<String, ConfigNode>),
    NamedList(Vec<ConfigNode>),
}

impl Default for ConfigNode {
    fn default() -> Self {
        ConfigNode::Object(BTreeMap::new())
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.get("name").is_some_and(Value::is_string))
}

impl ConfigNode {
    /// Build a tree from a JSON-shaped value.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => ConfigNode::Object(
                map.into_iter()
                    .map(|(key, value)| (key, ConfigNode::from_value(value)))
                    .collect(),
            ),
            Value::Array(items) if is_named_list(&items) => {
                ConfigNode::NamedList(items.into_iter().map(ConfigNode::from_value).collect())
            }
            other => ConfigNode::Scalar(other),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let value: toml::Value = toml::from_str(content)?;
        Ok(Self::from_value(serde_json::to_value(value)?))
    }

    /// Back to a JSON-shaped value.
    pub fn to_value(&self) -> Value {
        match self {
            ConfigNode::Scalar(value) => value.clone(),
            ConfigNode::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, node)| (key.clone(), node.to_value()))
                    .collect::<Map<String, Value>>(),
            ),
            ConfigNode::NamedList(items) => {
                Value::Array(items.iter().map(ConfigNode::to_value).collect())
            }
        }
    }

    /// Deserialize this subtree into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        Ok(serde_json::from_value(self.to_value())?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConfigNode::Scalar(_) => "scalar",
            ConfigNode::Object(_) => "object",
            ConfigNode::NamedList(_) => "named list",
        }
    }

    pub fn is_container(&self) -> bool {
        !matches!(self, ConfigNode::Scalar(_))
    }

    /// The `name` field of an object node.
    pub fn name(&self) -> Option<&str> {
        match self.child("name") {
            Some(ConfigNode::Scalar(Value::String(name))) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Field of an object node.
    pub fn child(&self, key: &str) -> Option<&ConfigNode> {
        match self {
            ConfigNode::Object(fields) => fields.get(key),
            _ => None,
        }
    }

    pub fn child_mut(&mut self, key: &str) -> Option<&mut ConfigNode> {
        match self {
            ConfigNode::Object(fields) => fields.get_mut(key),
            _ => None,
        }
    }

    /// Element of a named list.
    pub fn resolve_by_name(&self, name: &str) -> Option<&ConfigNode> {
        match self {
            ConfigNode::NamedList(items) => items.iter().find(|item| item.name() == Some(name)),
            _ => None,
        }
    }

    pub fn resolve_by_name_mut(&mut self, name: &str) -> Option<&mut ConfigNode> {
        match self {
            ConfigNode::NamedList(items) => items.iter_mut().find(|item| item.name() == Some(name)),
            _ => None,
        }
    }

    /// Look up a dotted path. A segment applied to a named list selects the
    /// element with that name.
    pub fn get_path(&self, path: &str) -> Option<&ConfigNode> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| match node {
                ConfigNode::Object(_) => node.child(segment),
                ConfigNode::NamedList(_) => node.resolve_by_name(segment),
                ConfigNode::Scalar(_) => None,
            })
    }

    /// Scalar value at a dotted path.
    pub fn scalar(&self, path: &str) -> Option<&Value> {
        match self.get_path(path)? {
            ConfigNode::Scalar(value) => Some(value),
            _ => None,
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(path: &str, expected: &Value, found: impl Into<String>) -> ConfigError {
    ConfigError::TypeMismatch {
        path: path.to_string(),
        expected: type_name(expected),
        found: found.into(),
    }
}

/// Convert plain text to the type of the leaf it replaces.
///
/// Without an existing typed leaf the text is parsed as JSON, falling back
/// to a string.
pub fn coerce_text(existing: Option<&Value>, text: &str, path: &str) -> Result<Value, ConfigError> {
    let trimmed = text.trim();
    match existing {
        Some(expected @ Value::Bool(_)) => trimmed
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|_| mismatch(path, expected, trimmed)),
        Some(expected @ Value::Number(n)) if !n.is_f64() => trimmed
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| mismatch(path, expected, trimmed)),
        Some(expected @ Value::Number(_)) => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| mismatch(path, expected, trimmed)),
        Some(Value::String(_)) => Ok(Value::String(text.to_string())),
        _ => Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(text.to_string()))),
    }
}

/// Check a structured value against the leaf it replaces.
///
/// Integers widen to floats; strings are coerced like plain text.
pub fn coerce_value(existing: Option<&Value>, incoming: Value, path: &str) -> Result<Value, ConfigError> {
    let Some(expected) = existing.filter(|v| !v.is_null()) else {
        return Ok(incoming);
    };

    match (expected, incoming) {
        (_, Value::String(text)) if !expected.is_string() => coerce_text(Some(expected), &text, path),
        (Value::Number(e), Value::Number(n)) if e.is_f64() => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| mismatch(path, expected, n.to_string())),
        (Value::Number(_), Value::Number(n)) if n.is_f64() => {
            Err(mismatch(path, expected, "float"))
        }
        (expected, incoming) if type_name(expected) == type_name(&incoming) => Ok(incoming),
        (expected, incoming) => Err(mismatch(path, expected, type_name(&incoming))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn sample() -> ConfigNode {
        ConfigNode::from_value(json!({
            "log_level": "info",
            "recorders": [
                {"name": "cam1", "fps": 30, "extension": "jpg"},
                {"name": "lidar", "fps": 10, "extension": "pcd"}
            ],
            "tags": ["a", "b"],
            "drive_watcher": {"min_free_bytes": 10, "ratio": 0.5}
        }))
    }

    #[test]
    fn test_named_lists_are_detected() {
        let root = sample();
        assert!(matches!(root.child("recorders"), Some(ConfigNode::NamedList(_))));
        assert!(matches!(root.child("tags"), Some(ConfigNode::Scalar(_))));
        assert_eq!(ConfigNode::from_value(json!([])), ConfigNode::Scalar(json!([])));
    }

    #[test]
    fn test_get_path_through_named_list() {
        let root = sample();
        assert_eq!(root.scalar("recorders.lidar.fps"), Some(&json!(10)));
        assert_eq!(root.scalar("drive_watcher.ratio"), Some(&json!(0.5)));
        assert!(root.get_path("recorders.radar").is_none());
        assert!(root.get_path("log_level.deeper").is_none());
        assert_eq!(
            root.get_path("recorders.cam1").and_then(ConfigNode::name),
            Some("cam1")
        );
    }

    #[test]
    fn test_value_roundtrip_and_deserialize() {
        #[derive(Deserialize)]
        struct Recorder {
            name: String,
            fps: u32,
        }

        let root = sample();
        let back = ConfigNode::from_value(root.to_value());
        assert_eq!(back, root);

        let cam: Recorder = root
            .get_path("recorders.cam1")
            .expect("cam1")
            .deserialize()
            .expect("deserialize");
        assert_eq!(cam.name, "cam1");
        assert_eq!(cam.fps, 30);
    }

    #[test]
    fn test_from_toml() {
        let root = ConfigNode::from_toml_str(
            r#"
            node_name = "rig"

            [[recorders]]
            name = "cam1"
            fps = 30
            "#,
        )
        .expect("toml");
        assert_eq!(root.scalar("node_name"), Some(&json!("rig")));
        assert_eq!(root.scalar("recorders.cam1.fps"), Some(&json!(30)));
    }

    #[test]
    fn test_coerce_text_to_leaf_type() {
        assert_eq!(coerce_text(Some(&json!(30)), "25", "p").expect("int"), json!(25));
        assert_eq!(coerce_text(Some(&json!(true)), "false", "p").expect("bool"), json!(false));
        assert_eq!(coerce_text(Some(&json!(0.5)), "0.75", "p").expect("float"), json!(0.75));
        assert_eq!(coerce_text(Some(&json!("x")), "42", "p").expect("str"), json!("42"));
        assert_eq!(coerce_text(None, "42", "p").expect("json"), json!(42));
        assert_eq!(coerce_text(None, "hello", "p").expect("fallback"), json!("hello"));
        assert!(matches!(
            coerce_text(Some(&json!(30)), "fast", "p"),
            Err(ConfigError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_coerce_structured_value() {
        assert_eq!(coerce_value(Some(&json!(0.5)), json!(2), "p").expect("widen"), json!(2.0));
        assert_eq!(coerce_value(Some(&json!(1)), json!("7"), "p").expect("text"), json!(7));
        assert!(coerce_value(Some(&json!(1)), json!(1.5), "p").is_err());
        assert!(coerce_value(Some(&json!(true)), json!(1), "p").is_err());
        assert_eq!(coerce_value(None, json!({"a": 1}), "p").expect("any"), json!({"a": 1}));
    }
}
