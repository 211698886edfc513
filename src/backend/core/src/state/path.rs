//! Dot-delimited state paths and the tree operations behind them.

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// A parsed, non-empty dot path such as `agents.alpha.status`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePath {
    raw: String,
    segments: Vec<String>,
}

impl StatePath {
    /// Parse a dot path. Empty paths and empty segments are rejected.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(SyncError::invalid_path(path, "path is empty"));
        }

        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(SyncError::invalid_path(path, "path contains an empty segment"));
        }

        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if `other` is strictly nested under `self`.
    pub fn is_ancestor_of(&self, other: &str) -> bool {
        is_nested(&self.raw, other)
    }

    /// True if a write to `other` replaces this path: `other` is this path
    /// or one of its ancestors.
    pub fn is_covered_by(&self, other: &str) -> bool {
        self.raw == other || is_nested(other, &self.raw)
    }

    /// Read the value at this path.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |node, segment| node.as_object()?.get(segment))
    }

    /// Write `value` at this path, creating (or replacing non-object)
    /// intermediate nodes as needed.
    pub fn set(&self, root: &mut Value, value: Value) {
        let (last, parents) = match self.segments.split_last() {
            Some(split) => split,
            None => return,
        };

        let mut node = root;
        for segment in parents {
            node = ensure_object(node)
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(node).insert(last.clone(), value);
    }

    /// Remove the value at this path, returning it if it existed.
    pub fn remove(&self, root: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;

        let mut node = root;
        for segment in parents {
            node = node.as_object_mut()?.get_mut(segment)?;
        }
        node.as_object_mut()?.remove(last)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for StatePath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// True if `path` is strictly nested under `ancestor`.
fn is_nested(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'.'
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

/// An empty state tree.
pub fn empty_tree() -> Value {
    Value::Object(Map::new())
}

/// Deep-merge `source` over `target`.
///
/// Nested objects merge key by key; arrays and scalars in `source` replace
/// whatever `target` holds. If either side is not an object, `source` wins.
pub fn merge_values(target: &Value, source: &Value) -> Value {
    match (target, source) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let next = match merged.get(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_values(existing, value)
                    }
                    _ => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        _ => source.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse() {
        let path = StatePath::parse("a.b.c").unwrap();
        assert_eq!(path.segments(), &["a", "b", "c"]);
        assert_eq!(path.to_string(), "a.b.c");

        assert!(StatePath::parse("").is_err());
        assert!(StatePath::parse("a..b").is_err());
        assert!(StatePath::parse(".a").is_err());
        assert!(StatePath::parse("a.").is_err());
        assert!("x".parse::<StatePath>().is_ok());
    }

    #[test]
    fn test_is_ancestor_of() {
        let path = StatePath::parse("agents").unwrap();
        assert!(path.is_ancestor_of("agents.alpha"));
        assert!(!path.is_ancestor_of("agents"));
        assert!(!path.is_ancestor_of("agentsx.alpha"));
        assert!(!path.is_ancestor_of("other"));
    }

    #[test]
    fn test_is_covered_by() {
        let path = StatePath::parse("a.b").unwrap();
        assert!(path.is_covered_by("a.b"));
        assert!(path.is_covered_by("a"));
        assert!(!path.is_covered_by("a.b.c"));
        assert!(!path.is_covered_by("a.c"));
        assert!(!path.is_covered_by("a.bc"));
        assert!(!path.is_covered_by("ab"));
    }

    #[test]
    fn test_get_set_remove() {
        let mut tree = empty_tree();
        let path = StatePath::parse("a.b.c").unwrap();

        assert_eq!(path.get(&tree), None);
        path.set(&mut tree, json!(1));
        assert_eq!(tree, json!({"a": {"b": {"c": 1}}}));
        assert_eq!(path.get(&tree), Some(&json!(1)));

        assert_eq!(path.remove(&mut tree), Some(json!(1)));
        assert_eq!(tree, json!({"a": {"b": {}}}));
        assert_eq!(path.remove(&mut tree), None);
    }

    #[test]
    fn test_set_replaces_scalar_parent() {
        let mut tree = json!({"a": 5});
        StatePath::parse("a.b").unwrap().set(&mut tree, json!(true));
        assert_eq!(tree, json!({"a": {"b": true}}));
    }

    #[test]
    fn test_get_through_scalar_is_none() {
        let tree = json!({"a": 5});
        assert_eq!(StatePath::parse("a.b").unwrap().get(&tree), None);
    }

    #[test]
    fn test_null_is_present() {
        let tree = json!({"a": null});
        assert_eq!(StatePath::parse("a").unwrap().get(&tree), Some(&Value::Null));
    }

    #[test]
    fn test_merge_values() {
        let merged = merge_values(
            &json!({"a": 1, "b": 2, "n": {"x": 1, "y": [1]}}),
            &json!({"b": 3, "c": 4, "n": {"y": [2], "z": 0}}),
        );
        assert_eq!(
            merged,
            json!({"a": 1, "b": 3, "c": 4, "n": {"x": 1, "y": [2], "z": 0}})
        );
        assert_eq!(merge_values(&json!({"a": 1}), &json!(7)), json!(7));
        assert_eq!(merge_values(&json!(7), &json!({"a": 1})), json!({"a": 1}));
    }
}
