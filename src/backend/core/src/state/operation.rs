//! State operations and the bounded operation log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use super::path::{empty_tree, StatePath};
use crate::events::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Set,
    Delete,
    Clear,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Clear => "clear",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One versioned mutation of the state tree.
///
/// `value` is the value the path held after the operation was applied at
/// its origin (for merges, the merged result). A CLEAR carries no path and,
/// optionally, a replacement tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: Uuid,

    #[serde(rename = "type")]
    pub op_type: OperationType,

    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    pub timestamp: DateTime<Utc>,

    pub version: u64,

    pub source_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Operation {
    fn new(
        op_type: OperationType,
        path: impl Into<String>,
        value: Option<Value>,
        version: u64,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type,
            path: path.into(),
            value,
            timestamp: Utc::now(),
            version,
            source_id: source_id.into(),
            metadata: None,
        }
    }

    pub fn set(path: impl Into<String>, value: Value, version: u64, source_id: impl Into<String>) -> Self {
        Self::new(OperationType::Set, path, Some(value), version, source_id)
    }

    pub fn delete(path: impl Into<String>, version: u64, source_id: impl Into<String>) -> Self {
        Self::new(OperationType::Delete, path, None, version, source_id)
    }

    pub fn clear(version: u64, source_id: impl Into<String>) -> Self {
        Self::new(OperationType::Clear, "", None, version, source_id)
    }

    pub fn with_metadata(mut self, metadata: Option<Metadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Apply this operation to a tree.
    ///
    /// Returns false if the operation's path does not parse; the tree is
    /// left untouched in that case.
    pub fn apply_to(&self, tree: &mut Value) -> bool {
        match self.op_type {
            OperationType::Clear => {
                *tree = match &self.value {
                    Some(replacement @ Value::Object(_)) => replacement.clone(),
                    _ => empty_tree(),
                };
                true
            }
            OperationType::Set | OperationType::Delete => {
                let Ok(path) = StatePath::parse(&self.path) else {
                    return false;
                };
                match &self.value {
                    Some(value) => path.set(tree, value.clone()),
                    None => {
                        path.remove(tree);
                    }
                }
                true
            }
        }
    }
}

/// Bounded, ordered log of applied operations.
///
/// Oldest entries are trimmed first and folded into the log's base tree,
/// so replaying the retained entries over the base still reproduces the
/// state. Ids of trimmed entries are remembered for a while longer so a
/// late duplicate is still recognised.
#[derive(Debug, Clone)]
pub struct OperationLog {
    entries: VecDeque<Operation>,
    max_entries: usize,
    base: Value,
    seen: HashSet<Uuid>,
    seen_order: VecDeque<Uuid>,
}

impl OperationLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
            base: empty_tree(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Rebuild a log from a persisted base and entries, oldest first.
    pub fn from_entries(base: Value, entries: Vec<Operation>, max_entries: usize) -> Self {
        let mut log = Self::new(max_entries);
        if base.is_object() {
            log.base = base;
        }
        for op in entries {
            log.push(op);
        }
        log
    }

    fn seen_capacity(&self) -> usize {
        self.max_entries.saturating_mul(4).max(1024)
    }

    /// Remember an operation id without logging the operation, e.g. a
    /// remote operation that lost conflict resolution.
    pub fn mark_seen(&mut self, id: Uuid) {
        if self.seen.insert(id) {
            self.seen_order.push_back(id);
            while self.seen_order.len() > self.seen_capacity() {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }

    /// Append and trim. Returns the number of entries trimmed.
    pub fn push(&mut self, op: Operation) -> usize {
        self.mark_seen(op.id);
        self.entries.push_back(op);
        let mut trimmed = 0;
        while self.entries.len() > self.max_entries {
            if let Some(old) = self.entries.pop_front() {
                old.apply_to(&mut self.base);
            }
            trimmed += 1;
        }
        trimmed
    }

    /// Whether an operation with this id has been applied or rejected recently.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Operation> {
        self.entries.iter().cloned().collect()
    }

    /// The tree the trimmed entries left behind.
    pub fn base(&self) -> &Value {
        &self.base
    }

    /// Rebuild a tree by applying the retained log, in order, to the base.
    pub fn replay(&self) -> Value {
        let mut tree = self.base.clone();
        for op in &self.entries {
            op.apply_to(&mut tree);
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_wire_shape() {
        let op = Operation::set("a.b", json!(1), 3, "node-a");
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "set");
        assert_eq!(value["path"], "a.b");
        assert_eq!(value["version"], 3);
        assert_eq!(value["sourceId"], "node-a");
        assert!(value.get("metadata").is_none());

        let delete = serde_json::to_value(Operation::delete("a", 4, "node-a")).unwrap();
        assert!(delete.get("value").is_none());
    }

    #[test]
    fn test_apply_to() {
        let mut tree = empty_tree();
        assert!(Operation::set("a.b", json!(1), 1, "s").apply_to(&mut tree));
        assert!(Operation::set("c", json!("x"), 2, "s").apply_to(&mut tree));
        assert!(Operation::delete("a.b", 3, "s").apply_to(&mut tree));
        assert_eq!(tree, json!({"a": {}, "c": "x"}));

        assert!(Operation::clear(4, "s").apply_to(&mut tree));
        assert_eq!(tree, json!({}));

        assert!(!Operation::set("bad..path", json!(1), 5, "s").apply_to(&mut tree));
        assert_eq!(tree, json!({}));
    }

    #[test]
    fn test_clear_with_replacement() {
        let mut tree = json!({"old": true});
        let mut op = Operation::clear(1, "s");
        op.value = Some(json!({"new": 1}));
        op.apply_to(&mut tree);
        assert_eq!(tree, json!({"new": 1}));
    }

    #[test]
    fn test_log_trims_oldest() {
        let mut log = OperationLog::new(3);
        let ops: Vec<Operation> = (1..=5)
            .map(|v| Operation::set("k", json!(v), v, "s"))
            .collect();
        for op in &ops {
            log.push(op.clone());
        }

        assert_eq!(log.len(), 3);
        let versions: Vec<u64> = log.iter().map(|op| op.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
        assert!(log.contains(&ops[0].id));
        assert_eq!(log.replay(), json!({"k": 5}));
    }

    #[test]
    fn test_trimmed_entries_fold_into_base() {
        let mut tree = empty_tree();
        let mut log = OperationLog::new(2);
        for op in [
            Operation::set("a", json!(1), 1, "s"),
            Operation::set("b", json!(2), 2, "s"),
            Operation::delete("a", 3, "s"),
            Operation::set("c", json!(3), 4, "s"),
        ] {
            op.apply_to(&mut tree);
            log.push(op);
        }

        assert_eq!(log.len(), 2);
        assert_eq!(log.base(), &json!({"a": 1, "b": 2}));
        assert_eq!(log.replay(), tree);

        let restored = OperationLog::from_entries(log.base().clone(), log.to_vec(), 2);
        assert_eq!(restored.replay(), tree);
    }

    #[test]
    fn test_replay_matches_sequence() {
        let mut tree = empty_tree();
        let mut log = OperationLog::new(100);
        for op in [
            Operation::set("a", json!({"x": 1}), 1, "s"),
            Operation::set("a.y", json!(2), 2, "s"),
            Operation::set("b", json!([1, 2]), 3, "s"),
            Operation::delete("a.x", 4, "s"),
        ] {
            op.apply_to(&mut tree);
            log.push(op);
        }
        assert_eq!(log.replay(), tree);
    }
}
