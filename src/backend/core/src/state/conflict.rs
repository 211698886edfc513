//! Conflict detection and resolution for concurrent writes to one path.
//!
//! Every applied operation is recorded per exact path. An incoming write
//! is ordered against the highest-ordered record on its own path or an
//! ancestor path, or the last applied CLEAR:
//!
//! - same operation id: duplicate, ignored
//! - same source: sequential, the higher version applies
//! - different source, timestamps further apart than the conflict window:
//!   sequential, ordered by the strategy's key
//! - different source within the window: a conflict, resolved by strategy
//!
//! Recorded writes below the incoming path, or surviving a CLEAR, that
//! order after it are laid back over its result by the store.
//!
//! Resolution is pairwise deterministic: the same two operations under the
//! same strategy always produce the same result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::panic::{self, AssertUnwindSafe};

use super::operation::Operation;
use super::path::merge_values;
use crate::error::{panic_message, SyncError};

// =============================================================================
// Strategy
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Higher `(version, timestamp, source)` wins
    #[default]
    LastWriteWins,
    /// Higher `(version, source)` wins; timestamps are ignored
    HighestVersionWins,
    /// Deep-merge object values, newer on top; otherwise last-write-wins
    Merge,
    /// Ask the store's [`ConflictResolver`]; otherwise last-write-wins
    Custom,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::HighestVersionWins => "highest_version_wins",
            Self::Merge => "merge",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `incoming` orders after `existing` under last-write-wins.
pub fn last_write_wins(existing: &Operation, incoming: &Operation) -> bool {
    (incoming.version, incoming.timestamp, &incoming.source_id)
        > (existing.version, existing.timestamp, &existing.source_id)
}

/// Whether `incoming` orders after `existing` under highest-version-wins.
pub fn highest_version_wins(existing: &Operation, incoming: &Operation) -> bool {
    (incoming.version, &incoming.source_id) > (existing.version, &existing.source_id)
}

/// Total order of sequential writes under `strategy`.
pub(crate) fn sequence_order(strategy: ConflictStrategy, a: &Operation, b: &Operation) -> Ordering {
    match strategy {
        ConflictStrategy::HighestVersionWins => {
            (a.version, &a.source_id).cmp(&(b.version, &b.source_id))
        }
        _ => (a.version, a.timestamp, &a.source_id).cmp(&(b.version, b.timestamp, &b.source_id)),
    }
}

/// Whether `incoming` orders after `existing` under `strategy`.
pub(crate) fn orders_after(strategy: ConflictStrategy, existing: &Operation, incoming: &Operation) -> bool {
    sequence_order(strategy, incoming, existing) == Ordering::Greater
}

// =============================================================================
// Custom resolution
// =============================================================================

/// Result of a custom resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepExisting,
    ApplyIncoming,
    /// Apply the incoming operation with this value instead
    Replace(Value),
}

/// Caller-supplied resolution for [`ConflictStrategy::Custom`].
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, path: &str, existing: &Operation, incoming: &Operation) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&str, &Operation, &Operation) -> Resolution + Send + Sync,
{
    fn resolve(&self, path: &str, existing: &Operation, incoming: &Operation) -> Resolution {
        self(path, existing, incoming)
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOutcome {
    KeptExisting,
    AppliedIncoming,
    Merged,
    Replaced,
}

impl ConflictOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeptExisting => "kept_existing",
            Self::AppliedIncoming => "applied_incoming",
            Self::Merged => "merged",
            Self::Replaced => "replaced",
        }
    }
}

/// A detected conflict and how it was resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub path: String,
    /// Strategy actually used (after any fallback)
    pub strategy: ConflictStrategy,
    pub existing: Operation,
    pub incoming: Operation,
    pub outcome: ConflictOutcome,
    /// Value written to the path, if the incoming operation applied
    pub resolved_value: Option<Value>,
    pub detected_at: DateTime<Utc>,
}

// =============================================================================
// Arbitration
// =============================================================================

/// What to do with an incoming operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Verdict {
    /// Apply, writing this value (`None` removes the path)
    Apply(Option<Value>),
    /// Already applied
    Duplicate,
    /// Orders before the recorded operation
    Superseded,
}

pub(crate) struct Arbiter<'a> {
    pub strategy: ConflictStrategy,
    pub resolver: Option<&'a dyn ConflictResolver>,
    pub window: chrono::Duration,
}

impl Arbiter<'_> {
    /// Order `incoming` against the record that governs its path.
    ///
    /// `current` is the value the path holds now.
    pub(crate) fn decide(
        &self,
        record: Option<&Operation>,
        incoming: &Operation,
        current: Option<&Value>,
    ) -> (Verdict, Option<ConflictRecord>) {
        let Some(existing) = record else {
            return (Verdict::Apply(incoming.value.clone()), None);
        };

        if existing.id == incoming.id {
            return (Verdict::Duplicate, None);
        }

        if existing.source_id == incoming.source_id {
            return (ordered(last_write_wins(existing, incoming), incoming), None);
        }

        let gap = if incoming.timestamp >= existing.timestamp {
            incoming.timestamp - existing.timestamp
        } else {
            existing.timestamp - incoming.timestamp
        };
        if gap > self.window {
            return (ordered(orders_after(self.strategy, existing, incoming), incoming), None);
        }

        let (strategy, verdict, outcome) = self.resolve(existing, incoming, current);
        let resolved_value = match &verdict {
            Verdict::Apply(value) => value.clone(),
            _ => None,
        };
        let record = ConflictRecord {
            path: incoming.path.clone(),
            strategy,
            existing: existing.clone(),
            incoming: incoming.clone(),
            outcome,
            resolved_value,
            detected_at: Utc::now(),
        };
        (verdict, Some(record))
    }

    fn resolve(
        &self,
        existing: &Operation,
        incoming: &Operation,
        current: Option<&Value>,
    ) -> (ConflictStrategy, Verdict, ConflictOutcome) {
        match self.strategy {
            ConflictStrategy::LastWriteWins => lww(existing, incoming),
            ConflictStrategy::HighestVersionWins => {
                let (verdict, outcome) = by_order(highest_version_wins(existing, incoming), incoming);
                (ConflictStrategy::HighestVersionWins, verdict, outcome)
            }
            ConflictStrategy::Merge => match (current, &incoming.value) {
                (Some(current @ Value::Object(_)), Some(value @ Value::Object(_))) => {
                    let merged = if last_write_wins(existing, incoming) {
                        merge_values(current, value)
                    } else {
                        merge_values(value, current)
                    };
                    (
                        ConflictStrategy::Merge,
                        Verdict::Apply(Some(merged)),
                        ConflictOutcome::Merged,
                    )
                }
                _ => lww(existing, incoming),
            },
            ConflictStrategy::Custom => {
                let Some(resolver) = self.resolver else {
                    return lww(existing, incoming);
                };
                let path = incoming.path.as_str();
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    resolver.resolve(path, existing, incoming)
                }));
                match result {
                    Ok(Resolution::KeepExisting) => (
                        ConflictStrategy::Custom,
                        Verdict::Superseded,
                        ConflictOutcome::KeptExisting,
                    ),
                    Ok(Resolution::ApplyIncoming) => (
                        ConflictStrategy::Custom,
                        Verdict::Apply(incoming.value.clone()),
                        ConflictOutcome::AppliedIncoming,
                    ),
                    Ok(Resolution::Replace(value)) => (
                        ConflictStrategy::Custom,
                        Verdict::Apply(Some(value)),
                        ConflictOutcome::Replaced,
                    ),
                    Err(panic) => {
                        SyncError::resolver_failed(path, panic_message(&*panic)).log();
                        lww(existing, incoming)
                    }
                }
            }
        }
    }
}

fn lww(existing: &Operation, incoming: &Operation) -> (ConflictStrategy, Verdict, ConflictOutcome) {
    let (verdict, outcome) = by_order(last_write_wins(existing, incoming), incoming);
    (ConflictStrategy::LastWriteWins, verdict, outcome)
}

fn by_order(incoming_wins: bool, incoming: &Operation) -> (Verdict, ConflictOutcome) {
    if incoming_wins {
        (Verdict::Apply(incoming.value.clone()), ConflictOutcome::AppliedIncoming)
    } else {
        (Verdict::Superseded, ConflictOutcome::KeptExisting)
    }
}

fn ordered(incoming_wins: bool, incoming: &Operation) -> Verdict {
    by_order(incoming_wins, incoming).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn arbiter(strategy: ConflictStrategy) -> Arbiter<'static> {
        Arbiter {
            strategy,
            resolver: None,
            window: Duration::seconds(5),
        }
    }

    fn op(value: Value, version: u64, source: &str) -> Operation {
        Operation::set("cfg", value, version, source)
    }

    #[test]
    fn test_no_record_applies() {
        let incoming = op(json!(1), 1, "a");
        let (verdict, record) = arbiter(ConflictStrategy::LastWriteWins).decide(None, &incoming, None);
        assert_eq!(verdict, Verdict::Apply(Some(json!(1))));
        assert!(record.is_none());
    }

    #[test]
    fn test_duplicate() {
        let incoming = op(json!(1), 1, "a");
        let (verdict, _) =
            arbiter(ConflictStrategy::LastWriteWins).decide(Some(&incoming), &incoming, None);
        assert_eq!(verdict, Verdict::Duplicate);
    }

    #[test]
    fn test_same_source_is_sequential() {
        let older = op(json!(1), 1, "a");
        let newer = op(json!(2), 2, "a");
        let a = arbiter(ConflictStrategy::Merge);

        let (verdict, record) = a.decide(Some(&older), &newer, Some(&json!(1)));
        assert_eq!(verdict, Verdict::Apply(Some(json!(2))));
        assert!(record.is_none());

        let (verdict, _) = a.decide(Some(&newer), &older, Some(&json!(2)));
        assert_eq!(verdict, Verdict::Superseded);
    }

    #[test]
    fn test_lww_concurrent() {
        let existing = op(json!("x"), 3, "a");
        let incoming = op(json!("y"), 4, "b");
        let (verdict, record) =
            arbiter(ConflictStrategy::LastWriteWins).decide(Some(&existing), &incoming, None);
        assert_eq!(verdict, Verdict::Apply(Some(json!("y"))));
        let record = record.unwrap();
        assert_eq!(record.outcome, ConflictOutcome::AppliedIncoming);
        assert_eq!(record.strategy, ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn test_hvw_symmetry() {
        let low = op(json!("low"), 1, "a");
        let high = op(json!("high"), 2, "b");
        let a = arbiter(ConflictStrategy::HighestVersionWins);

        assert_eq!(a.decide(Some(&low), &high, None).0, Verdict::Apply(Some(json!("high"))));
        assert_eq!(a.decide(Some(&high), &low, None).0, Verdict::Superseded);
    }

    #[test]
    fn test_hvw_ignores_timestamp() {
        let now = Utc::now();
        let existing = op(json!("a"), 5, "a").with_timestamp(now);
        let incoming = op(json!("b"), 5, "b").with_timestamp(now - Duration::seconds(1));
        // Equal versions: source id breaks the tie regardless of timestamp.
        let (verdict, _) =
            arbiter(ConflictStrategy::HighestVersionWins).decide(Some(&existing), &incoming, None);
        assert_eq!(verdict, Verdict::Apply(Some(json!("b"))));
    }

    #[test]
    fn test_merge_objects() {
        let existing = op(json!({"a": 1, "b": 2}), 1, "a");
        let incoming = op(json!({"b": 3, "c": 4}), 2, "b");
        let current = json!({"a": 1, "b": 2});

        let (verdict, record) =
            arbiter(ConflictStrategy::Merge).decide(Some(&existing), &incoming, Some(&current));
        assert_eq!(verdict, Verdict::Apply(Some(json!({"a": 1, "b": 3, "c": 4}))));
        assert_eq!(record.unwrap().outcome, ConflictOutcome::Merged);
    }

    #[test]
    fn test_merge_when_incoming_is_older() {
        let existing = op(json!({"b": 3, "c": 4}), 2, "b");
        let incoming = op(json!({"a": 1, "b": 2}), 1, "a");
        let current = json!({"b": 3, "c": 4});

        let (verdict, _) =
            arbiter(ConflictStrategy::Merge).decide(Some(&existing), &incoming, Some(&current));
        assert_eq!(verdict, Verdict::Apply(Some(json!({"a": 1, "b": 3, "c": 4}))));
    }

    #[test]
    fn test_merge_falls_back_for_scalars() {
        let existing = op(json!(1), 2, "a");
        let incoming = op(json!({"x": 1}), 1, "b");
        let (verdict, record) =
            arbiter(ConflictStrategy::Merge).decide(Some(&existing), &incoming, Some(&json!(1)));
        assert_eq!(verdict, Verdict::Superseded);
        assert_eq!(record.unwrap().strategy, ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn test_custom_resolver() {
        let resolver = |_: &str, _: &Operation, _: &Operation| Resolution::Replace(json!("custom"));
        let a = Arbiter {
            strategy: ConflictStrategy::Custom,
            resolver: Some(&resolver),
            window: Duration::seconds(5),
        };
        let existing = op(json!(1), 1, "a");
        let incoming = op(json!(2), 2, "b");

        let (verdict, record) = a.decide(Some(&existing), &incoming, None);
        assert_eq!(verdict, Verdict::Apply(Some(json!("custom"))));
        assert_eq!(record.unwrap().outcome, ConflictOutcome::Replaced);
    }

    #[test]
    fn test_custom_without_resolver_or_panicking_falls_back() {
        let existing = op(json!(1), 1, "a");
        let incoming = op(json!(2), 2, "b");

        let (verdict, _) = arbiter(ConflictStrategy::Custom).decide(Some(&existing), &incoming, None);
        assert_eq!(verdict, Verdict::Apply(Some(json!(2))));

        let resolver = |_: &str, _: &Operation, _: &Operation| -> Resolution { panic!("bad resolver") };
        let a = Arbiter {
            strategy: ConflictStrategy::Custom,
            resolver: Some(&resolver),
            window: Duration::seconds(5),
        };
        let (verdict, record) = a.decide(Some(&existing), &incoming, None);
        assert_eq!(verdict, Verdict::Apply(Some(json!(2))));
        assert_eq!(record.unwrap().strategy, ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn test_outside_window_is_not_a_conflict() {
        let now = Utc::now();
        let existing = op(json!({"a": 1}), 1, "a").with_timestamp(now - Duration::seconds(60));
        let incoming = op(json!({"b": 2}), 2, "b").with_timestamp(now);

        let (verdict, record) = arbiter(ConflictStrategy::Merge).decide(
            Some(&existing),
            &incoming,
            Some(&json!({"a": 1})),
        );
        assert_eq!(verdict, Verdict::Apply(Some(json!({"b": 2}))));
        assert!(record.is_none());
    }
}
