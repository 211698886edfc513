//! Event filters.
//!
//! A filter is a conjunction of optional predicates. An empty filter
//! matches every event; a malformed type pattern matches none.

use chrono::{DateTime, Utc};
use regex::Regex;

use super::event::{Event, Metadata, WILDCARD};
use crate::error::SyncError;

/// Predicate on the event type.
#[derive(Debug, Clone)]
pub enum TypeMatcher {
    /// Exact type; `"*"` matches every type
    Exact(String),
    /// Regular expression over the type
    Pattern(Regex),
    /// A pattern that failed to compile; matches nothing
    Invalid(String),
}

impl TypeMatcher {
    pub fn exact(event_type: impl Into<String>) -> Self {
        Self::Exact(event_type.into())
    }

    /// Compile a regex pattern. A pattern that does not compile is logged
    /// and turned into a matcher that never matches.
    pub fn pattern(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => Self::Pattern(regex),
            Err(e) => {
                SyncError::invalid_filter(pattern, e.to_string()).log();
                Self::Invalid(pattern.to_string())
            }
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(t) => self.is_wildcard() || t == event_type,
            Self::Pattern(regex) => regex.is_match(event_type),
            Self::Invalid(_) => false,
        }
    }

    /// The single type this matcher selects, if it selects exactly one.
    pub fn exact_type(&self) -> Option<&str> {
        match self {
            Self::Exact(t) if !self.is_wildcard() => Some(t),
            _ => None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Exact(t) if t == WILDCARD)
    }
}

impl PartialEq for TypeMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Pattern(a), Self::Pattern(b)) => a.as_str() == b.as_str(),
            (Self::Invalid(a), Self::Invalid(b)) => a == b,
            _ => false,
        }
    }
}

/// Selects a subset of stored events.
///
/// An event matches iff every predicate that is set holds. Timestamp bounds
/// are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event_type: Option<TypeMatcher>,
    pub correlation_id: Option<String>,
    pub source_id: Option<String>,
    pub timestamp_from: Option<DateTime<Utc>>,
    pub timestamp_to: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
}

impl EventFilter {
    /// Matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches one exact type (`"*"` matches all).
    pub fn for_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(TypeMatcher::exact(event_type)),
            ..Self::default()
        }
    }

    /// Matches types against a regex pattern.
    pub fn matching(pattern: &str) -> Self {
        Self {
            event_type: Some(TypeMatcher::pattern(pattern)),
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_source_id(mut self, id: impl Into<String>) -> Self {
        self.source_id = Some(id.into());
        self
    }

    pub fn from_time(mut self, from: DateTime<Utc>) -> Self {
        self.timestamp_from = Some(from);
        self
    }

    pub fn until(mut self, to: DateTime<Utc>) -> Self {
        self.timestamp_to = Some(to);
        self
    }

    /// Require a metadata entry equal to `value`.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(matcher) = &self.event_type {
            if !matcher.matches(&event.event_type) {
                return false;
            }
        }

        if let Some(id) = &self.correlation_id {
            if event.correlation_id.as_ref() != Some(id) {
                return false;
            }
        }

        if let Some(id) = &self.source_id {
            if event.source_id.as_ref() != Some(id) {
                return false;
            }
        }

        if let Some(from) = self.timestamp_from {
            if event.timestamp < from {
                return false;
            }
        }

        if let Some(to) = self.timestamp_to {
            if event.timestamp > to {
                return false;
            }
        }

        if let Some(required) = &self.metadata {
            return required
                .iter()
                .all(|(key, value)| event.metadata_value(key) == Some(value));
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EmitOptions;
    use chrono::Duration;
    use serde_json::json;

    fn event(event_type: &str, options: EmitOptions) -> Event {
        Event::new(event_type, json!(null), options)
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(EventFilter::all().matches(&event("a", EmitOptions::new())));
    }

    #[test]
    fn test_type_matchers() {
        let e = event("task:completed", EmitOptions::new());
        assert!(EventFilter::for_type("task:completed").matches(&e));
        assert!(EventFilter::for_type("*").matches(&e));
        assert!(!EventFilter::for_type("task").matches(&e));
        assert!(EventFilter::matching("^task:").matches(&e));
        assert!(!EventFilter::matching("^agent:").matches(&e));
    }

    #[test]
    fn test_invalid_pattern_matches_nothing() {
        let filter = EventFilter::matching("task:(");
        assert!(matches!(filter.event_type, Some(TypeMatcher::Invalid(_))));
        assert!(!filter.matches(&event("task:(", EmitOptions::new())));
    }

    #[test]
    fn test_correlation_and_source() {
        let e = event("a", EmitOptions::new().with_correlation_id("c1").with_source_id("s1"));
        assert!(EventFilter::all().with_correlation_id("c1").matches(&e));
        assert!(!EventFilter::all().with_correlation_id("c2").matches(&e));
        assert!(EventFilter::all().with_source_id("s1").matches(&e));
        assert!(!EventFilter::all().with_source_id("s2").matches(&e));

        let bare = event("a", EmitOptions::new());
        assert!(!EventFilter::all().with_correlation_id("c1").matches(&bare));
    }

    #[test]
    fn test_timestamp_range_is_inclusive() {
        let e = event("a", EmitOptions::new());
        let ts = e.timestamp;
        assert!(EventFilter::all().from_time(ts).until(ts).matches(&e));
        assert!(!EventFilter::all().from_time(ts + Duration::milliseconds(1)).matches(&e));
        assert!(!EventFilter::all().until(ts - Duration::milliseconds(1)).matches(&e));
    }

    #[test]
    fn test_metadata_subset() {
        let e = event(
            "a",
            EmitOptions::new().with_metadata("k1", "v1").with_metadata("k2", 2),
        );
        assert!(EventFilter::all().with_metadata("k1", "v1").matches(&e));
        assert!(EventFilter::all()
            .with_metadata("k1", "v1")
            .with_metadata("k2", 2)
            .matches(&e));
        assert!(!EventFilter::all().with_metadata("k1", "other").matches(&e));
        assert!(!EventFilter::all().with_metadata("k3", "v3").matches(&e));
    }

    #[test]
    fn test_exact_type() {
        assert_eq!(TypeMatcher::exact("a").exact_type(), Some("a"));
        assert_eq!(TypeMatcher::exact("*").exact_type(), None);
        assert!(TypeMatcher::exact("*").is_wildcard());
        assert_eq!(TypeMatcher::pattern("a").exact_type(), None);
    }
}
