//! Event records.
//!
//! An [`Event`] is the immutable unit of communication: a type string, a
//! payload, an emission timestamp and optional correlation/source/metadata
//! annotations. Once stored it is never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::EventPayload;

/// Free-form key/value annotations, filterable by exact match.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Type matched by every subscription and filter.
pub const WILDCARD: &str = "*";

// =============================================================================
// Event IDs
// =============================================================================

/// Unique identifier for an event.
///
/// UUIDv7: the leading bits are the emission time in milliseconds, the rest
/// is random, so ids created in one process sort roughly by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// =============================================================================
// Emit Options
// =============================================================================

/// Optional annotations supplied when emitting an event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitOptions {
    pub correlation_id: Option<String>,
    pub source_id: Option<String>,
    pub metadata: Option<Metadata>,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_source_id(mut self, id: impl Into<String>) -> Self {
        self.source_id = Some(id.into());
        self
    }

    /// Add a single metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replace all metadata.
    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// =============================================================================
// Event
// =============================================================================

/// A stored, immutable event.
///
/// Serialized as `{id, type, payload, timestamp, correlationId?, sourceId?, metadata?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,

    #[serde(rename = "type")]
    pub event_type: String,

    pub payload: EventPayload,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Event {
    /// Build a new event stamped with the current time.
    pub fn new(event_type: impl Into<String>, payload: impl Into<EventPayload>, options: EmitOptions) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
            correlation_id: options.correlation_id,
            source_id: options.source_id,
            metadata: options.metadata,
        }
    }

    /// Look up a single metadata value.
    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_ids_are_unique_and_time_ordered() {
        let a = EventId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = EventId::new();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.0.get_version_num(), 7);
    }

    #[test]
    fn test_event_id_parse() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = Event::new(
            "task:completed",
            json!({"task": 7}),
            EmitOptions::new()
                .with_correlation_id("c1")
                .with_metadata("priority", "high"),
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "task:completed");
        assert_eq!(value["correlationId"], "c1");
        assert_eq!(value["metadata"]["priority"], "high");
        assert!(value.get("sourceId").is_none());
        assert_eq!(value["id"], event.id.to_string());

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_metadata_value() {
        let event = Event::new("x", json!(null), EmitOptions::new().with_metadata("k", 1));
        assert_eq!(event.metadata_value("k"), Some(&json!(1)));
        assert_eq!(event.metadata_value("missing"), None);
    }
}
