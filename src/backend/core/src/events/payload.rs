//! Event payloads.
//!
//! Known kinds are typed so consumers can pattern-match on them; anything
//! else travels as opaque JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;
use crate::state::Operation;

/// Payload carried by an [`Event`](super::Event).
///
/// Serialized as `{"kind": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// A shared-state operation broadcast by its origin
    StateChange(StateChange),
    /// A store asking peers for their operation logs
    SyncRequest(SyncRequest),
    /// A peer's operation log, addressed to one requester
    SyncResponse(SyncResponse),
    /// A topic message published through the message bus
    Message(Message),
    /// Opaque passthrough
    Json(serde_json::Value),
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChange(_) => "state_change",
            Self::SyncRequest(_) => "sync_request",
            Self::SyncResponse(_) => "sync_response",
            Self::Message(_) => "message",
            Self::Json(_) => "json",
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }
}

impl Default for EventPayload {
    fn default() -> Self {
        Self::Json(serde_json::Value::Null)
    }
}

impl From<serde_json::Value> for EventPayload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<StateChange> for EventPayload {
    fn from(change: StateChange) -> Self {
        Self::StateChange(change)
    }
}

impl From<SyncRequest> for EventPayload {
    fn from(request: SyncRequest) -> Self {
        Self::SyncRequest(request)
    }
}

impl From<SyncResponse> for EventPayload {
    fn from(response: SyncResponse) -> Self {
        Self::SyncResponse(response)
    }
}

impl From<Message> for EventPayload {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

// =============================================================================
// State sync payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub operation: Operation,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
}

impl StateChange {
    pub fn new(operation: Operation, source_id: impl Into<String>) -> Self {
        Self {
            operation,
            source_id: source_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
}

impl SyncRequest {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub operations: Vec<Operation>,
    pub source_id: String,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
}

impl SyncResponse {
    pub fn new(operations: Vec<Operation>, source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            operations,
            source_id: source_id.into(),
            target_id: target_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_payload_shape() {
        let payload = EventPayload::from(json!({"a": 1}));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"kind": "json", "data": {"a": 1}}));
        assert_eq!(payload.kind(), "json");
        assert_eq!(payload.as_json(), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_sync_request_shape() {
        let payload = EventPayload::from(SyncRequest::new("node-a"));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "sync_request");
        assert_eq!(value["data"]["sourceId"], "node-a");

        let back: EventPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_default_is_null_json() {
        assert_eq!(EventPayload::default().as_json(), Some(&serde_json::Value::Null));
        assert!(EventPayload::default().as_message().is_none());
    }
}
