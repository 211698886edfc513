//! Topic messaging on top of the event store.
//!
//! Every message is emitted as a `message` event tagged with its topic in
//! the event metadata, so topic subscription and history are plain event
//! filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{EmitOptions, Metadata};
use super::filter::EventFilter;
use super::payload::EventPayload;
use super::store::EventStore;
use super::subscription::Subscription;

/// Event type carrying topic messages.
pub const MESSAGE_EVENT: &str = "message";

const TOPIC_KEY: &str = "topic";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value, metadata: Option<Metadata>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// Publish/subscribe by topic.
#[derive(Debug, Clone)]
pub struct MessageBus {
    events: EventStore,
    source_id: Option<String>,
}

impl MessageBus {
    pub fn new(events: EventStore) -> Self {
        Self {
            events,
            source_id: None,
        }
    }

    /// Stamp every published message event with `source_id`.
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: serde_json::Value,
        metadata: Option<Metadata>,
    ) -> Message {
        let message = Message::new(topic, payload, metadata);

        let mut options = EmitOptions::new().with_metadata(TOPIC_KEY, message.topic.clone());
        options.source_id = self.source_id.clone();

        self.events
            .emit(MESSAGE_EVENT, EventPayload::Message(message.clone()), options);
        message
    }

    /// Deliver future messages on `topic`.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.events.subscribe(
            super::SubscribeOptions::new(topic_filter(topic)).only_future(),
            move |event| {
                if let Some(message) = event.payload.as_message() {
                    handler(message);
                }
            },
        )
    }

    /// Retained messages on `topic`, oldest first.
    pub fn history(&self, topic: &str) -> Vec<Message> {
        self.events
            .find_events(&topic_filter(topic))
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::Message(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

fn topic_filter(topic: &str) -> EventFilter {
    EventFilter::for_type(MESSAGE_EVENT).with_metadata(TOPIC_KEY, topic)
}
