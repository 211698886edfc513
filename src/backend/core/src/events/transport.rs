//! Transport seam between the shared state store and the event bus.
//!
//! [`EventStore`](super::EventStore) is the in-process implementation. A
//! networked bus only needs to publish typed payloads and deliver them back
//! to listeners registered by type.

use super::event::{EmitOptions, Event};
use super::payload::EventPayload;
use super::subscription::{EventHandler, Subscription};

pub trait Transport: Send + Sync {
    /// Publish a payload under `event_type` and return the event as sent.
    fn publish(&self, event_type: &str, payload: EventPayload, options: EmitOptions) -> Event;

    /// Deliver future events of exactly `event_type` to `handler`.
    fn listen(&self, event_type: &str, handler: EventHandler) -> Subscription;
}
