//! Event Store
//!
//! - **`event`**: the immutable [`Event`] record, ids and emit options.
//! - **`payload`**: typed payloads, including the state sync messages.
//! - **`filter`**: predicates over stored events.
//! - **`store`**: the in-memory [`EventStore`] with retention, correlation
//!   and synchronous publish/subscribe.
//! - **`persistence`**: one-file-per-event disk layout.
//! - **`transport`**: the [`Transport`] seam used by the shared state store.
//! - **`message`**: topic messaging over `message` events.

pub mod event;
pub mod filter;
pub mod message;
pub mod payload;
pub mod persistence;
pub mod store;
pub mod subscription;
pub mod transport;

pub use event::{EmitOptions, Event, EventId, Metadata, WILDCARD};
pub use filter::{EventFilter, TypeMatcher};
pub use message::{Message, MessageBus, MESSAGE_EVENT};
pub use payload::{EventPayload, StateChange, SyncRequest, SyncResponse};
pub use persistence::EventPersistence;
pub use store::EventStore;
pub use subscription::{EventHandler, SubscribeOptions, Subscription, SubscriptionId};
pub use transport::Transport;
