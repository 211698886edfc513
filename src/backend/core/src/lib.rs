#![allow(clippy::result_large_err)]
//! # Apex Sync
//!
//! Event store and replicated shared state for agent swarms.
//!
//! ## Architecture
//!
//! - **Events**: Append-only event store with filtering, correlation, retention and disk persistence
//! - **Messaging**: Topic publish/subscribe layered on the event store
//! - **State**: JSON state tree replicated between peers over the event store
//! - **Conflicts**: Last-write-wins, highest-version-wins, merge and custom resolution
//! - **Telemetry**: Structured logging and metrics

pub mod config;
pub mod error;
pub mod events;
pub mod state;
pub mod telemetry;

pub use config::{Config, EventStoreConfig, StateStoreConfig};
pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, SyncError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, EventStoreConfig, StateStoreConfig};
    pub use crate::error::{ErrorCode, ErrorSeverity, Result, SyncError};
    pub use crate::events::{
        EmitOptions, Event, EventFilter, EventId, EventPayload, EventStore, Message, MessageBus,
        Metadata, SubscribeOptions, Subscription, SubscriptionId, Transport,
    };
    pub use crate::state::{
        ConflictRecord, ConflictResolver, ConflictStrategy, Operation, OperationType, Resolution,
        SharedStateStore, StateSubscribeOptions, StateUpdate, StateUpdateOptions,
    };
    pub use crate::telemetry::{init_telemetry, LoggingConfig};
}
