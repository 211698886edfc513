//! Shared State
//!
//! - **`path`**: dot-path addressing into the JSON tree.
//! - **`operation`**: versioned operations and the bounded operation log.
//! - **`conflict`**: ordering and resolution of concurrent writes.
//! - **`subscription`**: path subscriptions with optional debounce.
//! - **`snapshot`**: on-disk snapshot of tree, version and log.
//! - **`store`**: the replicated [`SharedStateStore`].

pub mod conflict;
pub mod operation;
pub mod path;
pub mod snapshot;
pub mod store;
pub mod subscription;

pub use conflict::{
    highest_version_wins, last_write_wins, ConflictOutcome, ConflictRecord, ConflictResolver,
    ConflictStrategy, Resolution,
};
pub use operation::{Operation, OperationLog, OperationType};
pub use path::{merge_values, StatePath};
pub use snapshot::StateSnapshot;
pub use store::{
    SharedStateStore, StateUpdateOptions, STATE_CHANGE_EVENT, STATE_SYNC_REQUEST_EVENT,
    STATE_SYNC_RESPONSE_EVENT,
};
pub use subscription::{StateCallback, StateSubscribeOptions, StateUpdate};
