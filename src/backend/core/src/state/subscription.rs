//! State change subscriptions with optional trailing-edge debounce.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::operation::{Operation, OperationType};
use super::path::StatePath;
use crate::error::{panic_message, SyncError};
use crate::events::{Metadata, SubscriptionId, WILDCARD};
use crate::telemetry::StateMetrics;

/// Change notification delivered to state subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    /// Id of the operation that caused the change
    pub id: Uuid,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Empty for CLEAR
    pub path: String,
    pub value: Option<Value>,
    pub previous_value: Option<Value>,
    pub metadata: Option<Metadata>,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub source_id: String,
    pub updated_by: Option<String>,
}

impl StateUpdate {
    pub(crate) fn from_operation(op: &Operation, previous_value: Option<Value>, updated_by: Option<String>) -> Self {
        Self {
            id: op.id,
            op_type: op.op_type,
            path: op.path.clone(),
            value: op.value.clone(),
            previous_value,
            metadata: op.metadata.clone(),
            timestamp: op.timestamp,
            version: op.version,
            source_id: op.source_id.clone(),
            updated_by,
        }
    }

    fn metadata_contains(&self, required: &Metadata) -> bool {
        required.iter().all(|(key, value)| {
            self.metadata
                .as_ref()
                .and_then(|m| m.get(key))
                .is_some_and(|v| v == value)
        })
    }
}

/// Callback invoked with each (possibly coalesced) update.
pub type StateCallback = Arc<dyn Fn(&StateUpdate) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct StateSubscribeOptions {
    /// Deliver the current value synchronously on subscribe
    pub immediate: bool,
    /// Also deliver updates to paths nested under the subscribed path
    pub path_prefix: bool,
    /// Only deliver updates whose metadata contains every listed pair
    pub metadata: Option<Metadata>,
    /// Coalesce bursts, delivering only the latest update once quiet
    pub debounce: Option<Duration>,
}

impl StateSubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn with_path_prefix(mut self) -> Self {
        self.path_prefix = true;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }
}

/// Which paths a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Watch {
    All,
    Path(StatePath),
}

impl Watch {
    pub(crate) fn parse(path: &str) -> crate::error::Result<Self> {
        if path == WILDCARD {
            Ok(Self::All)
        } else {
            StatePath::parse(path).map(Self::Path)
        }
    }
}

pub(crate) struct StateSubscriber {
    id: SubscriptionId,
    watch: Watch,
    path_prefix: bool,
    metadata: Option<Metadata>,
    callback: StateCallback,
    debouncer: Option<Debouncer>,
    active: AtomicBool,
}

impl StateSubscriber {
    pub(crate) fn new(id: SubscriptionId, watch: Watch, options: &StateSubscribeOptions, callback: StateCallback) -> Self {
        Self {
            id,
            watch,
            path_prefix: options.path_prefix,
            metadata: options.metadata.clone(),
            callback,
            debouncer: options.debounce.filter(|d| !d.is_zero()).map(Debouncer::new),
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn watch(&self) -> &Watch {
        &self.watch
    }

    /// Whether this update should reach the subscriber at all.
    pub(crate) fn matches(&self, update: &StateUpdate) -> bool {
        let path_matches = match (&self.watch, update.op_type) {
            (Watch::All, _) | (_, OperationType::Clear) => true,
            (Watch::Path(path), _) => {
                path.as_str() == update.path || (self.path_prefix && path.is_ancestor_of(&update.path))
            }
        };

        path_matches
            && self
                .metadata
                .as_ref()
                .map_or(true, |required| update.metadata_contains(required))
    }

    /// Deliver now, or schedule through the debouncer.
    pub(crate) fn notify(&self, update: StateUpdate) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        match &self.debouncer {
            Some(debouncer) => debouncer.push(self.id, update, self.callback.clone()),
            None => invoke(self.id, &self.callback, &update),
        }
    }

    /// Deliver immediately, bypassing any debounce.
    pub(crate) fn notify_now(&self, update: &StateUpdate) {
        invoke(self.id, &self.callback, update);
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(debouncer) = &self.debouncer {
            debouncer.cancel();
        }
    }
}

fn invoke(id: SubscriptionId, callback: &StateCallback, update: &StateUpdate) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| callback(update)));
    match result {
        Ok(()) => StateMetrics::notified(1),
        Err(panic) => SyncError::handler_failed(id, panic_message(&*panic))
            .with_context("path", &update.path)
            .log(),
    }
}

// =============================================================================
// Debounce
// =============================================================================

#[derive(Default)]
struct DebounceState {
    pending: Option<StateUpdate>,
    deadline: Option<Instant>,
    timer_running: bool,
    cancelled: bool,
}

/// Trailing-edge debounce: each push replaces the pending update and
/// restarts the window; one timer per subscription fires once it is quiet.
struct Debouncer {
    window: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    fn push(&self, id: SubscriptionId, update: StateUpdate, callback: StateCallback) {
        {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.pending = Some(update);
            state.deadline = Some(Instant::now() + self.window);
            if state.timer_running {
                return;
            }
            state.timer_running = true;
        }

        let state = self.state.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    while let Some(wait) = step(id, &state, &callback) {
                        tokio::time::sleep(wait).await;
                    }
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    while let Some(wait) = step(id, &state, &callback) {
                        std::thread::sleep(wait);
                    }
                });
            }
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.pending = None;
    }
}

/// Advance the timer: returns how long to sleep, or `None` once the
/// pending update has been delivered (or the subscription cancelled).
fn step(id: SubscriptionId, state: &Mutex<DebounceState>, callback: &StateCallback) -> Option<Duration> {
    let pending = {
        let mut state = state.lock();
        let now = Instant::now();
        match state.deadline {
            Some(deadline) if !state.cancelled && deadline > now => return Some(deadline - now),
            _ => {}
        }
        state.timer_running = false;
        state.deadline = None;
        if state.cancelled {
            None
        } else {
            state.pending.take()
        }
    };

    if let Some(update) = pending {
        invoke(id, callback, &update);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(path: &str, metadata: Option<Metadata>) -> StateUpdate {
        let op = Operation::set(path, json!(1), 1, "s").with_metadata(metadata);
        StateUpdate::from_operation(&op, None, None)
    }

    fn subscriber(path: &str, options: StateSubscribeOptions) -> StateSubscriber {
        StateSubscriber::new(
            SubscriptionId(1),
            Watch::parse(path).unwrap(),
            &options,
            Arc::new(|_: &StateUpdate| {}),
        )
    }

    #[test]
    fn test_exact_and_prefix_matching() {
        let exact = subscriber("agents", StateSubscribeOptions::new());
        assert!(exact.matches(&update("agents", None)));
        assert!(!exact.matches(&update("agents.alpha", None)));

        let prefix = subscriber("agents", StateSubscribeOptions::new().with_path_prefix());
        assert!(prefix.matches(&update("agents.alpha", None)));
        assert!(!prefix.matches(&update("agentsx", None)));

        let all = subscriber("*", StateSubscribeOptions::new());
        assert!(all.matches(&update("anything.at.all", None)));
    }

    #[test]
    fn test_clear_matches_every_path() {
        let sub = subscriber("agents", StateSubscribeOptions::new());
        let clear = StateUpdate::from_operation(&Operation::clear(1, "s"), None, None);
        assert!(sub.matches(&clear));
    }

    #[test]
    fn test_metadata_filter() {
        let sub = subscriber("a", StateSubscribeOptions::new().with_metadata("team", "red"));
        let mut meta = Metadata::new();
        meta.insert("team".into(), json!("red"));
        meta.insert("extra".into(), json!(1));

        assert!(sub.matches(&update("a", Some(meta))));
        assert!(!sub.matches(&update("a", None)));
    }

    #[test]
    fn test_watch_parse() {
        assert_eq!(Watch::parse("*").unwrap(), Watch::All);
        assert!(Watch::parse("a..b").is_err());
    }

    #[test]
    fn test_debounce_on_plain_thread() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = StateSubscriber::new(
            SubscriptionId(7),
            Watch::All,
            &StateSubscribeOptions::new().with_debounce(Duration::from_millis(50)),
            Arc::new(move |u: &StateUpdate| sink.lock().push(u.value.clone())),
        );

        for i in 0..5 {
            let op = Operation::set("k", json!(i), i + 1, "s");
            sub.notify(StateUpdate::from_operation(&op, None, None));
        }
        assert!(seen.lock().is_empty());

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(*seen.lock(), vec![Some(json!(4))]);
    }

    #[test]
    fn test_deactivate_cancels_pending() {
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let sub = StateSubscriber::new(
            SubscriptionId(8),
            Watch::All,
            &StateSubscribeOptions::new().with_debounce(Duration::from_millis(30)),
            Arc::new(move |_: &StateUpdate| *sink.lock() += 1),
        );

        sub.notify(update("k", None));
        sub.deactivate();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*seen.lock(), 0);
    }
}
