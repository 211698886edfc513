//! Replicated shared state store.
//!
//! Each store owns a JSON tree addressed by dot paths. Local writes become
//! versioned operations that are applied, logged, delivered to subscribers,
//! broadcast over the event transport and snapshotted. Peers apply those
//! operations through the same conflict arbitration, so stores that have
//! seen the same operations converge on the same tree.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::conflict::{
    orders_after, sequence_order, Arbiter, ConflictRecord, ConflictResolver, ConflictStrategy,
    Verdict,
};
use super::operation::{Operation, OperationLog, OperationType};
use super::path::{empty_tree, merge_values, StatePath};
use super::snapshot::StateSnapshot;
use super::subscription::{StateSubscribeOptions, StateSubscriber, StateUpdate, Watch};
use crate::config::StateStoreConfig;
use crate::error::SyncError;
use crate::events::{
    EmitOptions, Event, EventPayload, EventStore, Metadata, StateChange, Subscription, SubscriptionId,
    SyncRequest, SyncResponse, Transport, WILDCARD,
};
use crate::telemetry::{PersistenceMetrics, StateMetrics};

/// Event type carrying a single operation to peers.
pub const STATE_CHANGE_EVENT: &str = "state:change";
/// Event type asking peers for their operation logs.
pub const STATE_SYNC_REQUEST_EVENT: &str = "state:sync:request";
/// Event type answering a sync request.
pub const STATE_SYNC_RESPONSE_EVENT: &str = "state:sync:response";

const MAX_CONFLICT_RECORDS: usize = 256;

// =============================================================================
// Update Options
// =============================================================================

/// Per-write options for local mutations.
#[derive(Debug, Clone)]
pub struct StateUpdateOptions {
    /// Deep-merge an object value into the object already at the path
    pub merge: bool,
    /// Deliver the change to local subscribers
    pub notify: bool,
    /// Broadcast to peers; `None` follows the store configuration
    pub broadcast: Option<bool>,
    /// Attached to the operation and every notification it causes
    pub metadata: Option<Metadata>,
    /// Overrides the configured strategy for this write
    pub conflict_strategy: Option<ConflictStrategy>,
    /// Reported to subscribers as `updated_by`
    pub updated_by: Option<String>,
}

impl Default for StateUpdateOptions {
    fn default() -> Self {
        Self {
            merge: false,
            notify: true,
            broadcast: None,
            metadata: None,
            conflict_strategy: None,
            updated_by: None,
        }
    }
}

impl StateUpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(mut self) -> Self {
        self.merge = true;
        self
    }

    /// Do not notify local subscribers.
    pub fn silent(mut self) -> Self {
        self.notify = false;
        self
    }

    /// Apply locally without broadcasting.
    pub fn local_only(mut self) -> Self {
        self.broadcast = Some(false);
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = Some(strategy);
        self
    }

    pub fn with_updated_by(mut self, updated_by: impl Into<String>) -> Self {
        self.updated_by = Some(updated_by.into());
        self
    }
}

// =============================================================================
// State Data
// =============================================================================

struct StateData {
    tree: Value,
    version: u64,
    log: OperationLog,
    /// Orders records and clears against each other
    strategy: ConflictStrategy,
    /// Highest-ordered operation applied to each exact path
    last_applied: HashMap<String, Operation>,
    /// Last applied CLEAR; every path is ordered against it
    cleared: Option<Operation>,
}

impl StateData {
    fn new(max_log: usize, strategy: ConflictStrategy) -> Self {
        Self {
            tree: empty_tree(),
            version: 0,
            log: OperationLog::new(max_log),
            strategy,
            last_applied: HashMap::new(),
            cleared: None,
        }
    }

    fn from_snapshot(snapshot: StateSnapshot, max_log: usize, strategy: ConflictStrategy) -> Self {
        let mut data = Self::new(max_log, strategy);
        if snapshot.state.is_object() {
            data.tree = snapshot.state;
        }
        data.version = snapshot.version;
        data.log = OperationLog::from_entries(snapshot.log_base, snapshot.operation_log, max_log);
        let retained: Vec<Operation> = data.log.to_vec();
        for op in &retained {
            data.record(op);
        }
        data
    }

    /// The record a write to `path` is ordered against: the highest-ordered
    /// record on the path or an ancestor, or the last CLEAR.
    fn governing(&self, path: &StatePath, strategy: ConflictStrategy) -> Option<&Operation> {
        self.last_applied
            .iter()
            .filter(|(recorded, _)| path.is_covered_by(recorded))
            .map(|(_, op)| op)
            .chain(self.cleared.as_ref())
            .max_by(|a, b| sequence_order(strategy, a, b))
    }

    /// The form in which an arbitrated write commits.
    ///
    /// Writes recorded under its path that order after it are laid back
    /// over its value, as if they had arrived later.
    fn settle_write(&self, path: &StatePath, op: Operation) -> Operation {
        let strategy = self.strategy;
        let mut survivors: Vec<&Operation> = self
            .last_applied
            .iter()
            .filter(|(recorded, later)| {
                path.is_ancestor_of(recorded) && orders_after(strategy, &op, later)
            })
            .map(|(_, later)| later)
            .collect();
        if survivors.is_empty() {
            return op;
        }
        survivors.sort_by(|a, b| sequence_order(strategy, a, b));

        let mut scratch = empty_tree();
        if let Some(value) = &op.value {
            path.set(&mut scratch, value.clone());
        }
        for later in survivors {
            later.apply_to(&mut scratch);
        }
        let value = path.get(&scratch).cloned();
        resolved(op, value)
    }

    /// The form in which a peer's CLEAR commits.
    ///
    /// Writes recorded after the CLEAR survive it and are replayed onto its
    /// replacement tree. `None` if an equal or later CLEAR already applied.
    fn settle_clear(&self, op: Operation) -> Option<Operation> {
        let strategy = self.strategy;
        if self
            .cleared
            .as_ref()
            .is_some_and(|last| !orders_after(strategy, last, &op))
        {
            return None;
        }

        let mut survivors: Vec<&Operation> = self
            .last_applied
            .values()
            .filter(|recorded| orders_after(strategy, &op, recorded))
            .collect();
        if survivors.is_empty() {
            return Some(op);
        }
        survivors.sort_by(|a, b| sequence_order(strategy, a, b));

        let mut tree = match &op.value {
            Some(base @ Value::Object(_)) => base.clone(),
            _ => empty_tree(),
        };
        for recorded in survivors {
            recorded.apply_to(&mut tree);
        }
        Some(Operation {
            value: Some(tree),
            ..op
        })
    }

    fn record(&mut self, op: &Operation) {
        let strategy = self.strategy;
        if op.op_type == OperationType::Clear {
            self.last_applied
                .retain(|_, recorded| orders_after(strategy, op, recorded));
            if self
                .cleared
                .as_ref()
                .map_or(true, |last| orders_after(strategy, last, op))
            {
                self.cleared = Some(op.clone());
            }
            return;
        }
        // A resolver may write into a path whose record orders later;
        // keep that record and take the value.
        let record_orders_later = self
            .last_applied
            .get(&op.path)
            .is_some_and(|existing| orders_after(strategy, op, existing));
        if record_orders_later {
            if let Some(existing) = self.last_applied.get_mut(&op.path) {
                existing.value = op.value.clone();
            }
        } else {
            self.last_applied.insert(op.path.clone(), op.clone());
        }
    }

    /// Apply an arbitrated operation: tree, version, log, record.
    fn commit(&mut self, op: &Operation) {
        op.apply_to(&mut self.tree);
        self.version = self.version.max(op.version);
        self.log.push(op.clone());
        self.record(op);
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(self.tree.clone(), self.version, self.log.to_vec())
            .with_log_base(self.log.base().clone())
    }
}

/// The arbitrated form of `incoming`: a `None` value removes the path.
fn resolved(incoming: Operation, value: Option<Value>) -> Operation {
    let op_type = match (&value, incoming.op_type) {
        (_, OperationType::Clear) => OperationType::Clear,
        (Some(_), _) => OperationType::Set,
        (None, _) => OperationType::Delete,
    };
    Operation {
        op_type,
        value,
        ..incoming
    }
}

// =============================================================================
// Shared State Store
// =============================================================================

struct StateInner {
    source_id: String,
    config: StateStoreConfig,
    conflict_window: chrono::Duration,
    snapshot_path: Option<PathBuf>,
    transport: Arc<dyn Transport>,
    data: Mutex<StateData>,
    conflicts: Mutex<VecDeque<ConflictRecord>>,
    subscribers: RwLock<BTreeMap<SubscriptionId, Arc<StateSubscriber>>>,
    next_subscription: AtomicU64,
    resolver: RwLock<Option<Arc<dyn ConflictResolver>>>,
    listeners: Mutex<Vec<Subscription>>,
    /// Serializes snapshot writes
    persist: Mutex<()>,
}

impl Drop for StateInner {
    fn drop(&mut self) {
        for listener in self.listeners.get_mut().drain(..) {
            listener.unsubscribe();
        }
        for subscriber in self.subscribers.get_mut().values() {
            subscriber.deactivate();
        }
    }
}

/// A replicated JSON tree kept consistent with its peers over a
/// [`Transport`].
///
/// Cloning is cheap and every clone shares the same state. Transport
/// listeners hold only a weak reference, so dropping the last clone
/// detaches the store from its peers.
#[derive(Clone)]
pub struct SharedStateStore {
    inner: Arc<StateInner>,
}

impl SharedStateStore {
    /// Create a store attached to `transport`.
    ///
    /// Loads the configured snapshot (a missing or unreadable snapshot
    /// starts empty), starts listening for peer traffic and, when
    /// `sync_on_start` is set, asks peers for their operation logs.
    pub fn new(config: StateStoreConfig, transport: Arc<dyn Transport>) -> Self {
        let source_id = config
            .source_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let snapshot_path = snapshot_path(&config);
        let data = load_state(
            snapshot_path.as_deref(),
            config.max_operation_log,
            config.conflict_strategy,
        );
        let conflict_window = chrono::Duration::from_std(config.conflict_window)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        let version = data.version;
        let store = Self {
            inner: Arc::new(StateInner {
                source_id,
                conflict_window,
                snapshot_path,
                transport,
                data: Mutex::new(data),
                conflicts: Mutex::new(VecDeque::new()),
                subscribers: RwLock::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(1),
                resolver: RwLock::new(None),
                listeners: Mutex::new(Vec::new()),
                persist: Mutex::new(()),
                config,
            }),
        };

        store.attach();
        info!(
            source_id = %store.inner.source_id,
            version,
            strategy = %store.inner.config.conflict_strategy,
            "Shared state store ready"
        );

        if store.inner.config.sync_on_start {
            store.request_state_sync();
        }
        store
    }

    /// Create a store whose peers share `events`.
    pub fn with_event_store(config: StateStoreConfig, events: &EventStore) -> Self {
        Self::new(config, Arc::new(events.clone()))
    }

    /// A standalone store on a private in-memory event store.
    pub fn in_memory(config: StateStoreConfig) -> Self {
        Self::with_event_store(config, &EventStore::in_memory())
    }

    fn attach(&self) {
        let transport = &self.inner.transport;
        let mut listeners = Vec::with_capacity(3);

        let weak = Arc::downgrade(&self.inner);
        listeners.push(transport.listen(
            STATE_CHANGE_EVENT,
            Arc::new(move |event: &Event| {
                if let (Some(inner), EventPayload::StateChange(change)) = (weak.upgrade(), &event.payload) {
                    SharedStateStore { inner }.on_state_change(change);
                }
            }),
        ));

        let weak = Arc::downgrade(&self.inner);
        listeners.push(transport.listen(
            STATE_SYNC_REQUEST_EVENT,
            Arc::new(move |event: &Event| {
                if let (Some(inner), EventPayload::SyncRequest(request)) = (weak.upgrade(), &event.payload) {
                    SharedStateStore { inner }.on_sync_request(request);
                }
            }),
        ));

        let weak = Arc::downgrade(&self.inner);
        listeners.push(transport.listen(
            STATE_SYNC_RESPONSE_EVENT,
            Arc::new(move |event: &Event| {
                if let (Some(inner), EventPayload::SyncResponse(response)) = (weak.upgrade(), &event.payload) {
                    SharedStateStore { inner }.on_sync_response(response);
                }
            }),
        ));

        *self.inner.listeners.lock() = listeners;
    }

    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Value at `path`, or `None` if absent or the path is malformed.
    pub fn get_state(&self, path: &str) -> Option<Value> {
        let path = match StatePath::parse(path) {
            Ok(path) => path,
            Err(e) => {
                trace!(error = %e, "Read of malformed path");
                return None;
            }
        };
        path.get(&self.inner.data.lock().tree).cloned()
    }

    pub fn get_state_or(&self, path: &str, default: Value) -> Value {
        self.get_state(path).unwrap_or(default)
    }

    /// Value at `path` deserialized into `T`; `None` if absent or mistyped.
    pub fn get_state_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.get_state(path)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn has_state(&self, path: &str) -> bool {
        self.get_state(path).is_some()
    }

    pub fn get_full_state(&self) -> Value {
        self.inner.data.lock().tree.clone()
    }

    pub fn get_state_version(&self) -> u64 {
        self.inner.data.lock().version
    }

    /// Retained operations, oldest first.
    pub fn get_operation_log(&self) -> Vec<Operation> {
        self.inner.data.lock().log.to_vec()
    }

    /// The tree rebuilt from the retained operation log alone.
    pub fn replay_operation_log(&self) -> Value {
        self.inner.data.lock().log.replay()
    }

    /// Recently detected conflicts, oldest first.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.conflicts.lock().iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    // -------------------------------------------------------------------------
    // Local writes
    // -------------------------------------------------------------------------

    /// Write `value` at `path`.
    ///
    /// Returns the applied operation, or `None` if the path is malformed or
    /// conflict resolution kept the existing value.
    pub fn set_state(&self, path: &str, value: Value, options: StateUpdateOptions) -> Option<Operation> {
        let path = match StatePath::parse(path) {
            Ok(path) => path,
            Err(e) => {
                e.log();
                return None;
            }
        };
        let source_id = self.inner.source_id.clone();
        let merge = options.merge;

        self.commit_local(&path, &options, |version, current| {
            let value = match current {
                Some(current) if merge && current.is_object() && value.is_object() => {
                    merge_values(current, &value)
                }
                _ => value,
            };
            Some(Operation::set(path.as_str(), value, version, source_id))
        })
    }

    /// Remove the value at `path`. Returns false if nothing was there.
    pub fn delete_state(&self, path: &str, options: StateUpdateOptions) -> bool {
        let path = match StatePath::parse(path) {
            Ok(path) => path,
            Err(e) => {
                e.log();
                return false;
            }
        };
        let source_id = self.inner.source_id.clone();

        self.commit_local(&path, &options, |version, current| {
            if current.is_none() {
                return None;
            }
            Some(Operation::delete(path.as_str(), version, source_id))
        })
        .is_some()
    }

    /// Reset the tree to `{}`. Every subscriber is notified.
    pub fn clear_state(&self, options: StateUpdateOptions) -> Operation {
        let (op, previous) = {
            let mut data = self.inner.data.lock();
            let previous = data.tree.clone();
            let op = Operation::clear(data.version + 1, self.inner.source_id.as_str())
                .with_metadata(options.metadata.clone());
            data.commit(&op);
            (op, previous)
        };

        StateMetrics::operation(op.op_type.as_str(), "local");
        info!(version = op.version, "State cleared");
        self.publish_local(&op, Some(previous), &options);
        op
    }

    /// Replace the whole tree: clear, then set each top-level key.
    pub fn set_full_state(&self, state: Value, options: StateUpdateOptions) {
        let Value::Object(entries) = state else {
            SyncError::invalid_path(WILDCARD, "full state must be an object").log();
            return;
        };

        self.clear_state(options.clone());
        for (key, value) in entries {
            self.set_state(&key, value, options.clone());
        }
    }

    fn commit_local<F>(&self, path: &StatePath, options: &StateUpdateOptions, build: F) -> Option<Operation>
    where
        F: FnOnce(u64, Option<&Value>) -> Option<Operation>,
    {
        let strategy = options
            .conflict_strategy
            .unwrap_or(self.inner.config.conflict_strategy);
        let resolver = self.inner.resolver.read().clone();

        let (outcome, conflict) = {
            let mut data = self.inner.data.lock();
            let previous = path.get(&data.tree).cloned();
            let incoming = build(data.version + 1, previous.as_ref())?.with_metadata(options.metadata.clone());

            let (verdict, conflict) = self.arbiter(strategy, resolver.as_deref()).decide(
                data.governing(path, strategy),
                &incoming,
                previous.as_ref(),
            );
            match verdict {
                Verdict::Apply(value) => {
                    let op = data.settle_write(path, resolved(incoming, value));
                    data.commit(&op);
                    (Some((op, previous)), conflict)
                }
                Verdict::Duplicate | Verdict::Superseded => (None, conflict),
            }
        };

        if let Some(record) = conflict {
            self.record_conflict(record);
        }
        let Some((op, previous)) = outcome else {
            debug!(path = %path, "Local write kept the existing value");
            return None;
        };

        StateMetrics::operation(op.op_type.as_str(), "local");
        debug!(path = %path, op = %op.op_type, version = op.version, "State updated");
        self.publish_local(&op, previous, options);
        Some(op)
    }

    fn publish_local(&self, op: &Operation, previous: Option<Value>, options: &StateUpdateOptions) {
        if options.notify {
            self.notify(&StateUpdate::from_operation(op, previous, options.updated_by.clone()));
        }
        if options.broadcast.unwrap_or(self.inner.config.broadcast_by_default) {
            self.broadcast(op);
        }
        self.persist();
    }

    fn broadcast(&self, op: &Operation) {
        let source_id = self.inner.source_id.as_str();
        let mut options = EmitOptions::new().with_source_id(source_id);
        if let Some(metadata) = &op.metadata {
            options = options.with_metadata_map(metadata.clone());
        }
        self.inner.transport.publish(
            STATE_CHANGE_EVENT,
            StateChange::new(op.clone(), source_id).into(),
            options,
        );
    }

    // -------------------------------------------------------------------------
    // Remote operations
    // -------------------------------------------------------------------------

    /// Apply an operation received from a peer.
    ///
    /// Own and already-seen operations are ignored. The result is delivered
    /// to subscribers but never re-broadcast. Returns whether the tree
    /// changed.
    pub fn apply_remote_operation(&self, op: Operation) -> bool {
        self.apply_remote(op, true)
    }

    fn apply_remote(&self, op: Operation, persist: bool) -> bool {
        if op.source_id == self.inner.source_id {
            return false;
        }
        let strategy = self.inner.config.conflict_strategy;
        let resolver = self.inner.resolver.read().clone();

        let (outcome, conflict) = {
            let mut data = self.inner.data.lock();
            if data.log.contains(&op.id) {
                trace!(operation = %op.id, "Skipping already-seen operation");
                return false;
            }

            match op.op_type {
                OperationType::Clear => {
                    let id = op.id;
                    match data.settle_clear(op) {
                        Some(op) => {
                            let previous = data.tree.clone();
                            data.commit(&op);
                            (Some((op, Some(previous))), None)
                        }
                        None => {
                            trace!(operation = %id, "Skipping superseded clear");
                            data.log.mark_seen(id);
                            (None, None)
                        }
                    }
                }
                OperationType::Set | OperationType::Delete => match StatePath::parse(&op.path) {
                    Err(e) => {
                        e.log();
                        data.log.mark_seen(op.id);
                        (None, None)
                    }
                    Ok(path) => {
                        let previous = path.get(&data.tree).cloned();
                        let (verdict, conflict) = self
                            .arbiter(strategy, resolver.as_deref())
                            .decide(data.governing(&path, strategy), &op, previous.as_ref());
                        match verdict {
                            Verdict::Apply(value) => {
                                let op = data.settle_write(&path, resolved(op, value));
                                data.commit(&op);
                                (Some((op, previous)), conflict)
                            }
                            Verdict::Duplicate | Verdict::Superseded => {
                                data.log.mark_seen(op.id);
                                (None, conflict)
                            }
                        }
                    }
                },
            }
        };

        if let Some(record) = conflict {
            self.record_conflict(record);
        }
        let Some((op, previous)) = outcome else {
            return false;
        };

        StateMetrics::operation(op.op_type.as_str(), "remote");
        debug!(
            path = %op.path,
            op = %op.op_type,
            version = op.version,
            from = %op.source_id,
            "Applied remote operation"
        );

        let updated_by = Some(op.source_id.clone());
        self.notify(&StateUpdate::from_operation(&op, previous, updated_by));
        if persist {
            self.persist();
        }
        true
    }

    /// Apply a batch of peer operations in `(timestamp, version)` order,
    /// persisting once at the end. Returns how many changed the tree.
    pub fn sync_state(&self, operations: Vec<Operation>) -> usize {
        let received = operations.len();
        let mut fresh: Vec<Operation> = {
            let data = self.inner.data.lock();
            operations
                .into_iter()
                .filter(|op| op.source_id != self.inner.source_id && !data.log.contains(&op.id))
                .collect()
        };
        if fresh.is_empty() {
            trace!(received, "Nothing new to sync");
            return 0;
        }
        fresh.sort_by(|a, b| (a.timestamp, a.version).cmp(&(b.timestamp, b.version)));

        let mut applied = 0;
        for op in fresh {
            if self.apply_remote(op, false) {
                applied += 1;
            }
        }
        if applied > 0 {
            self.persist();
        }

        info!(received, applied, version = self.get_state_version(), "Synced operations from peer");
        applied
    }

    /// Ask peers to send their operation logs.
    pub fn request_state_sync(&self) {
        let source_id = self.inner.source_id.as_str();
        debug!(source_id, "Requesting state sync");
        self.inner.transport.publish(
            STATE_SYNC_REQUEST_EVENT,
            SyncRequest::new(source_id).into(),
            EmitOptions::new().with_source_id(source_id),
        );
    }

    fn on_state_change(&self, change: &StateChange) {
        if change.source_id == self.inner.source_id {
            return;
        }
        self.apply_remote(change.operation.clone(), true);
    }

    fn on_sync_request(&self, request: &SyncRequest) {
        if request.source_id == self.inner.source_id {
            return;
        }
        let operations = self.get_operation_log();
        let source_id = self.inner.source_id.as_str();
        debug!(
            requester = %request.source_id,
            operations = operations.len(),
            "Answering sync request"
        );
        self.inner.transport.publish(
            STATE_SYNC_RESPONSE_EVENT,
            SyncResponse::new(operations, source_id, request.source_id.as_str()).into(),
            EmitOptions::new().with_source_id(source_id),
        );
    }

    fn on_sync_response(&self, response: &SyncResponse) {
        if response.target_id != self.inner.source_id || response.source_id == self.inner.source_id {
            return;
        }
        self.sync_state(response.operations.clone());
    }

    // -------------------------------------------------------------------------
    // Conflicts
    // -------------------------------------------------------------------------

    /// Install the resolver used by [`ConflictStrategy::Custom`].
    pub fn set_conflict_resolver<R>(&self, resolver: R)
    where
        R: ConflictResolver + 'static,
    {
        *self.inner.resolver.write() = Some(Arc::new(resolver));
    }

    pub fn clear_conflict_resolver(&self) {
        *self.inner.resolver.write() = None;
    }

    fn arbiter<'a>(&self, strategy: ConflictStrategy, resolver: Option<&'a dyn ConflictResolver>) -> Arbiter<'a> {
        Arbiter {
            strategy,
            resolver,
            window: self.inner.conflict_window,
        }
    }

    fn record_conflict(&self, record: ConflictRecord) {
        StateMetrics::conflict(record.strategy.as_str(), record.outcome.as_str());
        info!(
            path = %record.path,
            strategy = %record.strategy,
            outcome = record.outcome.as_str(),
            existing_source = %record.existing.source_id,
            incoming_source = %record.incoming.source_id,
            "Resolved write conflict"
        );

        let mut conflicts = self.inner.conflicts.lock();
        conflicts.push_back(record);
        while conflicts.len() > MAX_CONFLICT_RECORDS {
            conflicts.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Watch `path` (or `*` for every change).
    ///
    /// A malformed path is logged and yields an inert subscription.
    pub fn subscribe<F>(&self, path: &str, callback: F, options: StateSubscribeOptions) -> Subscription
    where
        F: Fn(&StateUpdate) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let watch = match Watch::parse(path) {
            Ok(watch) => watch,
            Err(e) => {
                e.log();
                return Subscription::new(id, || {});
            }
        };

        let mut options = options;
        if options.debounce.is_none() {
            options.debounce = self.inner.config.default_debounce;
        }
        let subscriber = Arc::new(StateSubscriber::new(id, watch, &options, Arc::new(callback)));

        if options.immediate {
            if let Some(update) = self.current_update(subscriber.watch()) {
                subscriber.notify_now(&update);
            }
        }

        self.inner.subscribers.write().insert(id, subscriber);
        debug!(subscription = %id, path, "State subscription added");

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(subscriber) = inner.subscribers.write().remove(&id) {
                    subscriber.deactivate();
                    debug!(subscription = %id, "State subscription removed");
                }
            }
        })
    }

    /// Synthetic update carrying the current value for an immediate delivery.
    fn current_update(&self, watch: &Watch) -> Option<StateUpdate> {
        let data = self.inner.data.lock();
        let (path, value) = match watch {
            Watch::All => (WILDCARD.to_string(), data.tree.clone()),
            Watch::Path(path) => (path.as_str().to_string(), path.get(&data.tree)?.clone()),
        };
        Some(StateUpdate {
            id: Uuid::new_v4(),
            op_type: OperationType::Set,
            path,
            value: Some(value),
            previous_value: None,
            metadata: None,
            timestamp: Utc::now(),
            version: data.version,
            source_id: self.inner.source_id.clone(),
            updated_by: None,
        })
    }

    fn notify(&self, update: &StateUpdate) {
        let subscribers: Vec<Arc<StateSubscriber>> = self
            .inner
            .subscribers
            .read()
            .values()
            .filter(|s| s.matches(update))
            .cloned()
            .collect();

        for subscriber in subscribers {
            subscriber.notify(update.clone());
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn persist(&self) {
        let Some(path) = &self.inner.snapshot_path else {
            return;
        };
        let _guard = self.inner.persist.lock();
        let snapshot = self.inner.data.lock().snapshot();
        if let Err(e) = snapshot.save(path) {
            e.log();
            PersistenceMetrics::failed("snapshot");
        }
    }
}

impl fmt::Debug for SharedStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.data.lock();
        f.debug_struct("SharedStateStore")
            .field("source_id", &self.inner.source_id)
            .field("version", &data.version)
            .field("operations", &data.log.len())
            .field("snapshot", &self.inner.snapshot_path)
            .finish()
    }
}

fn snapshot_path(config: &StateStoreConfig) -> Option<PathBuf> {
    if !config.persistence.enabled {
        return None;
    }
    if config.persistence.path.is_none() {
        warn!("State persistence enabled without a snapshot path; running in memory");
    }
    config.persistence.path.clone()
}

fn load_state(path: Option<&Path>, max_log: usize, strategy: ConflictStrategy) -> StateData {
    let Some(path) = path else {
        return StateData::new(max_log, strategy);
    };
    match StateSnapshot::load(path) {
        Ok(Some(snapshot)) => {
            info!(
                path = %path.display(),
                version = snapshot.version,
                operations = snapshot.operation_log.len(),
                "Loaded state snapshot"
            );
            StateData::from_snapshot(snapshot, max_log, strategy)
        }
        Ok(None) => StateData::new(max_log, strategy),
        Err(e) => {
            e.log();
            PersistenceMetrics::failed("snapshot");
            warn!(path = %path.display(), "Starting with empty state");
            StateData::new(max_log, strategy)
        }
    }
}
