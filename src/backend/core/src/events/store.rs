//! In-memory event store with optional disk persistence.
//!
//! Events are kept per type in `(timestamp, insertion order)` order, with a
//! correlation index and an optional per-type retention bound. Emission is
//! synchronous: the event is stored, persisted, and delivered to every
//! matching subscription before `emit` returns.

use chrono::{DateTime, Utc};
use parking_lot::{ReentrantMutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, trace, warn};

use super::event::{EmitOptions, Event, EventId};
use super::filter::EventFilter;
use super::payload::EventPayload;
use super::persistence::EventPersistence;
use super::subscription::{EventHandler, SubscribeOptions, Subscriber, Subscription, SubscriptionId};
use super::transport::Transport;
use crate::config::EventStoreConfig;
use crate::error::{panic_message, SyncError};
use crate::telemetry::{EventMetrics, PersistenceMetrics};

// =============================================================================
// Event Log
// =============================================================================

#[derive(Debug, Clone)]
struct StoredEvent {
    seq: u64,
    event: Event,
}

impl StoredEvent {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.event.timestamp, self.seq)
    }
}

#[derive(Debug, Default)]
struct EventLog {
    by_type: HashMap<String, VecDeque<StoredEvent>>,
    correlations: HashMap<String, HashSet<EventId>>,
    next_seq: u64,
    len: usize,
}

impl EventLog {
    /// Insert in order and apply the retention bound. Returns evicted events.
    fn insert(&mut self, event: Event, max_per_type: Option<usize>) -> Vec<Event> {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(correlation_id) = &event.correlation_id {
            self.correlations
                .entry(correlation_id.clone())
                .or_default()
                .insert(event.id);
        }

        let list = self.by_type.entry(event.event_type.clone()).or_default();
        let stored = StoredEvent { seq, event };
        let key = stored.key();
        let pos = list.partition_point(|e| e.key() <= key);
        list.insert(pos, stored);

        let mut evicted = Vec::new();
        if let Some(max) = max_per_type {
            while list.len() > max {
                match list.pop_front() {
                    Some(old) => evicted.push(old.event),
                    None => break,
                }
            }
        }

        self.len += 1;
        self.len -= evicted.len();
        for old in &evicted {
            self.unindex(old);
        }
        evicted
    }

    fn unindex(&mut self, event: &Event) {
        if let Some(correlation_id) = &event.correlation_id {
            if let Some(ids) = self.correlations.get_mut(correlation_id) {
                ids.remove(&event.id);
                if ids.is_empty() {
                    self.correlations.remove(correlation_id);
                }
            }
        }
    }

    fn history(&self, event_type: &str) -> Vec<Event> {
        self.by_type
            .get(event_type)
            .map(|list| list.iter().map(|s| s.event.clone()).collect())
            .unwrap_or_default()
    }

    /// All events merged across types in order, filtered.
    fn collect(&self, mut keep: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let mut selected: Vec<&StoredEvent> = self
            .by_type
            .values()
            .flatten()
            .filter(|s| keep(&s.event))
            .collect();
        selected.sort_by_key(|s| s.key());
        selected.into_iter().map(|s| s.event.clone()).collect()
    }

    fn find(&self, filter: &EventFilter) -> Vec<Event> {
        match filter.event_type.as_ref().and_then(|m| m.exact_type()) {
            Some(event_type) => self
                .by_type
                .get(event_type)
                .map(|list| {
                    list.iter()
                        .filter(|s| filter.matches(&s.event))
                        .map(|s| s.event.clone())
                        .collect()
                })
                .unwrap_or_default(),
            None => self.collect(|e| filter.matches(e)),
        }
    }
}

// =============================================================================
// Event Store
// =============================================================================

struct Inner {
    max_events_per_type: Option<usize>,
    persistence: Option<EventPersistence>,
    log: RwLock<EventLog>,
    subscribers: RwLock<BTreeMap<SubscriptionId, Arc<Subscriber>>>,
    next_subscription: AtomicU64,
    /// Serializes store-then-deliver; re-entrant so handlers may emit.
    dispatch: ReentrantMutex<()>,
}

impl Inner {
    fn remove_subscriber(&self, id: SubscriptionId) {
        if let Some(subscriber) = self.subscribers.write().remove(&id) {
            subscriber.deactivate();
            debug!(subscription = %id, "Unsubscribed");
        }
    }
}

/// Append-only, filterable event store with publish/subscribe fan-out.
///
/// Cloning is cheap and every clone shares the same store.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Inner>,
}

impl EventStore {
    /// Create a store, loading persisted events if persistence is enabled.
    ///
    /// Persistence problems never fail construction: an unusable directory
    /// disables persistence, and a failed load leaves the store empty.
    pub fn new(config: EventStoreConfig) -> Self {
        let persistence = open_persistence(&config);
        let store = Self {
            inner: Arc::new(Inner {
                max_events_per_type: config.max_events_per_type,
                persistence,
                log: RwLock::new(EventLog::default()),
                subscribers: RwLock::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(1),
                dispatch: ReentrantMutex::new(()),
            }),
        };

        if let Some(persistence) = &store.inner.persistence {
            store.restore(persistence);
        }
        store
    }

    /// A store with no persistence and no retention bound.
    pub fn in_memory() -> Self {
        Self::new(EventStoreConfig::in_memory())
    }

    fn restore(&self, persistence: &EventPersistence) {
        let mut events = match persistence.load() {
            Ok(events) => events,
            Err(e) => {
                e.log();
                PersistenceMetrics::failed("events");
                warn!("Starting with an empty event store");
                return;
            }
        };
        events.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));

        let count = events.len();
        let mut evicted = Vec::new();
        {
            let mut log = self.inner.log.write();
            for event in events {
                evicted.extend(log.insert(event, self.inner.max_events_per_type));
            }
        }
        self.remove_files(&evicted);

        info!(
            root = %persistence.root().display(),
            loaded = count,
            evicted = evicted.len(),
            "Restored persisted events"
        );
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    /// Store, persist and deliver a new event. Any type string is valid.
    pub fn emit(
        &self,
        event_type: impl Into<String>,
        payload: impl Into<EventPayload>,
        options: EmitOptions,
    ) -> Event {
        let event_type = event_type.into();
        let payload = payload.into();

        let _dispatch = self.inner.dispatch.lock();
        // Stamped under the guard so store order and delivery order agree.
        let event = Event::new(event_type, payload, options);
        let evicted = self
            .inner
            .log
            .write()
            .insert(event.clone(), self.inner.max_events_per_type);

        if let Some(persistence) = &self.inner.persistence {
            if let Err(e) = persistence.write(&event) {
                e.log();
                PersistenceMetrics::failed("events");
            }
        }

        if !evicted.is_empty() {
            self.remove_files(&evicted);
            EventMetrics::evicted(&event.event_type, evicted.len() as u64);
            debug!(
                event_type = %event.event_type,
                evicted = evicted.len(),
                "Trimmed event history"
            );
        }

        EventMetrics::emitted(&event.event_type);
        trace!(event_id = %event.id, "Event stored");

        self.dispatch(&event);
        event
    }

    fn remove_files(&self, events: &[Event]) {
        if let Some(persistence) = &self.inner.persistence {
            for event in events {
                if let Err(e) = persistence.remove(&event.event_type, &event.id) {
                    e.log();
                    PersistenceMetrics::failed("events");
                }
            }
        }
    }

    /// Deliver to every active matching subscription in registration order.
    fn dispatch(&self, event: &Event) -> usize {
        let subscribers: Vec<Arc<Subscriber>> = self
            .inner
            .subscribers
            .read()
            .values()
            .filter(|s| s.filter.matches(event))
            .cloned()
            .collect();

        let mut delivered = 0;
        for subscriber in subscribers {
            // May have been removed by an earlier handler in this round.
            if !subscriber.is_active() {
                continue;
            }
            deliver(&subscriber, event);
            delivered += 1;
        }

        EventMetrics::delivered(delivered as u64);
        delivered
    }

    // -------------------------------------------------------------------------
    // Subscription
    // -------------------------------------------------------------------------

    /// Register a handler.
    ///
    /// Unless `only_future` is set, every stored event matching the filter is
    /// delivered (in order) before this returns.
    pub fn subscribe<F>(&self, options: SubscribeOptions, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_handler(options, Arc::new(handler))
    }

    /// Future events of exactly one type.
    pub fn on<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(
            SubscribeOptions::new(EventFilter::for_type(event_type)).only_future(),
            handler,
        )
    }

    fn subscribe_handler(&self, options: SubscribeOptions, handler: EventHandler) -> Subscription {
        let _dispatch = self.inner.dispatch.lock();

        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber::new(id, options.filter, handler));
        self.inner.subscribers.write().insert(id, subscriber.clone());

        if !options.only_future {
            let backlog = self.inner.log.read().find(&subscriber.filter);
            debug!(subscription = %id, backlog = backlog.len(), "Replaying stored events to new subscriber");
            for event in &backlog {
                deliver(&subscriber, event);
            }
        } else {
            debug!(subscription = %id, "Subscribed");
        }

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove_subscriber(id);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Retained events of one type, oldest first.
    pub fn get_event_history(&self, event_type: &str) -> Vec<Event> {
        self.inner.log.read().history(event_type)
    }

    /// Every retained event, merged across types in order.
    pub fn get_all_events(&self) -> Vec<Event> {
        self.inner.log.read().collect(|_| true)
    }

    pub fn find_events(&self, filter: &EventFilter) -> Vec<Event> {
        self.inner.log.read().find(filter)
    }

    /// Every retained event indexed under `correlation_id`, across all types.
    pub fn get_correlated_events(&self, correlation_id: &str) -> Vec<Event> {
        let log = self.inner.log.read();
        match log.correlations.get(correlation_id) {
            Some(ids) => log.collect(|e| ids.contains(&e.id)),
            None => Vec::new(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.inner.log.read().len
    }

    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .log
            .read()
            .by_type
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        types.sort();
        types
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.persistence.is_some()
    }

    // -------------------------------------------------------------------------
    // Replay
    // -------------------------------------------------------------------------

    /// Hand stored events matching `filter` to `handler`, in order.
    ///
    /// Live subscribers are not involved. Returns the number replayed.
    pub fn replay_events_to<F>(&self, filter: &EventFilter, mut handler: F) -> usize
    where
        F: FnMut(&Event),
    {
        let events = self.find_events(filter);
        for event in &events {
            handler(event);
        }
        debug!(count = events.len(), "Replayed events to handler");
        events.len()
    }

    /// Re-deliver stored events matching `filter` to live subscribers.
    ///
    /// Events are not stored or persisted again. Subscribers see them a
    /// second time, so their handling must be idempotent. Returns the number
    /// of events redispatched.
    pub fn redispatch_events(&self, filter: &EventFilter) -> usize {
        let _dispatch = self.inner.dispatch.lock();
        let events = self.find_events(filter);
        for event in &events {
            self.dispatch(event);
        }
        info!(count = events.len(), "Redispatched stored events");
        events.len()
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Drop every stored event, in memory and on disk. Subscriptions remain.
    #[instrument(skip(self))]
    pub fn clear_event_history(&self) {
        let _dispatch = self.inner.dispatch.lock();
        let removed = {
            let mut log = self.inner.log.write();
            let removed = log.len;
            *log = EventLog::default();
            removed
        };

        if let Some(persistence) = &self.inner.persistence {
            if let Err(e) = persistence.clear() {
                e.log();
                PersistenceMetrics::failed("events");
            }
        }
        info!(removed, "Cleared event history");
    }
}

impl Transport for EventStore {
    fn publish(&self, event_type: &str, payload: EventPayload, options: EmitOptions) -> Event {
        self.emit(event_type, payload, options)
    }

    fn listen(&self, event_type: &str, handler: EventHandler) -> Subscription {
        self.subscribe_handler(
            SubscribeOptions::new(EventFilter::for_type(event_type)).only_future(),
            handler,
        )
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("events", &self.event_count())
            .field("subscribers", &self.subscriber_count())
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

fn open_persistence(config: &EventStoreConfig) -> Option<EventPersistence> {
    if !config.persistence.enabled {
        return None;
    }

    let Some(directory) = &config.persistence.directory else {
        warn!("Event persistence enabled without a directory; persistence disabled");
        return None;
    };

    match EventPersistence::open(directory) {
        Ok(persistence) => Some(persistence),
        Err(e) => {
            e.log();
            PersistenceMetrics::failed("events");
            warn!(directory = %directory.display(), "Event persistence disabled");
            None
        }
    }
}

/// Invoke one handler, isolating panics.
fn deliver(subscriber: &Subscriber, event: &Event) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event)));
    if let Err(panic) = result {
        SyncError::handler_failed(subscriber.id, panic_message(&*panic))
            .with_context("event_type", &event.event_type)
            .with_context("event_id", event.id.to_string())
            .log();
        EventMetrics::handler_failed(&event.event_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn collector() -> (Arc<Mutex<Vec<Event>>>, impl Fn(&Event) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |e: &Event| sink.lock().push(e.clone()))
    }

    #[test]
    fn test_emit_and_history() {
        let store = EventStore::in_memory();
        let a = store.emit("task", json!(1), EmitOptions::new());
        let b = store.emit("task", json!(2), EmitOptions::new());
        store.emit("other", json!(3), EmitOptions::new());

        let history = store.get_event_history("task");
        assert_eq!(history.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert!(store.get_event_history("missing").is_empty());
        assert_eq!(store.event_count(), 3);
        assert_eq!(store.event_types(), vec!["other".to_string(), "task".to_string()]);
    }

    #[test]
    fn test_all_events_are_ordered() {
        let store = EventStore::in_memory();
        let ids: Vec<EventId> = (0..10)
            .map(|i| store.emit(if i % 2 == 0 { "even" } else { "odd" }, json!(i), EmitOptions::new()).id)
            .collect();
        let all: Vec<EventId> = store.get_all_events().iter().map(|e| e.id).collect();
        assert_eq!(all, ids);
    }

    #[test]
    fn test_subscribe_replays_then_streams() {
        let store = EventStore::in_memory();
        store.emit("a", json!(1), EmitOptions::new());
        store.emit("b", json!(2), EmitOptions::new());

        let (seen, handler) = collector();
        let _sub = store.subscribe(SubscribeOptions::new(EventFilter::for_type("*")), handler);
        assert_eq!(seen.lock().len(), 2);

        store.emit("c", json!(3), EmitOptions::new());
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn test_only_future_skips_backlog() {
        let store = EventStore::in_memory();
        store.emit("a", json!(1), EmitOptions::new());

        let (seen, handler) = collector();
        let _sub = store.subscribe(
            SubscribeOptions::new(EventFilter::for_type("a")).only_future(),
            handler,
        );
        assert!(seen.lock().is_empty());

        store.emit("a", json!(2), EmitOptions::new());
        store.emit("b", json!(3), EmitOptions::new());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_wildcard_and_typed_delivered_once() {
        let store = EventStore::in_memory();
        let (seen, handler) = collector();
        let _sub = store.on("*", handler);
        store.emit("a", json!(1), EmitOptions::new());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = EventStore::in_memory();
        let (seen, handler) = collector();
        let sub = store.on("a", handler);

        store.emit("a", json!(1), EmitOptions::new());
        sub.unsubscribe();
        sub.unsubscribe();
        store.emit("a", json!(2), EmitOptions::new());

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let store = EventStore::in_memory();
        let _bad = store.on("a", |_| panic!("boom"));
        let (seen, handler) = collector();
        let _good = store.on("a", handler);

        let event = store.emit("a", json!(1), EmitOptions::new());
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(store.get_event_history("a"), vec![event]);
    }

    #[test]
    fn test_handler_can_emit() {
        let store = EventStore::in_memory();
        let inner = store.clone();
        let _sub = store.on("ping", move |_| {
            inner.emit("pong", json!(null), EmitOptions::new());
        });

        store.emit("ping", json!(null), EmitOptions::new());
        assert_eq!(store.get_event_history("pong").len(), 1);
    }

    #[test]
    fn test_handler_can_unsubscribe_other() {
        let store = EventStore::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));

        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = victim.clone();
        let _first = store.on("a", move |_| {
            if let Some(sub) = slot.lock().as_ref() {
                sub.unsubscribe();
            }
        });
        let counter = calls.clone();
        *victim.lock() = Some(store.on("a", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.emit("a", json!(null), EmitOptions::new());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retention_evicts_oldest_and_unindexes() {
        let store = EventStore::new(EventStoreConfig::in_memory().with_max_events_per_type(2));
        store.emit("a", json!(1), EmitOptions::new().with_correlation_id("c"));
        store.emit("a", json!(2), EmitOptions::new());
        store.emit("a", json!(3), EmitOptions::new());

        let values: Vec<_> = store
            .get_event_history("a")
            .into_iter()
            .map(|e| e.payload)
            .collect();
        assert_eq!(values, vec![EventPayload::from(json!(2)), EventPayload::from(json!(3))]);
        assert!(store.get_correlated_events("c").is_empty());
        assert_eq!(store.event_count(), 2);
    }

    #[test]
    fn test_find_events_by_pattern() {
        let store = EventStore::in_memory();
        store.emit("task:created", json!(1), EmitOptions::new());
        store.emit("task:done", json!(2), EmitOptions::new());
        store.emit("agent:spawned", json!(3), EmitOptions::new());

        assert_eq!(store.find_events(&EventFilter::matching("^task:")).len(), 2);
        assert_eq!(store.find_events(&EventFilter::for_type("agent:spawned")).len(), 1);
        assert!(store.find_events(&EventFilter::matching("(")).is_empty());
    }

    #[test]
    fn test_replay_to_handler_does_not_touch_subscribers() {
        let store = EventStore::in_memory();
        store.emit("a", json!(1), EmitOptions::new());
        let (seen, handler) = collector();
        let _sub = store.on("a", handler);

        let mut replayed = Vec::new();
        let count = store.replay_events_to(&EventFilter::all(), |e| replayed.push(e.id));
        assert_eq!(count, 1);
        assert_eq!(replayed.len(), 1);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_redispatch_reaches_live_subscribers_without_storing() {
        let store = EventStore::in_memory();
        store.emit("a", json!(1), EmitOptions::new());
        let (seen, handler) = collector();
        let _sub = store.on("a", handler);

        assert_eq!(store.redispatch_events(&EventFilter::for_type("a")), 1);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(store.event_count(), 1);
    }

    #[test]
    fn test_clear_keeps_subscriptions() {
        let store = EventStore::in_memory();
        store.emit("a", json!(1), EmitOptions::new().with_correlation_id("c"));
        let (seen, handler) = collector();
        let _sub = store.on("a", handler);

        store.clear_event_history();
        assert_eq!(store.event_count(), 0);
        assert!(store.get_correlated_events("c").is_empty());

        store.emit("a", json!(2), EmitOptions::new());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_persistence_without_directory_is_disabled() {
        let mut config = EventStoreConfig::in_memory();
        config.persistence.enabled = true;
        let store = EventStore::new(config);
        assert!(!store.is_persistent());
        store.emit("a", json!(1), EmitOptions::new());
        assert_eq!(store.event_count(), 1);
    }
}
