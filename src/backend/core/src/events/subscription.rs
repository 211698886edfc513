//! Subscription handles.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::event::Event;
use super::filter::EventFilter;

/// Callback invoked for each delivered event.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Options for [`EventStore::subscribe`](super::EventStore::subscribe).
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub filter: EventFilter,
    /// Skip delivery of already-stored matching events
    pub only_future: bool,
}

impl SubscribeOptions {
    pub fn new(filter: EventFilter) -> Self {
        Self {
            filter,
            only_future: false,
        }
    }

    pub fn only_future(mut self) -> Self {
        self.only_future = true;
        self
    }
}

/// Identifier of a registration, unique within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Cancel = Box<dyn FnOnce() + Send>;

/// Handle returned by every subscribe call.
///
/// `unsubscribe` removes the registration and is idempotent. Dropping the
/// handle leaves the registration in place.
pub struct Subscription {
    id: SubscriptionId,
    cancel: Mutex<Option<Cancel>>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.cancel.lock().is_some()
    }

    pub fn unsubscribe(&self) {
        // Take first so the callback runs without the handle locked.
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A live registration inside a store.
pub(crate) struct Subscriber {
    pub(crate) id: SubscriptionId,
    pub(crate) filter: EventFilter,
    pub(crate) handler: EventHandler,
    active: AtomicBool,
}

impl Subscriber {
    pub(crate) fn new(id: SubscriptionId, filter: EventFilter, handler: EventHandler) -> Self {
        Self {
            id,
            filter,
            handler,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription::new(SubscriptionId(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_does_not_unsubscribe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription::new(SubscriptionId(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId(42).to_string(), "sub-42");
    }
}
