//! Counters and histograms for the event and state stores.
//!
//! Everything is recorded through the `metrics` facade. Without an
//! installed recorder the calls are no-ops, so the stores never need to
//! know whether a host exports them.
//!
//! ```rust,no_run
//! use apex_sync::telemetry::metrics::{EventMetrics, StateMetrics};
//!
//! EventMetrics::emitted("task:completed");
//! StateMetrics::operation("set", "local");
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::sync::Once;
use std::time::{Duration, Instant};

static DESCRIBE: Once = Once::new();

/// Register metric descriptions with the installed recorder.
///
/// Safe to call more than once; only the first call registers.
pub fn describe_metrics() {
    DESCRIBE.call_once(register_metric_descriptions);
}

fn register_metric_descriptions() {
    // Event store
    describe_counter!("apex_sync_events_emitted_total", "Events emitted by type");
    describe_counter!(
        "apex_sync_events_delivered_total",
        "Handler invocations for emitted or redispatched events"
    );
    describe_counter!(
        "apex_sync_handler_failures_total",
        "Handlers that panicked during delivery"
    );
    describe_counter!(
        "apex_sync_events_evicted_total",
        "Events dropped by the per-type retention bound"
    );

    // Shared state
    describe_counter!(
        "apex_sync_state_operations_total",
        "Operations applied to the shared state by type and origin"
    );
    describe_counter!(
        "apex_sync_state_conflicts_total",
        "Conflicts detected by strategy and outcome"
    );
    describe_counter!(
        "apex_sync_state_notifications_total",
        "Subscriber callbacks delivered"
    );

    // Persistence
    describe_counter!(
        "apex_sync_persistence_failures_total",
        "Failed reads or writes by component"
    );
    describe_histogram!(
        "apex_sync_persistence_write_seconds",
        "Time spent writing events or snapshots"
    );

    // Errors
    describe_counter!("apex_sync_errors_total", "Errors by code");
}

/// Event store metrics.
pub struct EventMetrics;

impl EventMetrics {
    pub fn emitted(event_type: &str) {
        counter!(
            "apex_sync_events_emitted_total",
            "type" => event_type.to_string(),
        )
        .increment(1);
    }

    pub fn delivered(count: u64) {
        counter!("apex_sync_events_delivered_total").increment(count);
    }

    pub fn handler_failed(event_type: &str) {
        counter!(
            "apex_sync_handler_failures_total",
            "type" => event_type.to_string(),
        )
        .increment(1);
    }

    pub fn evicted(event_type: &str, count: u64) {
        counter!(
            "apex_sync_events_evicted_total",
            "type" => event_type.to_string(),
        )
        .increment(count);
    }
}

/// Shared state metrics.
pub struct StateMetrics;

impl StateMetrics {
    /// `origin` is `local` or `remote`.
    pub fn operation(op_type: &str, origin: &'static str) {
        counter!(
            "apex_sync_state_operations_total",
            "type" => op_type.to_string(),
            "origin" => origin,
        )
        .increment(1);
    }

    pub fn conflict(strategy: &str, outcome: &'static str) {
        counter!(
            "apex_sync_state_conflicts_total",
            "strategy" => strategy.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
    }

    pub fn notified(count: u64) {
        counter!("apex_sync_state_notifications_total").increment(count);
    }
}

/// Persistence metrics.
pub struct PersistenceMetrics;

impl PersistenceMetrics {
    /// `component` is `events` or `snapshot`.
    pub fn failed(component: &'static str) {
        counter!(
            "apex_sync_persistence_failures_total",
            "component" => component,
        )
        .increment(1);
    }

    /// Start timing a write; the duration is recorded on `finish`.
    pub fn start_write(component: &'static str) -> WriteTimer {
        WriteTimer {
            component,
            start: Instant::now(),
        }
    }
}

/// Timer for a single persistence write.
#[must_use = "the timer records nothing unless finished"]
pub struct WriteTimer {
    component: &'static str,
    start: Instant,
}

impl WriteTimer {
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        histogram!(
            "apex_sync_persistence_write_seconds",
            "component" => self.component,
        )
        .record(elapsed.as_secs_f64());
        elapsed
    }
}
