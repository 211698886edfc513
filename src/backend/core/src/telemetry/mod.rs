//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: JSON/pretty/compact `tracing` output with per-module levels
//! - **Metrics**: `metrics` counters for events, state operations and persistence
//!
//! # Example
//!
//! ```rust,no_run
//! use apex_sync::telemetry::{init_telemetry, LoggingConfig};
//!
//! init_telemetry(&LoggingConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{
    describe_metrics, EventMetrics, PersistenceMetrics, StateMetrics, WriteTimer,
};

/// Install the logging subscriber and register metric descriptions.
///
/// Call once at startup; the stores work without it.
///
/// # Errors
///
/// Returns an error if the subscriber cannot be initialized.
pub fn init_telemetry(logging: &LoggingConfig) -> anyhow::Result<()> {
    describe_metrics();
    init_logging(logging)?;
    ::tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );
    Ok(())
}
