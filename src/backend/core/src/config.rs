//! Configuration management.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::state::ConflictStrategy;
use crate::telemetry::LoggingConfig;

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Event store configuration
    #[serde(default)]
    pub event_store: EventStoreConfig,

    /// Shared state configuration
    #[serde(default)]
    pub state: StateStoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventStoreConfig {
    /// On-disk persistence of emitted events
    #[serde(default)]
    pub persistence: EventPersistenceConfig,

    /// Retain at most this many events per type (oldest evicted first)
    #[serde(default)]
    pub max_events_per_type: Option<usize>,
}

impl EventStoreConfig {
    /// In-memory store with no retention bound.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Persist every event under `directory`.
    pub fn persistent(directory: impl Into<PathBuf>) -> Self {
        Self {
            persistence: EventPersistenceConfig {
                enabled: true,
                directory: Some(directory.into()),
            },
            max_events_per_type: None,
        }
    }

    pub fn with_max_events_per_type(mut self, max: usize) -> Self {
        self.max_events_per_type = Some(max);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPersistenceConfig {
    /// Write events to disk and reload them on construction
    #[serde(default)]
    pub enabled: bool,

    /// Root directory; one subdirectory per event type
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateStoreConfig {
    /// Identity of this store instance; random when unset
    #[serde(default)]
    pub source_id: Option<String>,

    /// Snapshot persistence
    #[serde(default)]
    pub persistence: StatePersistenceConfig,

    /// Maximum retained operation log entries
    #[serde(default = "default_max_operation_log")]
    pub max_operation_log: usize,

    /// Debounce applied to subscriptions that do not set their own
    #[serde(default, with = "humantime_serde")]
    pub default_debounce: Option<Duration>,

    /// Strategy used when a write does not name one
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// How recent another source's write must be for a local write to conflict with it
    #[serde(default = "default_conflict_window", with = "humantime_serde")]
    pub conflict_window: Duration,

    /// Ask peers for their operation logs on construction
    #[serde(default = "default_sync_on_start")]
    pub sync_on_start: bool,

    /// Broadcast writes to peers unless the write opts out
    #[serde(default = "default_broadcast")]
    pub broadcast_by_default: bool,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            source_id: None,
            persistence: StatePersistenceConfig::default(),
            max_operation_log: default_max_operation_log(),
            default_debounce: None,
            conflict_strategy: ConflictStrategy::default(),
            conflict_window: default_conflict_window(),
            sync_on_start: default_sync_on_start(),
            broadcast_by_default: default_broadcast(),
        }
    }
}

impl StateStoreConfig {
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_max_operation_log(mut self, max: usize) -> Self {
        self.max_operation_log = max;
        self
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence = StatePersistenceConfig {
            enabled: true,
            path: Some(path.into()),
        };
        self
    }

    pub fn with_sync_on_start(mut self, enabled: bool) -> Self {
        self.sync_on_start = enabled;
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatePersistenceConfig {
    /// Write a snapshot after every mutation and load it on construction
    #[serde(default)]
    pub enabled: bool,

    /// Snapshot file
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// Default value functions
fn default_max_operation_log() -> usize { 1000 }
fn default_conflict_window() -> Duration { Duration::from_secs(5) }
fn default_sync_on_start() -> bool { true }
fn default_broadcast() -> bool { true }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("APEX_SYNC").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("APEX_SYNC").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
