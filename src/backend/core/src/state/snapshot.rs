//! Snapshot persistence for the shared state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::Path;

use super::operation::Operation;
use crate::error::{Result, SyncError};
use crate::telemetry::PersistenceMetrics;

/// Serialized form: `{state, version, operationLog, logBase, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state: Value,
    pub version: u64,
    #[serde(default)]
    pub operation_log: Vec<Operation>,
    /// Tree left by entries trimmed from the log
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub log_base: Value,
    pub timestamp: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn new(state: Value, version: u64, operation_log: Vec<Operation>) -> Self {
        Self {
            state,
            version,
            operation_log,
            log_base: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_log_base(mut self, base: Value) -> Self {
        self.log_base = base;
        self
    }

    /// Read a snapshot. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::persistence_read(path, e)),
        };
        let snapshot: Self = serde_json::from_slice(&bytes)?;
        Ok(Some(snapshot))
    }

    /// Write atomically: serialize to a sibling temp file, then rename over
    /// the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let timer = PersistenceMetrics::start_write("snapshot");
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| SyncError::persistence_write(dir, e))?;
        }

        let bytes = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = Path::new(&tmp);

        fs::write(tmp, bytes).map_err(|e| SyncError::persistence_write(tmp, e))?;
        fs::rename(tmp, path).map_err(|e| SyncError::persistence_write(path, e))?;
        timer.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let snapshot = StateSnapshot::new(
            json!({"a": 1}),
            2,
            vec![Operation::set("a", json!(1), 2, "node")],
        )
        .with_log_base(json!({"b": 0}));

        snapshot.save(&path).unwrap();
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());

        let loaded = StateSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded, snapshot);

        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("operationLog").is_some());
        assert_eq!(raw["logBase"], json!({"b": 0}));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(StateSnapshot::load(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ nope").unwrap();
        assert!(StateSnapshot::load(&path).is_err());
    }
}
