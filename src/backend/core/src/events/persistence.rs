//! On-disk event persistence.
//!
//! Layout: `<root>/<type dir>/<event id>.json`, one file per event. The
//! type directory name is the event type with every character outside
//! `[A-Za-z0-9._-]` replaced by `_`; the real type is always taken from
//! the file content.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::event::{Event, EventId};
use crate::error::{ErrorCode, ErrorContext, Result, SyncError};
use crate::telemetry::PersistenceMetrics;

const EVENT_FILE_EXTENSION: &str = "json";

/// Directory-backed event persistence.
#[derive(Debug, Clone)]
pub struct EventPersistence {
    root: PathBuf,
}

impl EventPersistence {
    /// Open (and create if missing) the persistence root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| SyncError::persistence_write(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file an event is stored in.
    pub fn event_path(&self, event_type: &str, id: &EventId) -> PathBuf {
        self.root
            .join(type_dir_name(event_type))
            .join(format!("{}.{}", id, EVENT_FILE_EXTENSION))
    }

    /// Write one event, replacing any previous file for the same id.
    pub fn write(&self, event: &Event) -> Result<()> {
        let timer = PersistenceMetrics::start_write("events");
        let path = self.event_path(&event.event_type, &event.id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| SyncError::persistence_write(dir, e))?;
        }

        let bytes = serde_json::to_vec_pretty(event)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|e| SyncError::persistence_write(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| SyncError::persistence_write(&path, e))?;
        timer.finish();
        Ok(())
    }

    /// Delete one event's file. A missing file is not an error.
    pub fn remove(&self, event_type: &str, id: &EventId) -> Result<()> {
        let path = self.event_path(event_type, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::persistence_write(&path, e)),
        }
    }

    /// Load every persisted event, unordered.
    ///
    /// Files that cannot be read or parsed are skipped with a warning. Only
    /// a failure to list the root itself is returned as an error.
    pub fn load(&self) -> Result<Vec<Event>> {
        let entries = fs::read_dir(&self.root).map_err(|e| SyncError::persistence_read(&self.root, e))?;
        let mut events = Vec::new();

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }

            let files = match fs::read_dir(&dir) {
                Ok(files) => files,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Skipping unreadable event directory");
                    PersistenceMetrics::failed("events");
                    continue;
                }
            };

            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(EVENT_FILE_EXTENSION) {
                    continue;
                }
                match read_event(&path) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable event file");
                        PersistenceMetrics::failed("events");
                    }
                }
            }
        }

        debug!(root = %self.root.display(), count = events.len(), "Loaded persisted events");
        Ok(events)
    }

    /// Remove every persisted event, leaving an empty root.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::persistence_write(&self.root, e)),
        }
        fs::create_dir_all(&self.root).map_err(|e| SyncError::persistence_write(&self.root, e))
    }
}

fn read_event(path: &Path) -> Result<Event> {
    let bytes = fs::read(path).map_err(|e| SyncError::persistence_read(path, e))?;
    serde_json::from_slice(&bytes).with_error_code(ErrorCode::DeserializationError)
}

/// Directory name used for an event type.
pub fn type_dir_name(event_type: &str) -> String {
    let sanitized: String = event_type
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();

    // "", "." and ".." must not resolve to the root or its parent.
    if sanitized.chars().all(|c| c == '.') {
        "_".repeat(sanitized.len().max(1))
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EmitOptions;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_type_dir_name() {
        assert_eq!(type_dir_name("task-completed"), "task-completed");
        assert_eq!(type_dir_name("state:change"), "state_change");
        assert_eq!(type_dir_name("a/b\\c"), "a_b_c");
        assert_eq!(type_dir_name(""), "_");
        assert_eq!(type_dir_name("."), "_");
        assert_eq!(type_dir_name(".."), "__");
    }

    #[test]
    fn test_write_load_remove() {
        let dir = TempDir::new().unwrap();
        let persistence = EventPersistence::open(dir.path().join("events")).unwrap();

        let event = Event::new("state:change", json!({"x": 1}), EmitOptions::new());
        persistence.write(&event).unwrap();
        assert!(persistence.event_path("state:change", &event.id).exists());

        let loaded = persistence.load().unwrap();
        assert_eq!(loaded, vec![event.clone()]);

        persistence.remove("state:change", &event.id).unwrap();
        persistence.remove("state:change", &event.id).unwrap();
        assert!(persistence.load().unwrap().is_empty());
    }

    #[test]
    fn test_load_skips_bad_files() {
        let dir = TempDir::new().unwrap();
        let persistence = EventPersistence::open(dir.path()).unwrap();

        let good = Event::new("a", json!(1), EmitOptions::new());
        persistence.write(&good).unwrap();

        fs::write(dir.path().join("a").join("broken.json"), b"{not json").unwrap();
        fs::write(dir.path().join("a").join("notes.txt"), b"ignored").unwrap();
        fs::write(dir.path().join("stray.json"), b"{}").unwrap();

        let loaded = persistence.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, good.id);

        let error = read_event(&dir.path().join("a").join("broken.json")).unwrap_err();
        assert_eq!(error.code(), ErrorCode::DeserializationError);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let persistence = EventPersistence::open(dir.path().join("events")).unwrap();
        persistence.write(&Event::new("a", json!(1), EmitOptions::new())).unwrap();

        persistence.clear().unwrap();
        assert!(persistence.root().exists());
        assert!(persistence.load().unwrap().is_empty());
    }

    #[test]
    fn test_load_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        let persistence = EventPersistence::open(dir.path().join("events")).unwrap();
        fs::remove_dir_all(persistence.root()).unwrap();
        assert!(persistence.load().is_err());
    }
}
