//! Error handling for Apex Sync.
//!
//! This module provides:
//! - A single error type with machine-readable codes and context
//! - Severity classification that drives how errors are logged
//! - Metrics integration for error tracking
//!
//! Public store operations degrade gracefully instead of returning these
//! errors: the fallible internals (persistence, path parsing, config
//! loading) produce a [`SyncError`] which is logged at the boundary.
//!
//! # Usage
//!
//! ```rust,ignore
//! use apex_sync::error::{ErrorCode, ErrorContext, Result};
//!
//! fn read_snapshot(path: &std::path::Path) -> Result<String> {
//!     std::fs::read_to_string(path).with_error_code(ErrorCode::PersistenceReadFailed)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Apex Sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input Errors (1000-1099)
    InvalidPath,
    InvalidFilter,

    // Dispatch Errors (1100-1199)
    HandlerFailed,
    ResolverFailed,

    // Persistence Errors (2000-2099)
    PersistenceReadFailed,
    PersistenceWriteFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::InvalidPath => 1000,
            Self::InvalidFilter => 1001,

            Self::HandlerFailed => 1100,
            Self::ResolverFailed => 1101,

            Self::PersistenceReadFailed => 2000,
            Self::PersistenceWriteFailed => 2001,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Coarse grouping used for metrics labels.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::InvalidPath | Self::InvalidFilter => "input",
            Self::HandlerFailed | Self::ResolverFailed => "dispatch",
            Self::PersistenceReadFailed | Self::PersistenceWriteFailed => "persistence",
            Self::SerializationError | Self::DeserializationError => "serialization",
            Self::ConfigurationError | Self::MissingConfiguration | Self::InvalidConfiguration => {
                "configuration"
            }
            Self::InternalError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad path, bad filter)
    Low,
    /// A subscriber or plugin misbehaved; the store carried on
    Medium,
    /// Durability or data-format problems
    High,
    /// Bugs
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidPath | ErrorCode::InvalidFilter => Self::Low,

            ErrorCode::HandlerFailed | ErrorCode::ResolverFailed => Self::Medium,

            ErrorCode::PersistenceReadFailed
            | ErrorCode::PersistenceWriteFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity (path, event type, file)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Kind of the related entity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Apex Sync.
#[derive(Error, Debug)]
pub struct SyncError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short description
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl SyncError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both a short and an internal message.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// A state path that cannot be addressed.
    pub fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        let path = path.into();
        Self::new(ErrorCode::InvalidPath, format!("Invalid state path '{}': {}", path, reason))
            .with_details(ErrorDetails::new().with_entity("path", path))
    }

    /// An event type pattern that does not compile.
    pub fn invalid_filter(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        let pattern = pattern.into();
        Self::with_internal(
            ErrorCode::InvalidFilter,
            format!("Invalid event type pattern '{}'", pattern),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("pattern", pattern))
    }

    /// A subscriber callback panicked.
    pub fn handler_failed(subscription: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::HandlerFailed, "Subscriber callback failed", reason)
            .with_details(ErrorDetails::new().with_entity("subscription", subscription.to_string()))
    }

    /// A custom conflict resolver panicked.
    pub fn resolver_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ResolverFailed,
            "Custom conflict resolver failed; falling back to last-write-wins",
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("path", path))
    }

    /// Reading persisted events or a snapshot failed.
    pub fn persistence_read(path: &std::path::Path, error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::PersistenceReadFailed, "Failed to read persisted data", error.to_string())
            .with_details(ErrorDetails::new().with_entity("path", path.display().to_string()))
            .with_source(error)
    }

    /// Writing persisted events or a snapshot failed.
    pub fn persistence_write(path: &std::path::Path, error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::PersistenceWriteFailed, "Failed to write persisted data", error.to_string())
            .with_details(ErrorDetails::new().with_entity("path", path.display().to_string()))
            .with_source(error)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "apex_sync_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| SyncError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| SyncError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| SyncError::internal(message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| SyncError::new(code, "Value not present"))
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::PersistenceReadFailed, "File or directory not found"),
            ErrorKind::PermissionDenied => (ErrorCode::PersistenceWriteFailed, "Permission denied"),
            _ => (ErrorCode::PersistenceWriteFailed, "An I/O error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<regex::Error> for SyncError {
    fn from(error: regex::Error) -> Self {
        Self::with_internal(ErrorCode::InvalidFilter, "Invalid regular expression", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(error: config::ConfigError) -> Self {
        let (code, msg) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::MissingConfiguration, "Required configuration not found")
            }
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration file is invalid")
            }
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ErrorCode::InvalidPath.numeric_code(), 1000);
        assert_eq!(ErrorCode::PersistenceWriteFailed.numeric_code(), 2001);
        assert_eq!(ErrorCode::InternalError.numeric_code(), 9000);
    }

    #[test]
    fn test_invalid_path_details() {
        let error = SyncError::invalid_path("a..b", "empty segment");
        assert_eq!(error.code(), ErrorCode::InvalidPath);
        assert_eq!(error.details().entity_id.as_deref(), Some("a..b"));
        assert_eq!(error.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_error_context() {
        let error = SyncError::new(ErrorCode::PersistenceWriteFailed, "write failed")
            .with_context("file", "state.json")
            .with_context("attempt", 1);

        assert!(error.details().context.contains_key("file"));
        assert!(error.details().context.contains_key("attempt"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error: SyncError = io.into();
        assert_eq!(error.code(), ErrorCode::PersistenceReadFailed);
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_from_serde_error() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: SyncError = parse.into();
        assert_eq!(error.code(), ErrorCode::DeserializationError);
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.with_error_code(ErrorCode::InvalidPath).unwrap_err();
        assert_eq!(error.code(), ErrorCode::InvalidPath);
    }

    #[test]
    fn test_error_display() {
        let error = SyncError::with_internal(
            ErrorCode::PersistenceWriteFailed,
            "Could not persist event",
            "disk full",
        );

        let display = format!("{}", error);
        assert!(display.contains("PersistenceWriteFailed"));
        assert!(display.contains("Could not persist event"));
        assert!(display.contains("disk full"));
    }
}
