//! Core error types for focuslock-core.
//!
//! Nothing in the enforcement core is fatal: every variant here is logged by
//! the engine and the most recent in-memory state stays authoritative.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Platform capability a collaborator may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Drawing the blocking surface above other apps.
    Overlay,
    /// Scheduling exact wake alarms.
    ExactAlarm,
    /// Observing which application is in front.
    ForegroundObservation,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Overlay => "overlay",
            Capability::ExactAlarm => "exact alarm",
            Capability::ForegroundObservation => "foreground observation",
        };
        f.write_str(name)
    }
}

/// Core error type for focuslock-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A platform capability was denied; callers degrade and continue.
    #[error("Permission denied: {capability} capability is not granted")]
    PermissionDenied { capability: Capability },

    /// Durable storage failed; in-memory state remains authoritative.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Unknown package or record. Most call sites treat this as success.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The engine task has stopped and no longer accepts commands.
    #[error("Engine is not running")]
    EngineClosed,

    /// A collaborator failed for a reason other than a missing permission.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn permission_denied(capability: Capability) -> Self {
        CoreError::PermissionDenied { capability }
    }

    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        CoreError::Collaborator {
            collaborator,
            message: message.into(),
        }
    }
}

/// Durable key-value storage errors.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Failed to open the backing database
    #[error("Failed to open store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Read or write against the backend failed
    #[error("Storage backend failed for key '{key}': {message}")]
    Backend { key: String, message: String },

    /// Stored blob could not be encoded or decoded
    #[error("Stored value for '{key}' is malformed: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Database is locked
    #[error("Database is locked")]
    Locked,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown dot-path key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// No usable data directory
    #[error("Cannot determine data directory: {0}")]
    DataDir(String),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Restriction ends before it starts
    #[error("Invalid time range: end_time ({end}) must be after start_time ({start})")]
    InvalidTimeRange {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    /// `is_permanent` disagrees with the presence of an end time
    #[error("Restriction for '{package_id}' has is_permanent={is_permanent}, which disagrees with its end_time")]
    PermanenceMismatch {
        package_id: String,
        is_permanent: bool,
    },

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _msg)
                if code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                PersistenceError::Locked
            }
            _ => PersistenceError::Backend {
                key: String::new(),
                message: err.to_string(),
            },
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
