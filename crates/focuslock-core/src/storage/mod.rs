mod config;
pub mod database;
pub mod mirror;
pub mod restrictions;

pub use config::{CatalogConfig, CatalogEntry, Config, EnforcementConfig, EventsConfig, TimerConfig};
pub use database::SqliteKv;
pub use mirror::{DurableMirror, WriteFailure, FOCUS_END_KEY, RESTRICTIONS_KEY};
pub use restrictions::RestrictionStore;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{ConfigError, PersistenceError};

/// Durable key-value storage for opaque blobs.
pub trait KeyValueStore: Send + Sync {
    fn save(&self, key: &str, blob: &[u8]) -> Result<(), PersistenceError>;

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
}

/// Process-local store. Survives engine restarts within one process, which is
/// what restart-recovery tests and embedded hosts need.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKv {
    fn save(&self, key: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock().map_err(|_| PersistenceError::Backend {
            key: key.to_string(),
            message: "memory store poisoned".into(),
        })?;
        entries.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let entries = self.entries.lock().map_err(|_| PersistenceError::Backend {
            key: key.to_string(),
            message: "memory store poisoned".into(),
        })?;
        Ok(entries.get(key).cloned())
    }
}

/// Returns the data directory.
///
/// `FOCUSLOCK_HOME` wins when set. Otherwise `~/.config/focuslock[-dev]/`
/// based on FOCUSLOCK_ENV (set FOCUSLOCK_ENV=dev for the development
/// directory).
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os("FOCUSLOCK_HOME") {
        Some(home) => PathBuf::from(home),
        None => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");
            let env = std::env::var("FOCUSLOCK_ENV").unwrap_or_else(|_| "production".to_string());
            if env == "dev" {
                base_dir.join("focuslock-dev")
            } else {
                base_dir.join("focuslock")
            }
        }
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}
