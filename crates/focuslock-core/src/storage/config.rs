//! TOML-based application configuration.
//!
//! Stores tuning parameters for the enforcement engine:
//! - Foreground debounce, escalation ladder and ambient poll period
//! - Tick period of the expiry timers
//! - Broadcast capacity for observers
//! - Static app catalog entries
//!
//! Configuration is stored at `~/.config/focuslock/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::data_dir;
use crate::error::ConfigError;
use crate::model::{AppMetadata, IconRef};
use crate::platform::StaticCatalog;

/// Foreground enforcement tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Package id of this application; its foreground events are ignored.
    #[serde(default = "default_own_package")]
    pub own_package: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Delays after a block decision at which the surface is re-verified.
    /// The last step also sends the user home.
    #[serde(default = "default_escalation_delays_ms")]
    pub escalation_delays_ms: Vec<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Expiry timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// Observer fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// One entry of the static app catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub display_name: String,
    #[serde(default)]
    pub icon: String,
}

/// Static app catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_true")]
    pub allow_unlisted: bool,
    #[serde(default)]
    pub apps: BTreeMap<String, CatalogEntry>,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/focuslock/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

// Default functions
fn default_own_package() -> String {
    "dev.focuslock".into()
}
fn default_debounce_ms() -> u64 {
    1000
}
fn default_escalation_delays_ms() -> Vec<u64> {
    vec![300, 800, 1500]
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_channel_capacity() -> usize {
    256
}
fn default_true() -> bool {
    true
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            own_package: default_own_package(),
            debounce_ms: default_debounce_ms(),
            escalation_delays_ms: default_escalation_delays_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl EnforcementConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn escalation_delays(&self) -> Vec<Duration> {
        self.escalation_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl TimerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            allow_unlisted: true,
            apps: BTreeMap::new(),
        }
    }
}

impl CatalogConfig {
    pub fn to_catalog(&self) -> StaticCatalog {
        let mut catalog = StaticCatalog::new(self.allow_unlisted);
        for (package_id, entry) in &self.apps {
            catalog.insert(
                package_id.clone(),
                AppMetadata {
                    display_name: entry.display_name.clone(),
                    icon_ref: IconRef::new(entry.icon.clone()),
                },
            );
        }
        catalog
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enforcement: EnforcementConfig::default(),
            timers: TimerConfig::default(),
            events: EventsConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().map_or(true, |p| p.is_empty()) {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value
                            .parse::<bool>()
                            .map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        let n = value
                            .parse::<u64>()
                            .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?;
                        serde_json::Value::Number(n.into())
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from disk, writing defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation, or if the default config cannot be written.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let cfg: Config = toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save()?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path,
                message: e.to_string(),
            }),
        }
    }

    /// Persist to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path()?;
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.clone(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(&path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        };
        if self.timers.tick_interval_ms == 0 {
            return invalid("timers.tick_interval_ms", "must be greater than zero");
        }
        if self.enforcement.poll_interval_ms == 0 {
            return invalid("enforcement.poll_interval_ms", "must be greater than zero");
        }
        let ladder = &self.enforcement.escalation_delays_ms;
        if ladder.is_empty() {
            return invalid("enforcement.escalation_delays_ms", "needs at least one step");
        }
        if ladder.windows(2).any(|w| w[0] >= w[1]) {
            return invalid("enforcement.escalation_delays_ms", "must be strictly increasing");
        }
        if self.events.channel_capacity == 0 {
            return invalid("events.channel_capacity", "must be greater than zero");
        }
        Ok(())
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by key without saving. Returns error if key is
    /// unknown or the result fails validation.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config = serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Set a config value by key and save.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown, the value cannot be parsed,
    /// or the config cannot be saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.apply(key, value)?;
        self.save()
    }

    /// Load from disk, returning default on error.
    /// This is a convenience method that never fails.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "using default configuration");
            Self::default()
        })
    }
}
