pub mod config;
pub mod daemon;
pub mod focus;
pub mod restrict;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use focuslock_core::{
    AlarmId, AlarmScheduler, Config, CoreError, DurableMirror, RestrictionStore, SqliteKv,
    StaticCatalog,
};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Stored state opened for a one-shot command.
pub struct Offline {
    pub catalog: StaticCatalog,
    pub mirror: DurableMirror,
    pub store: RestrictionStore,
}

impl Offline {
    pub fn open(now: DateTime<Utc>) -> Result<Self, Box<dyn std::error::Error>> {
        let config = Config::load()?;
        let catalog = config.catalog.to_catalog();
        let mirror = DurableMirror::inline(Arc::new(SqliteKv::open()?));
        let store = RestrictionStore::load(mirror.clone(), &catalog, now);
        Ok(Self {
            catalog,
            mirror,
            store,
        })
    }
}

/// One-shot commands cannot hold OS alarms; the daemon re-arms them from
/// stored state when it starts.
pub struct DeferredAlarms;

impl AlarmScheduler for DeferredAlarms {
    fn schedule_exact_wake(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), CoreError> {
        tracing::debug!(alarm = %id, %at, "wake alarm deferred to daemon");
        Ok(())
    }

    fn cancel(&self, _id: &AlarmId) {}
}

pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
