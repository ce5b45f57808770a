//! In-process implementations of the platform traits.
//!
//! These back the CLI daemon and tests. A real device host replaces them
//! with bindings to its window manager, alarm service and package manager.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::traits::{AlarmId, AlarmScheduler, AppCatalog, BlockPrompt, BlockingSurface, SystemNavigator};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::model::{AppMetadata, IconRef};

/// Catalog backed by a fixed table.
///
/// With `allow_unlisted`, unknown packages resolve to their own id as the
/// display name, which suits hosts that cannot enumerate installed apps.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    apps: BTreeMap<String, AppMetadata>,
    allow_unlisted: bool,
}

impl StaticCatalog {
    pub fn new(allow_unlisted: bool) -> Self {
        Self {
            apps: BTreeMap::new(),
            allow_unlisted,
        }
    }

    pub fn insert(&mut self, package_id: impl Into<String>, metadata: AppMetadata) {
        self.apps.insert(package_id.into(), metadata);
    }
}

impl AppCatalog for StaticCatalog {
    fn resolve(&self, package_id: &str) -> Option<AppMetadata> {
        if let Some(metadata) = self.apps.get(package_id) {
            return Some(metadata.clone());
        }
        self.allow_unlisted.then(|| AppMetadata {
            display_name: package_id.to_string(),
            icon_ref: IconRef::default(),
        })
    }
}

/// Wake alarms implemented as tokio timers.
///
/// Fired ids are delivered on the receiver returned by [`TokioAlarms::new`];
/// the host forwards them to `EngineHandle::alarm_fired`. Alarms do not
/// outlive the process.
pub struct TokioAlarms {
    clock: Arc<dyn Clock>,
    fired: mpsc::UnboundedSender<AlarmId>,
    pending: Mutex<HashMap<AlarmId, JoinHandle<()>>>,
}

impl TokioAlarms {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<AlarmId>) {
        let (fired, rx) = mpsc::unbounded_channel();
        (
            Self {
                clock,
                fired,
                pending: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }
}

impl AlarmScheduler for TokioAlarms {
    fn schedule_exact_wake(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), CoreError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CoreError::collaborator("alarm facility", e.to_string()))?;
        let delay = (at - self.clock.now()).to_std().unwrap_or_default();
        let fired = self.fired.clone();
        let alarm = id.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(alarm);
        });

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| CoreError::collaborator("alarm facility", "alarm table poisoned"))?;
        pending.retain(|_, task| !task.is_finished());
        if let Some(previous) = pending.insert(id.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    fn cancel(&self, id: &AlarmId) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(task) = pending.remove(id) {
                task.abort();
            }
        }
    }
}

impl Drop for TokioAlarms {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            for (_, task) in pending.drain() {
                task.abort();
            }
        }
    }
}

/// Blocking surface that only logs. Tracks what it would be showing.
#[derive(Debug, Default)]
pub struct LogSurface {
    showing: Mutex<Option<String>>,
}

impl LogSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn showing(&self) -> Option<String> {
        self.showing.lock().ok().and_then(|s| s.clone())
    }
}

impl BlockingSurface for LogSurface {
    fn show(&self, prompt: BlockPrompt) -> Result<(), CoreError> {
        tracing::info!(
            package_id = %prompt.package_id,
            app = %prompt.display_name,
            "blocking surface shown"
        );
        let mut showing = self
            .showing
            .lock()
            .map_err(|_| CoreError::collaborator("blocking surface", "state poisoned"))?;
        *showing = Some(prompt.package_id);
        Ok(())
    }

    fn hide(&self) -> Result<(), CoreError> {
        let mut showing = self
            .showing
            .lock()
            .map_err(|_| CoreError::collaborator("blocking surface", "state poisoned"))?;
        if let Some(package_id) = showing.take() {
            tracing::info!(%package_id, "blocking surface hidden");
        }
        Ok(())
    }
}

/// Navigator that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl SystemNavigator for LogNavigator {
    fn navigate_back(&self) -> Result<(), CoreError> {
        tracing::info!("navigate back");
        Ok(())
    }

    fn navigate_home(&self) -> Result<(), CoreError> {
        tracing::info!("navigate home");
        Ok(())
    }

    fn open_dashboard(&self) -> Result<(), CoreError> {
        tracing::info!("open dashboard");
        Ok(())
    }
}
