//! The enforcement engine: one actor per process.
//!
//! Every input (observer commands, foreground changes, alarm callbacks, the
//! tick and poll timers, verification steps, results from the surface
//! worker and the durable writer) is a [`Command`] on a single inbox. The
//! actor handles each to completion before taking the next, so the
//! restriction store, the expiry scheduler and the enforcement controller
//! are only ever touched from one task.
//!
//! ```ignore
//! let engine = Engine::new(&config, collaborators)?;
//! let handle = engine.handle();
//! let task = engine.spawn();
//! handle.add_restriction("com.example.game", RestrictionTerm::minutes(30)).await?;
//! ```

mod actor;
mod handle;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

pub use handle::EngineHandle;

use crate::clock::Clock;
use crate::error::{ConfigError, CoreError};
use crate::events::TimerEvent;
use crate::facade::{EngineStatus, SyncSnapshot};
use crate::model::{FocusSession, RestrictionRecord, RestrictionTerm};
use crate::platform::{
    AlarmId, AlarmScheduler, AppCatalog, BlockingSurface, SurfaceAction, SystemNavigator,
};
use crate::storage::{Config, EnforcementConfig, KeyValueStore, WriteFailure};

/// Platform services the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub kv: Arc<dyn KeyValueStore>,
    pub alarms: Arc<dyn AlarmScheduler>,
    pub catalog: Arc<dyn AppCatalog>,
    pub surface: Arc<dyn BlockingSurface>,
    pub navigator: Arc<dyn SystemNavigator>,
    pub clock: Arc<dyn Clock>,
}

/// Engine timing, taken from [`Config`] at construction.
#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    pub enforcement: EnforcementConfig,
    pub tick_interval: Duration,
    pub poll_interval: Duration,
}

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// Everything the actor reacts to.
pub(crate) enum Command {
    AddRestriction {
        package_id: String,
        term: RestrictionTerm,
        reply: Reply<Result<RestrictionRecord, CoreError>>,
    },
    RemoveRestriction {
        package_id: String,
        reply: Reply<Option<RestrictionRecord>>,
    },
    StartFocus {
        duration: Duration,
        reply: Reply<Result<FocusSession, CoreError>>,
    },
    StopFocus {
        reply: Reply<()>,
    },
    ListRestrictions {
        reply: Reply<Vec<RestrictionRecord>>,
    },
    Status {
        reply: Reply<EngineStatus>,
    },
    /// Snapshot plus a receiver subscribed in the same step, so no event
    /// falls between the two.
    Attach {
        reply: Reply<(SyncSnapshot, broadcast::Receiver<TimerEvent>)>,
    },
    ForegroundChanged {
        package_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    AlarmFired(AlarmId),
    SurfaceDismissed,
    SurfaceAction(SurfaceAction),
    Verify {
        step: usize,
        generation: u64,
    },
    ShowFailed {
        package_id: String,
        error: CoreError,
    },
    WriteFailed(WriteFailure),
    Shutdown {
        reply: Reply<()>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::AddRestriction { .. } => "add_restriction",
            Command::RemoveRestriction { .. } => "remove_restriction",
            Command::StartFocus { .. } => "start_focus",
            Command::StopFocus { .. } => "stop_focus",
            Command::ListRestrictions { .. } => "list_restrictions",
            Command::Status { .. } => "status",
            Command::Attach { .. } => "attach",
            Command::ForegroundChanged { .. } => "foreground_changed",
            Command::AlarmFired(_) => "alarm_fired",
            Command::SurfaceDismissed => "surface_dismissed",
            Command::SurfaceAction(_) => "surface_action",
            Command::Verify { .. } => "verify",
            Command::ShowFailed { .. } => "show_failed",
            Command::WriteFailed(_) => "write_failed",
            Command::Shutdown { .. } => "shutdown",
        }
    }
}

/// A configured engine that has not started yet.
pub struct Engine {
    settings: EngineSettings,
    collaborators: Collaborators,
    inbox_tx: mpsc::UnboundedSender<Command>,
    inbox_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<TimerEvent>,
}

impl Engine {
    /// # Errors
    /// Returns the first [`ConfigError`] from [`Config::validate`]; zero
    /// periods cannot drive the tick and poll timers.
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.events.channel_capacity);
        Ok(Self {
            settings: EngineSettings {
                enforcement: config.enforcement.clone(),
                tick_interval: config.timers.tick_interval(),
                poll_interval: config.enforcement.poll_interval(),
            },
            collaborators,
            inbox_tx,
            inbox_rx,
            events,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(self.inbox_tx.clone())
    }

    /// Subscribe before [`Engine::spawn`] to also observe the restore events.
    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.events.subscribe()
    }

    /// Restore persisted state and start the actor. Must be called inside a
    /// tokio runtime.
    ///
    /// The task ends after [`EngineHandle::shutdown`] or once every handle
    /// has been dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        let Engine {
            settings,
            collaborators,
            inbox_tx,
            inbox_rx,
            events,
        } = self;
        let internal = inbox_tx.downgrade();
        drop(inbox_tx);
        tokio::spawn(actor::run(settings, collaborators, internal, inbox_rx, events))
    }
}
