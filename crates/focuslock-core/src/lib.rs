//! # Focuslock Core Library
//!
//! The enforcement core behind Focuslock: it blocks designated apps for a
//! bounded or unbounded period and runs a single focus countdown. Hosts
//! (the CLI daemon, a device shell) embed an [`Engine`] and feed it platform
//! events; observers attach through an [`EngineHandle`].
//!
//! ## Architecture
//!
//! - **Restriction Store**: expiry-aware map of restrictions mirrored to a
//!   key-value store
//! - **Expiry Scheduler**: caller-driven tick state machine for the focus
//!   countdown and per-restriction timers, backed by exact wake alarms
//! - **Enforcement Controller**: foreground-change decisions, debounce and the
//!   escalating verification sequence
//! - **State Sync Facade**: snapshot on attach, then the broadcast event stream
//!
//! All four are owned by one actor task; see [`engine`].
//!
//! ## Key Components
//!
//! - [`Engine`] / [`EngineHandle`]: the actor and its access point
//! - [`RestrictionStore`]: restriction persistence and lazy expiry
//! - [`ExpiryScheduler`]: timer domains and [`TimerEvent`]s
//! - [`EnforcementController`]: block/allow decisions
//! - [`Config`]: TOML configuration

pub mod clock;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod events;
pub mod facade;
pub mod model;
pub mod platform;
pub mod storage;
pub mod timer;

pub use clock::{Clock, SystemClock, TokioClock};
pub use enforcement::{Directive, EnforcementController, EnforcementState};
pub use engine::{Collaborators, Engine, EngineHandle};
pub use error::{
    Capability, ConfigError, CoreError, PersistenceError, Result, ValidationError,
};
pub use events::TimerEvent;
pub use facade::{
    Attachment, EngineStatus, ObserverUpdate, ObserverView, RestrictionView, SyncSnapshot,
    ViewChange,
};
pub use model::{AppMetadata, FocusSession, IconRef, RestrictionRecord, RestrictionTerm};
pub use platform::{
    AlarmId, AlarmScheduler, AppCatalog, BlockPrompt, BlockingSurface, LogNavigator, LogSurface,
    StaticCatalog, SurfaceAction, SurfaceActions, SystemNavigator, TokioAlarms,
};
pub use storage::{Config, DurableMirror, KeyValueStore, MemoryKv, RestrictionStore, SqliteKv};
pub use timer::{DomainState, ExpiryScheduler};
