//! Boundaries to the operating system.
//!
//! Every platform service the engine talks to implements one of these traits.
//! Implementations must be cheap to call from the engine loop, except
//! [`BlockingSurface`], whose calls the engine always runs on the blocking
//! pool.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{CoreError, ValidationError};
use crate::model::AppMetadata;

/// Identifies one OS wake alarm: the focus countdown or one restriction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AlarmId {
    Focus,
    Restriction(String),
}

const RESTRICTION_PREFIX: &str = "restriction:";

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmId::Focus => f.write_str("focus"),
            AlarmId::Restriction(package_id) => write!(f, "{RESTRICTION_PREFIX}{package_id}"),
        }
    }
}

impl FromStr for AlarmId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "focus" {
            return Ok(AlarmId::Focus);
        }
        match s.strip_prefix(RESTRICTION_PREFIX) {
            Some(package_id) if !package_id.is_empty() => {
                Ok(AlarmId::Restriction(package_id.to_string()))
            }
            _ => Err(ValidationError::InvalidValue {
                field: "alarm_id".into(),
                message: format!("'{s}' is neither 'focus' nor 'restriction:<package>'"),
            }),
        }
    }
}

/// OS facility for exact wake-up alarms.
///
/// When an alarm fires, the host delivers its [`AlarmId`] to
/// `EngineHandle::alarm_fired`.
pub trait AlarmScheduler: Send + Sync {
    /// Schedule (or reschedule) `id` to fire at `at`.
    fn schedule_exact_wake(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), CoreError>;

    /// Cancel `id`. Cancelling an unknown alarm is a no-op.
    fn cancel(&self, id: &AlarmId);
}

/// Resolves package ids to installed-app metadata.
pub trait AppCatalog: Send + Sync {
    fn resolve(&self, package_id: &str) -> Option<AppMetadata>;
}

/// Buttons offered on the blocking surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceAction {
    GoHome,
    OpenDashboard,
}

/// Callbacks the blocking surface invokes when the user presses a button.
#[derive(Clone)]
pub struct SurfaceActions {
    sink: Arc<dyn Fn(SurfaceAction) + Send + Sync>,
}

impl SurfaceActions {
    pub fn new(sink: impl Fn(SurfaceAction) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn go_home(&self) {
        (self.sink)(SurfaceAction::GoHome);
    }

    pub fn open_dashboard(&self) {
        (self.sink)(SurfaceAction::OpenDashboard);
    }
}

impl fmt::Debug for SurfaceActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceActions").finish_non_exhaustive()
    }
}

/// Everything the blocking surface needs to render.
#[derive(Debug, Clone)]
pub struct BlockPrompt {
    pub package_id: String,
    pub display_name: String,
    pub actions: SurfaceActions,
}

/// Full-screen intervention drawn over a restricted app.
///
/// Calls may block; the engine never invokes them on its own loop.
pub trait BlockingSurface: Send + Sync {
    /// Present (or replace) the surface for `prompt.package_id`.
    fn show(&self, prompt: BlockPrompt) -> Result<(), CoreError>;

    /// Remove the surface. Must succeed when nothing is shown.
    fn hide(&self) -> Result<(), CoreError>;
}

/// Global navigation commands.
pub trait SystemNavigator: Send + Sync {
    fn navigate_back(&self) -> Result<(), CoreError>;

    fn navigate_home(&self) -> Result<(), CoreError>;

    fn open_dashboard(&self) -> Result<(), CoreError> {
        Ok(()) // default no-op
    }
}
