use serde::{Deserialize, Serialize};

use crate::model::RestrictionRecord;

/// Every timer state change produces a TimerEvent.
/// The engine broadcasts them; observers subscribe to the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TimerEvent {
    RestrictionTick {
        package_id: String,
        remaining_ms: u64,
    },
    RestrictionExpired {
        package_id: String,
    },
    FocusTick {
        remaining_ms: u64,
    },
    FocusExpired,
    /// A restriction was added or overwritten through the engine.
    RestrictionAdded {
        record: RestrictionRecord,
        remaining_ms: Option<u64>,
    },
    /// A restriction was removed on request (not by expiry).
    RestrictionRemoved {
        package_id: String,
    },
    /// Emitted once per engine start, after persisted timers were re-armed.
    StateRestored,
}

impl TimerEvent {
    /// Package the event refers to, if it is a per-restriction event.
    pub fn package_id(&self) -> Option<&str> {
        match self {
            TimerEvent::RestrictionTick { package_id, .. }
            | TimerEvent::RestrictionExpired { package_id }
            | TimerEvent::RestrictionRemoved { package_id } => Some(package_id),
            TimerEvent::RestrictionAdded { record, .. } => Some(record.package_id()),
            _ => None,
        }
    }
}
