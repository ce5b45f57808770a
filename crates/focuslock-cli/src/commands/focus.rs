use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Subcommand;
use focuslock_core::{ExpiryScheduler, TimerEvent};

use super::{print_json, CliResult, DeferredAlarms, Offline};

#[derive(Subcommand)]
pub enum FocusAction {
    /// Start a focus session
    Start {
        /// Length in minutes
        minutes: u32,
    },
    /// Stop the running focus session
    Stop,
    /// Print focus state as JSON
    Status,
}

pub fn run(action: FocusAction) -> CliResult {
    let now = Utc::now();
    let mut offline = Offline::open(now)?;
    let mut scheduler = ExpiryScheduler::new(Arc::new(DeferredAlarms), offline.mirror.clone());
    let mut events: Vec<TimerEvent> = scheduler.restore(&offline.store, now);

    match action {
        FocusAction::Start { minutes } => {
            if minutes == 0 {
                return Err("focus length must be at least one minute".into());
            }
            let end_time = now + Duration::minutes(i64::from(minutes));
            events.extend(scheduler.start_focus(end_time, now));
        }
        FocusAction::Stop => {
            events.extend(scheduler.stop_focus());
        }
        FocusAction::Status => {
            events.extend(scheduler.tick(&mut offline.store, now));
        }
    }

    events.retain(|e| matches!(e, TimerEvent::FocusTick { .. } | TimerEvent::FocusExpired));
    let focus = scheduler.focus();
    print_json(&serde_json::json!({
        "active": focus.is_active(),
        "end_time": focus.end_time(),
        "remaining_ms": focus.remaining_ms(now),
        "events": events,
    }))
}
