//! Wall-clock sources.
//!
//! Expiry decisions compare wall-clock timestamps, so every component reads
//! time through a [`Clock`] instead of calling `Utc::now()` directly.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time that advances with tokio's clock.
///
/// Anchored to the system time at construction. Under a paused tokio runtime
/// it moves only when tokio time moves, which keeps timestamps and timers in
/// lockstep.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(anchor_wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.anchor);
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor_wall
            .checked_add_signed(elapsed)
            .unwrap_or(self.anchor_wall)
    }
}

/// Milliseconds from `now` until `end`, clamped at zero.
pub fn remaining_ms(now: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - now).num_milliseconds().max(0) as u64
}
