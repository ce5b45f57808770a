//! State sync facade: what observers see.
//!
//! An observer attaches with [`EngineHandle::attach`]. It first receives a
//! [`SyncSnapshot`] of the restrictions, their remaining time and the focus
//! state, then the live [`TimerEvent`] stream. [`Attachment`] keeps a local
//! [`ObserverView`] current from the restriction deltas and ticks, turns
//! expiries into user-facing notices and re-attaches on its own when the
//! broadcast reports that it fell behind.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::engine::EngineHandle;
use crate::events::TimerEvent;
use crate::model::{FocusSession, RestrictionRecord};

/// One restriction as an observer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictionView {
    pub record: RestrictionRecord,
    /// `None` for permanent restrictions.
    pub remaining_ms: Option<u64>,
}

/// One-shot reconciliation delivered on attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub restrictions: Vec<RestrictionView>,
    pub focus: FocusSession,
    pub focus_remaining_ms: Option<u64>,
    pub taken_at: DateTime<Utc>,
}

impl SyncSnapshot {
    pub fn new(records: Vec<RestrictionRecord>, focus: FocusSession, now: DateTime<Utc>) -> Self {
        let restrictions = records
            .into_iter()
            .map(|record| RestrictionView {
                remaining_ms: record.remaining_ms(now),
                record,
            })
            .collect();
        Self {
            restrictions,
            focus_remaining_ms: focus.remaining_ms(now),
            focus,
            taken_at: now,
        }
    }
}

/// Short engine summary for status lines and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub focus_active: bool,
    pub focus_remaining_ms: Option<u64>,
    pub active_restrictions: usize,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.focus_active {
            parts.push("Focus Mode Active".to_string());
        }
        if self.active_restrictions > 0 {
            parts.push(format!("{} Active Restrictions", self.active_restrictions));
        }
        if parts.is_empty() {
            f.write_str("Enforcement running")
        } else {
            f.write_str(&parts.join(" | "))
        }
    }
}

/// What an attached observer receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum ObserverUpdate {
    Event { event: TimerEvent },
    Notice { message: String },
    /// The observer fell behind or saw an unknown restriction and was given
    /// a fresh snapshot.
    Resynced { snapshot: SyncSnapshot },
}

/// Observer-local copy of engine state, kept current from the event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverView {
    restrictions: BTreeMap<String, RestrictionView>,
    focus_remaining_ms: Option<u64>,
}

/// Outcome of applying one event to a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    Updated,
    /// User-facing text to show.
    Notice(String),
    /// The event names a restriction this view has never seen.
    Unknown,
}

impl ObserverView {
    pub fn from_snapshot(snapshot: &SyncSnapshot) -> Self {
        Self {
            restrictions: snapshot
                .restrictions
                .iter()
                .map(|view| (view.record.package_id().to_string(), view.clone()))
                .collect(),
            focus_remaining_ms: snapshot.focus_remaining_ms,
        }
    }

    pub fn restrictions(&self) -> impl Iterator<Item = &RestrictionView> {
        self.restrictions.values()
    }

    pub fn get(&self, package_id: &str) -> Option<&RestrictionView> {
        self.restrictions.get(package_id)
    }

    pub fn focus_remaining_ms(&self) -> Option<u64> {
        self.focus_remaining_ms
    }

    pub fn apply(&mut self, event: &TimerEvent) -> ViewChange {
        match event {
            TimerEvent::RestrictionTick {
                package_id,
                remaining_ms,
            } => match self.restrictions.get_mut(package_id) {
                Some(view) => {
                    view.remaining_ms = Some(*remaining_ms);
                    ViewChange::Updated
                }
                None => ViewChange::Unknown,
            },
            TimerEvent::RestrictionExpired { package_id } => {
                let name = self
                    .restrictions
                    .remove(package_id)
                    .map(|view| view.record.display_name().to_string())
                    .unwrap_or_else(|| package_id.clone());
                ViewChange::Notice(format!("{name} restriction has expired"))
            }
            TimerEvent::RestrictionAdded {
                record,
                remaining_ms,
            } => {
                self.restrictions.insert(
                    record.package_id().to_string(),
                    RestrictionView {
                        record: record.clone(),
                        remaining_ms: *remaining_ms,
                    },
                );
                ViewChange::Updated
            }
            TimerEvent::RestrictionRemoved { package_id } => {
                self.restrictions.remove(package_id);
                ViewChange::Updated
            }
            TimerEvent::FocusTick { remaining_ms } => {
                self.focus_remaining_ms = Some(*remaining_ms);
                ViewChange::Updated
            }
            TimerEvent::FocusExpired => {
                self.focus_remaining_ms = None;
                ViewChange::Updated
            }
            TimerEvent::StateRestored => ViewChange::Updated,
        }
    }
}

/// A live attachment to the engine.
pub struct Attachment {
    snapshot: SyncSnapshot,
    view: ObserverView,
    events: broadcast::Receiver<TimerEvent>,
    handle: EngineHandle,
    pending: VecDeque<ObserverUpdate>,
}

impl Attachment {
    pub(crate) fn new(
        snapshot: SyncSnapshot,
        events: broadcast::Receiver<TimerEvent>,
        handle: EngineHandle,
    ) -> Self {
        Self {
            view: ObserverView::from_snapshot(&snapshot),
            snapshot,
            events,
            handle,
            pending: VecDeque::new(),
        }
    }

    /// The most recent reconciliation snapshot.
    pub fn snapshot(&self) -> &SyncSnapshot {
        &self.snapshot
    }

    pub fn view(&self) -> &ObserverView {
        &self.view
    }

    /// Next update, or `None` once the engine has stopped.
    pub async fn next(&mut self) -> Option<ObserverUpdate> {
        if let Some(update) = self.pending.pop_front() {
            return Some(update);
        }
        match self.events.recv().await {
            Ok(event) => {
                match self.view.apply(&event) {
                    ViewChange::Updated => {}
                    ViewChange::Notice(message) => {
                        self.pending.push_back(ObserverUpdate::Notice { message });
                    }
                    ViewChange::Unknown => {
                        tracing::debug!(?event, "event for unknown restriction, resyncing");
                        if let Some(resynced) = self.resync().await {
                            self.pending.push_back(resynced);
                        }
                    }
                }
                Some(ObserverUpdate::Event { event })
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "observer fell behind, resyncing");
                self.resync().await
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Replace the view with a fresh snapshot.
    pub async fn refresh(&mut self) -> crate::error::Result<&SyncSnapshot> {
        let (snapshot, events) = self.handle.snapshot_and_subscribe().await?;
        self.install(snapshot, events);
        Ok(&self.snapshot)
    }

    async fn resync(&mut self) -> Option<ObserverUpdate> {
        match self.handle.snapshot_and_subscribe().await {
            Ok((snapshot, events)) => {
                self.install(snapshot, events);
                Some(ObserverUpdate::Resynced {
                    snapshot: self.snapshot.clone(),
                })
            }
            Err(e) => {
                tracing::debug!(error = %e, "engine gone during resync");
                None
            }
        }
    }

    fn install(&mut self, snapshot: SyncSnapshot, events: broadcast::Receiver<TimerEvent>) {
        self.view = ObserverView::from_snapshot(&snapshot);
        self.snapshot = snapshot;
        self.events = events;
        self.pending.clear();
    }
}
