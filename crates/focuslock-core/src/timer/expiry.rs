//! Expiry scheduler.
//!
//! Owns two timer domains: the single focus countdown and one countdown per
//! timed restriction. Like the rest of the core it has no threads of its own;
//! the engine calls [`ExpiryScheduler::tick`] once per tick period and
//! forwards OS alarm callbacks to [`ExpiryScheduler::alarm_fired`]. Every
//! method returns the [`TimerEvent`]s it produced.
//!
//! ## Domain states
//!
//! ```text
//! Idle -> Armed -> (FiredPendingTick) -> Idle
//! ```
//!
//! `FiredPendingTick` is entered when the OS alarm arrives before the end
//! time has strictly passed; the next tick finishes the domain.
//!
//! The OS alarm is a second, coarser path to the same expiry check. Whichever
//! of tick or alarm gets there first removes the record and emits the single
//! expiry event; the other finds nothing to do.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::remaining_ms;
use crate::events::TimerEvent;
use crate::model::{FocusSession, RestrictionRecord};
use crate::platform::{AlarmId, AlarmScheduler};
use crate::storage::{DurableMirror, RestrictionStore, FOCUS_END_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DomainState {
    Idle,
    Armed { end_time: DateTime<Utc> },
    FiredPendingTick { end_time: DateTime<Utc> },
}

impl DomainState {
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        match self {
            DomainState::Idle => None,
            DomainState::Armed { end_time } | DomainState::FiredPendingTick { end_time } => {
                Some(*end_time)
            }
        }
    }
}

pub struct ExpiryScheduler {
    alarms: Arc<dyn AlarmScheduler>,
    mirror: DurableMirror,
    focus: DomainState,
    restrictions: BTreeMap<String, DomainState>,
}

impl ExpiryScheduler {
    pub fn new(alarms: Arc<dyn AlarmScheduler>, mirror: DurableMirror) -> Self {
        Self {
            alarms,
            mirror,
            focus: DomainState::Idle,
            restrictions: BTreeMap::new(),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn focus(&self) -> FocusSession {
        match self.focus.end_time() {
            Some(end) => FocusSession::ending_at(end),
            None => FocusSession::idle(),
        }
    }

    pub fn state(&self, domain: &AlarmId) -> DomainState {
        match domain {
            AlarmId::Focus => self.focus,
            AlarmId::Restriction(package_id) => self
                .restrictions
                .get(package_id)
                .copied()
                .unwrap_or(DomainState::Idle),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Re-arm timers after a process start.
    ///
    /// A persisted focus end time in the future is re-armed; one in the past
    /// produces a single `FocusExpired`. Restriction timers are derived from
    /// the store. Always ends with `StateRestored`.
    pub fn restore(&mut self, store: &RestrictionStore, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let mut events = Vec::new();

        match self.mirror.load_json::<Option<DateTime<Utc>>>(FOCUS_END_KEY) {
            Ok(Some(Some(end_time))) if now < end_time => {
                tracing::info!(%end_time, "re-arming persisted focus session");
                self.focus = DomainState::Armed { end_time };
                self.schedule_alarm(&AlarmId::Focus, end_time);
            }
            Ok(Some(Some(end_time))) => {
                tracing::info!(%end_time, "persisted focus session ended while stopped");
                self.finish_focus();
                events.push(TimerEvent::FocusExpired);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted focus end time");
            }
        }

        self.sync_domains(store);
        events.push(TimerEvent::StateRestored);
        events
    }

    /// Arm the focus countdown to end at `end_time`.
    pub fn start_focus(&mut self, end_time: DateTime<Utc>, now: DateTime<Utc>) -> Vec<TimerEvent> {
        self.focus = DomainState::Armed { end_time };
        self.persist_focus(Some(end_time));
        self.schedule_alarm(&AlarmId::Focus, end_time);
        tracing::info!(%end_time, "focus session started");
        vec![TimerEvent::FocusTick {
            remaining_ms: remaining_ms(now, end_time),
        }]
    }

    /// Stop the focus countdown. Emits `FocusExpired` if one was running.
    pub fn stop_focus(&mut self) -> Vec<TimerEvent> {
        if self.focus == DomainState::Idle {
            return Vec::new();
        }
        tracing::info!("focus session stopped");
        self.finish_focus();
        vec![TimerEvent::FocusExpired]
    }

    /// Track a freshly added restriction. Permanent records have no timer.
    pub fn arm_restriction(&mut self, record: &RestrictionRecord, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let package_id = record.package_id().to_string();
        let Some(end_time) = record.end_time() else {
            self.cancel(&AlarmId::Restriction(package_id));
            return Vec::new();
        };
        self.restrictions
            .insert(package_id.clone(), DomainState::Armed { end_time });
        self.schedule_alarm(&AlarmId::Restriction(package_id.clone()), end_time);
        vec![TimerEvent::RestrictionTick {
            package_id,
            remaining_ms: remaining_ms(now, end_time),
        }]
    }

    /// Move `domain` to idle and cancel its alarm. Safe on idle domains.
    pub fn cancel(&mut self, domain: &AlarmId) {
        match domain {
            AlarmId::Focus => self.finish_focus(),
            AlarmId::Restriction(package_id) => {
                self.restrictions.remove(package_id);
                self.alarms.cancel(domain);
            }
        }
    }

    /// One pass of the tick loop.
    pub fn tick(&mut self, store: &mut RestrictionStore, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let mut events = Vec::new();

        if let Some(end_time) = self.focus.end_time() {
            if now >= end_time {
                tracing::info!("focus session finished");
                self.finish_focus();
                events.push(TimerEvent::FocusExpired);
            } else {
                events.push(TimerEvent::FocusTick {
                    remaining_ms: remaining_ms(now, end_time),
                });
            }
        }

        events.extend(self.collect_lapsed(store));
        self.sync_domains(store);

        let tracked: Vec<String> = self.restrictions.keys().cloned().collect();
        for package_id in tracked {
            if store.expire_if_due(&package_id, now).is_some() {
                events.push(self.finish_restriction(package_id));
                continue;
            }
            if let Some(end_time) = self.restrictions.get(&package_id).and_then(DomainState::end_time) {
                events.push(TimerEvent::RestrictionTick {
                    package_id,
                    remaining_ms: remaining_ms(now, end_time),
                });
            }
        }
        events
    }

    /// Handle an OS wake alarm. Performs the same expiry check as a tick
    /// for that one domain and nothing else.
    pub fn alarm_fired(
        &mut self,
        id: &AlarmId,
        store: &mut RestrictionStore,
        now: DateTime<Utc>,
    ) -> Vec<TimerEvent> {
        match id {
            AlarmId::Focus => {
                let Some(end_time) = self.focus.end_time() else {
                    tracing::debug!("ignoring focus alarm for idle session");
                    return Vec::new();
                };
                if now >= end_time {
                    tracing::info!("focus session finished by alarm");
                    self.finish_focus();
                    vec![TimerEvent::FocusExpired]
                } else {
                    self.focus = DomainState::FiredPendingTick { end_time };
                    Vec::new()
                }
            }
            AlarmId::Restriction(package_id) => {
                let Some(state) = self.restrictions.get(package_id).copied() else {
                    tracing::debug!(%package_id, "ignoring alarm for untracked restriction");
                    return Vec::new();
                };
                if store.expire_if_due(package_id, now).is_some() {
                    tracing::info!(%package_id, "restriction expired by alarm");
                    return vec![self.finish_restriction(package_id.clone())];
                }
                match (store.get(package_id), state.end_time()) {
                    (Some(_), Some(end_time)) => {
                        self.restrictions
                            .insert(package_id.clone(), DomainState::FiredPendingTick { end_time });
                    }
                    _ => {
                        tracing::debug!(%package_id, "alarm raced a removal");
                        self.cancel(id);
                    }
                }
                Vec::new()
            }
        }
    }

    /// `RestrictionExpired` for records the store dropped by lazy expiry.
    pub fn collect_lapsed(&mut self, store: &mut RestrictionStore) -> Vec<TimerEvent> {
        let tracked: Vec<String> = store
            .take_lapsed()
            .into_iter()
            .filter(|package_id| self.restrictions.contains_key(package_id))
            .collect();
        tracked
            .into_iter()
            .map(|package_id| self.finish_restriction(package_id))
            .collect()
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Bring restriction domains in line with the store: arm timed records
    /// that lack a timer, follow overwritten end times, drop domains whose
    /// record is gone or became permanent. Never touches the store.
    fn sync_domains(&mut self, store: &RestrictionStore) {
        let stale: Vec<String> = self
            .restrictions
            .keys()
            .filter(|id| store.get(id).and_then(|r| r.end_time()).is_none())
            .cloned()
            .collect();
        for package_id in stale {
            tracing::debug!(%package_id, "dropping timer for removed restriction");
            self.cancel(&AlarmId::Restriction(package_id));
        }

        let mut to_schedule = Vec::new();
        for record in store.records() {
            let Some(end_time) = record.end_time() else {
                continue;
            };
            let current = self.restrictions.get(record.package_id()).and_then(|s| s.end_time());
            if current != Some(end_time) {
                self.restrictions
                    .insert(record.package_id().to_string(), DomainState::Armed { end_time });
                to_schedule.push((AlarmId::Restriction(record.package_id().to_string()), end_time));
            }
        }
        for (id, end_time) in to_schedule {
            self.schedule_alarm(&id, end_time);
        }
    }

    fn finish_focus(&mut self) {
        self.focus = DomainState::Idle;
        self.persist_focus(None);
        self.alarms.cancel(&AlarmId::Focus);
    }

    fn finish_restriction(&mut self, package_id: String) -> TimerEvent {
        tracing::info!(%package_id, "restriction expired");
        self.restrictions.remove(&package_id);
        self.alarms.cancel(&AlarmId::Restriction(package_id.clone()));
        TimerEvent::RestrictionExpired { package_id }
    }

    fn schedule_alarm(&self, id: &AlarmId, end_time: DateTime<Utc>) {
        if let Err(e) = self.alarms.schedule_exact_wake(id, end_time) {
            tracing::warn!(alarm = %id, error = %e, "wake alarm rejected, relying on tick loop");
        }
    }

    fn persist_focus(&self, end_time: Option<DateTime<Utc>>) {
        if let Err(e) = self.mirror.save_json(FOCUS_END_KEY, &end_time) {
            tracing::warn!(error = %e, "failed to persist focus end time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Capability, CoreError};
    use crate::model::{AppMetadata, IconRef};
    use crate::storage::{KeyValueStore, MemoryKv};
    use chrono::Duration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAlarms {
        deny: bool,
        scheduled: Mutex<Vec<(AlarmId, DateTime<Utc>)>>,
        cancelled: Mutex<Vec<AlarmId>>,
    }

    impl AlarmScheduler for RecordingAlarms {
        fn schedule_exact_wake(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), CoreError> {
            if self.deny {
                return Err(CoreError::permission_denied(Capability::ExactAlarm));
            }
            self.scheduled.lock().unwrap().push((id.clone(), at));
            Ok(())
        }

        fn cancel(&self, id: &AlarmId) {
            self.cancelled.lock().unwrap().push(id.clone());
        }
    }

    struct Fixture {
        kv: Arc<MemoryKv>,
        alarms: Arc<RecordingAlarms>,
        store: RestrictionStore,
        scheduler: ExpiryScheduler,
        start: DateTime<Utc>,
    }

    fn fixture_with(alarms: RecordingAlarms) -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        let alarms = Arc::new(alarms);
        let mirror = DurableMirror::inline(kv.clone());
        Fixture {
            store: RestrictionStore::new(mirror.clone()),
            scheduler: ExpiryScheduler::new(alarms.clone(), mirror),
            kv,
            alarms,
            start: Utc::now(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingAlarms::default())
    }

    fn timed(package_id: &str, start: DateTime<Utc>, secs: i64) -> RestrictionRecord {
        let meta = AppMetadata {
            display_name: package_id.to_string(),
            icon_ref: IconRef::default(),
        };
        RestrictionRecord::timed(package_id, meta, start, start + Duration::seconds(secs)).unwrap()
    }

    impl Fixture {
        fn at(&self, ms: i64) -> DateTime<Utc> {
            self.start + Duration::milliseconds(ms)
        }

        fn add_timed(&mut self, package_id: &str, secs: i64) -> Vec<TimerEvent> {
            let record = timed(package_id, self.start, secs);
            let events = self.scheduler.arm_restriction(&record, self.start);
            self.store.add(record);
            events
        }

        fn tick(&mut self, ms: i64) -> Vec<TimerEvent> {
            let now = self.at(ms);
            self.scheduler.tick(&mut self.store, now)
        }

        fn alarm(&mut self, id: &AlarmId, ms: i64) -> Vec<TimerEvent> {
            let now = self.at(ms);
            self.scheduler.alarm_fired(id, &mut self.store, now)
        }
    }

    fn expired_count(events: &[TimerEvent], package_id: &str) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, TimerEvent::RestrictionExpired { package_id: p } if p == package_id))
            .count()
    }

    #[test]
    fn restriction_ticks_then_expires_once() {
        let mut f = fixture();
        let armed = f.add_timed("com.x", 5);
        assert_eq!(
            armed,
            vec![TimerEvent::RestrictionTick {
                package_id: "com.x".into(),
                remaining_ms: 5000
            }]
        );

        let mut all = Vec::new();
        for second in 1..=8 {
            all.extend(f.tick(second * 1000));
        }
        assert_eq!(expired_count(&all, "com.x"), 1);
        let expired_at = all
            .iter()
            .position(|e| matches!(e, TimerEvent::RestrictionExpired { .. }))
            .unwrap();
        assert!(all[expired_at + 1..].iter().all(|e| e.package_id() != Some("com.x")));
        assert!(f.store.is_empty());
        assert_eq!(f.scheduler.state(&AlarmId::Restriction("com.x".into())), DomainState::Idle);
    }

    #[test]
    fn tick_at_exact_end_time_does_not_expire() {
        let mut f = fixture();
        f.add_timed("com.x", 2);
        assert_eq!(
            f.tick(2000),
            vec![TimerEvent::RestrictionTick {
                package_id: "com.x".into(),
                remaining_ms: 0
            }]
        );
        assert_eq!(expired_count(&f.tick(2001), "com.x"), 1);
    }

    #[test]
    fn lazily_expired_records_are_announced_by_next_tick() {
        let mut f = fixture();
        f.add_timed("com.x", 2);
        let after_end = f.at(2500);
        assert!(!f.store.is_restricted("com.x", after_end));

        assert_eq!(expired_count(&f.tick(3000), "com.x"), 1);
        assert!(f.tick(4000).is_empty());
    }

    #[test]
    fn lazily_expired_records_are_collected_once() {
        let mut f = fixture();
        f.add_timed("com.x", 2);
        f.add_timed("com.y", 60);
        let later = f.at(2500);
        assert_eq!(f.store.list(later).len(), 1);

        let events = f.scheduler.collect_lapsed(&mut f.store);
        assert_eq!(
            events,
            vec![TimerEvent::RestrictionExpired {
                package_id: "com.x".into()
            }]
        );
        assert!(f.scheduler.collect_lapsed(&mut f.store).is_empty());
        assert!(matches!(
            f.scheduler.state(&AlarmId::Restriction("com.y".into())),
            DomainState::Armed { .. }
        ));
    }

    #[test]
    fn removed_record_is_not_resurrected_by_tick() {
        let mut f = fixture();
        f.add_timed("com.x", 5);
        f.store.remove("com.x");

        let events = f.tick(1000);
        assert!(events.iter().all(|e| e.package_id() != Some("com.x")));
        assert!(f.store.get("com.x").is_none());
        assert!(f
            .alarms
            .cancelled
            .lock()
            .unwrap()
            .contains(&AlarmId::Restriction("com.x".into())));
    }

    #[test]
    fn alarm_and_tick_agree_on_single_expiry() {
        let mut f = fixture();
        f.add_timed("com.x", 2);
        let id = AlarmId::Restriction("com.x".into());

        // Alarm lands exactly at the end time: not strictly past yet.
        assert!(f.alarm(&id, 2000).is_empty());
        assert!(matches!(f.scheduler.state(&id), DomainState::FiredPendingTick { .. }));

        assert_eq!(expired_count(&f.tick(2500), "com.x"), 1);
        assert!(f.alarm(&id, 2600).is_empty());
    }

    #[test]
    fn late_alarm_expires_without_tick() {
        let mut f = fixture();
        f.add_timed("com.x", 2);
        let id = AlarmId::Restriction("com.x".into());
        assert_eq!(expired_count(&f.alarm(&id, 60_000), "com.x"), 1);
        assert!(f.tick(61_000).is_empty());
    }

    #[test]
    fn focus_ticks_and_finishes_inclusively() {
        let mut f = fixture();
        let end = f.at(3000);
        let start = f.start;
        assert_eq!(
            f.scheduler.start_focus(end, start),
            vec![TimerEvent::FocusTick { remaining_ms: 3000 }]
        );
        assert_eq!(f.tick(1000), vec![TimerEvent::FocusTick { remaining_ms: 2000 }]);
        assert_eq!(f.tick(3000), vec![TimerEvent::FocusExpired]);
        assert!(f.tick(4000).is_empty());
        assert!(!f.scheduler.focus().is_active());

        let persisted = f.kv.load(FOCUS_END_KEY).unwrap().unwrap();
        assert_eq!(persisted, b"null");
    }

    #[test]
    fn stop_focus_only_reports_running_sessions() {
        let mut f = fixture();
        assert!(f.scheduler.stop_focus().is_empty());
        let (end, start) = (f.at(10_000), f.start);
        f.scheduler.start_focus(end, start);
        assert_eq!(f.scheduler.stop_focus(), vec![TimerEvent::FocusExpired]);
        assert!(f.alarms.cancelled.lock().unwrap().contains(&AlarmId::Focus));
        assert!(f.scheduler.stop_focus().is_empty());
    }

    #[test]
    fn restore_rearms_future_focus() {
        let mut f = fixture();
        let (end, start) = (f.at(10_000), f.start);
        f.scheduler.start_focus(end, start);

        let mirror = DurableMirror::inline(f.kv.clone());
        let alarms = Arc::new(RecordingAlarms::default());
        let mut restarted = ExpiryScheduler::new(alarms.clone(), mirror);
        let events = restarted.restore(&f.store, f.at(4000));
        assert_eq!(events, vec![TimerEvent::StateRestored]);
        assert_eq!(restarted.focus().end_time(), Some(end));
        assert_eq!(*alarms.scheduled.lock().unwrap(), vec![(AlarmId::Focus, end)]);

        let now = f.at(5000);
        assert_eq!(
            restarted.tick(&mut f.store, now),
            vec![TimerEvent::FocusTick { remaining_ms: 5000 }]
        );
    }

    #[test]
    fn restore_expires_past_focus_once() {
        let mut f = fixture();
        let (end, start) = (f.at(1000), f.start);
        f.scheduler.start_focus(end, start);

        let mirror = DurableMirror::inline(f.kv.clone());
        let mut restarted = ExpiryScheduler::new(Arc::new(RecordingAlarms::default()), mirror);
        let events = restarted.restore(&f.store, f.at(5000));
        assert_eq!(events, vec![TimerEvent::FocusExpired, TimerEvent::StateRestored]);
        let now = f.at(6000);
        assert!(restarted.tick(&mut f.store, now).is_empty());

        let mirror = DurableMirror::inline(f.kv.clone());
        let mut again = ExpiryScheduler::new(Arc::new(RecordingAlarms::default()), mirror);
        assert_eq!(again.restore(&f.store, f.at(7000)), vec![TimerEvent::StateRestored]);
    }

    #[test]
    fn restore_derives_restriction_timers_from_store() {
        let mut f = fixture();
        let record = timed("com.x", f.start, 30);
        f.store.add(record);
        let alarms = Arc::new(RecordingAlarms::default());
        let mut restarted = ExpiryScheduler::new(alarms.clone(), DurableMirror::inline(f.kv.clone()));
        restarted.restore(&f.store, f.start);

        let id = AlarmId::Restriction("com.x".into());
        assert!(matches!(restarted.state(&id), DomainState::Armed { .. }));
        assert_eq!(alarms.scheduled.lock().unwrap()[0].0, id);
    }

    #[test]
    fn rejected_alarm_keeps_domain_armed() {
        let mut f = fixture_with(RecordingAlarms {
            deny: true,
            ..Default::default()
        });
        f.add_timed("com.x", 2);
        let (end, start) = (f.at(2000), f.start);
        f.scheduler.start_focus(end, start);
        let id = AlarmId::Restriction("com.x".into());
        assert!(matches!(f.scheduler.state(&id), DomainState::Armed { .. }));
        assert!(matches!(f.scheduler.state(&AlarmId::Focus), DomainState::Armed { .. }));

        let events = f.tick(3000);
        assert!(events.contains(&TimerEvent::FocusExpired));
        assert_eq!(expired_count(&events, "com.x"), 1);
    }

    #[test]
    fn overwritten_record_follows_new_end_time() {
        let mut f = fixture();
        f.add_timed("com.x", 2);
        let longer = timed("com.x", f.start, 60);
        f.store.add(longer);

        assert_eq!(
            f.tick(5000),
            vec![TimerEvent::RestrictionTick {
                package_id: "com.x".into(),
                remaining_ms: 55_000
            }]
        );
    }
}
