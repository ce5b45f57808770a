//! End-to-end tests for the enforcement engine.
//!
//! Every test runs on a paused tokio clock. `TokioClock` derives wall time
//! from it, so the tick loop, wake alarms, verification delays and record
//! end times all move together and the timings below are exact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use focuslock_core::storage::{KeyValueStore, FOCUS_END_KEY};
use focuslock_core::{
    BlockPrompt, BlockingSurface, Capability, Clock, Collaborators, Config, ConfigError, CoreError,
    Engine, EngineHandle, MemoryKv, ObserverUpdate, RestrictionTerm, StaticCatalog, SurfaceAction,
    SystemNavigator, TimerEvent, TokioAlarms, TokioClock,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurfaceMode {
    Works,
    /// `show` reports success but nothing appears.
    Silent,
    Denied,
}

struct RecordingSurface {
    mode: SurfaceMode,
    shows: Mutex<Vec<String>>,
    hides: AtomicUsize,
    showing: Mutex<Option<String>>,
}

impl RecordingSurface {
    fn new(mode: SurfaceMode) -> Self {
        Self {
            mode,
            shows: Mutex::new(Vec::new()),
            hides: AtomicUsize::new(0),
            showing: Mutex::new(None),
        }
    }

    fn show_calls(&self) -> usize {
        self.shows.lock().unwrap().len()
    }

    fn showing(&self) -> Option<String> {
        self.showing.lock().unwrap().clone()
    }
}

impl BlockingSurface for RecordingSurface {
    fn show(&self, prompt: BlockPrompt) -> Result<(), CoreError> {
        self.shows.lock().unwrap().push(prompt.package_id.clone());
        match self.mode {
            SurfaceMode::Works => {
                *self.showing.lock().unwrap() = Some(prompt.package_id);
                Ok(())
            }
            SurfaceMode::Silent => Ok(()),
            SurfaceMode::Denied => Err(CoreError::permission_denied(Capability::Overlay)),
        }
    }

    fn hide(&self) -> Result<(), CoreError> {
        self.hides.fetch_add(1, Ordering::SeqCst);
        *self.showing.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNavigator {
    back: AtomicUsize,
    home: AtomicUsize,
    dashboard: AtomicUsize,
}

impl SystemNavigator for RecordingNavigator {
    fn navigate_back(&self) -> Result<(), CoreError> {
        self.back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn navigate_home(&self) -> Result<(), CoreError> {
        self.home.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_dashboard(&self) -> Result<(), CoreError> {
        self.dashboard.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Rig {
    handle: EngineHandle,
    events: broadcast::Receiver<TimerEvent>,
    surface: Arc<RecordingSurface>,
    navigator: Arc<RecordingNavigator>,
    clock: Arc<TokioClock>,
    task: JoinHandle<()>,
}

struct RigBuilder {
    kv: Arc<MemoryKv>,
    clock: Arc<TokioClock>,
    mode: SurfaceMode,
    config: Config,
    catalog: StaticCatalog,
}

impl RigBuilder {
    fn new() -> Self {
        Self {
            kv: Arc::new(MemoryKv::new()),
            clock: Arc::new(TokioClock::new()),
            mode: SurfaceMode::Works,
            config: Config::default(),
            catalog: StaticCatalog::new(true),
        }
    }

    fn kv(mut self, kv: Arc<MemoryKv>) -> Self {
        self.kv = kv;
        self
    }

    fn clock(mut self, clock: Arc<TokioClock>) -> Self {
        self.clock = clock;
        self
    }

    fn surface(mut self, mode: SurfaceMode) -> Self {
        self.mode = mode;
        self
    }

    fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    fn catalog(mut self, catalog: StaticCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    fn start(self) -> Rig {
        let surface = Arc::new(RecordingSurface::new(self.mode));
        let navigator = Arc::new(RecordingNavigator::default());
        let (alarms, fired) = TokioAlarms::new(self.clock.clone());
        let engine = Engine::new(
            &self.config,
            Collaborators {
                kv: self.kv,
                alarms: Arc::new(alarms),
                catalog: Arc::new(self.catalog),
                surface: surface.clone(),
                navigator: navigator.clone(),
                clock: self.clock.clone(),
            },
        )
        .unwrap();
        let handle = engine.handle();
        let events = engine.subscribe();
        handle.forward_alarms(fired);
        let task = engine.spawn();
        Rig {
            handle,
            events,
            surface,
            navigator,
            clock: self.clock,
            task,
        }
    }
}

impl Rig {
    fn drain(&mut self) -> Vec<TimerEvent> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
            }
        }
    }

    fn foreground(&self, package_id: &str) {
        self.handle
            .foreground_changed(package_id, self.clock.now())
            .unwrap();
    }

    async fn stop(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap();
    }
}

fn expired(events: &[TimerEvent], package_id: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TimerEvent::RestrictionExpired { package_id: p } if p == package_id))
        .count()
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test(start_paused = true)]
async fn timed_restriction_expires_exactly_once() {
    let mut rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::For { duration_ms: 5000 })
        .await
        .unwrap();

    sleep(ms(8000)).await;
    let events = rig.drain();

    assert_eq!(expired(&events, "com.x"), 1);
    let at = events
        .iter()
        .position(|e| matches!(e, TimerEvent::RestrictionExpired { .. }))
        .unwrap();
    assert!(events[..at]
        .iter()
        .any(|e| matches!(e, TimerEvent::RestrictionTick { package_id, .. } if package_id == "com.x")));
    assert!(events[at + 1..].iter().all(|e| e.package_id() != Some("com.x")));
    assert!(rig.handle.list_restrictions().await.unwrap().is_empty());
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn list_after_expiry_is_empty_with_one_notification() {
    let mut rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::For { duration_ms: 2000 })
        .await
        .unwrap();

    sleep(ms(2500)).await;
    assert!(rig.handle.list_restrictions().await.unwrap().is_empty());

    sleep(ms(3000)).await;
    assert_eq!(expired(&rig.drain(), "com.x"), 1);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn removal_silences_the_restriction() {
    let mut rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::For { duration_ms: 5000 })
        .await
        .unwrap();
    sleep(ms(1500)).await;

    let removed = rig.handle.remove_restriction("com.x").await.unwrap();
    assert!(removed.is_some());
    rig.drain();

    sleep(ms(8000)).await;
    assert!(rig.drain().iter().all(|e| e.package_id() != Some("com.x")));
    // Removing again is a no-op.
    assert!(rig.handle.remove_restriction("com.x").await.unwrap().is_none());
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_foreground_event_shows_surface_once() {
    let rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::Permanent)
        .await
        .unwrap();

    rig.foreground("com.x");
    sleep(ms(200)).await;
    rig.foreground("com.x");
    sleep(ms(2000)).await;

    assert_eq!(rig.surface.show_calls(), 1);
    assert_eq!(rig.surface.showing().as_deref(), Some("com.x"));
    assert_eq!(rig.navigator.back.load(Ordering::SeqCst), 1);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn silent_surface_failure_escalates_home_once() {
    let rig = RigBuilder::new().surface(SurfaceMode::Silent).start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::Permanent)
        .await
        .unwrap();

    rig.foreground("com.x");
    sleep(ms(1400)).await;
    assert_eq!(rig.navigator.home.load(Ordering::SeqCst), 0);
    sleep(ms(200)).await;
    assert_eq!(rig.navigator.home.load(Ordering::SeqCst), 1);

    sleep(ms(5000)).await;
    assert_eq!(rig.navigator.home.load(Ordering::SeqCst), 1);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn denied_surface_degrades_to_navigation() {
    let rig = RigBuilder::new().surface(SurfaceMode::Denied).start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::Permanent)
        .await
        .unwrap();

    rig.foreground("com.x");
    sleep(ms(1600)).await;

    assert_eq!(rig.navigator.back.load(Ordering::SeqCst), 1);
    assert_eq!(rig.navigator.home.load(Ordering::SeqCst), 1);
    // Each failed show clears the bookkeeping, so the retries keep trying.
    assert!(rig.surface.show_calls() > 1);
    assert!(rig.surface.showing().is_none());
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn allowed_app_hides_surface() {
    let rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::Permanent)
        .await
        .unwrap();

    rig.foreground("com.x");
    sleep(ms(100)).await;
    assert_eq!(rig.surface.showing().as_deref(), Some("com.x"));

    rig.foreground("com.launcher");
    sleep(ms(100)).await;
    assert!(rig.surface.showing().is_none());
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dismissed_surface_is_restored_by_poll() {
    let rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::Permanent)
        .await
        .unwrap();
    rig.foreground("com.x");
    sleep(ms(2000)).await;
    assert_eq!(rig.surface.show_calls(), 1);

    rig.handle.surface_dismissed().unwrap();
    sleep(ms(600)).await;
    assert_eq!(rig.surface.show_calls(), 2);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn expiry_lifts_active_block() {
    let rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::For { duration_ms: 2000 })
        .await
        .unwrap();
    rig.foreground("com.x");
    sleep(ms(100)).await;
    assert_eq!(rig.surface.showing().as_deref(), Some("com.x"));

    sleep(ms(3000)).await;
    assert!(rig.surface.showing().is_none());
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn surface_buttons_reach_the_navigator() {
    let rig = RigBuilder::new().start();
    rig.handle.surface_action(SurfaceAction::GoHome).unwrap();
    rig.handle.surface_action(SurfaceAction::OpenDashboard).unwrap();
    sleep(ms(50)).await;
    assert_eq!(rig.navigator.home.load(Ordering::SeqCst), 1);
    assert_eq!(rig.navigator.dashboard.load(Ordering::SeqCst), 1);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn focus_survives_restart() {
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(TokioClock::new());

    let first = RigBuilder::new().kv(kv.clone()).clock(clock.clone()).start();
    let session = first.handle.start_focus(Duration::from_secs(10)).await.unwrap();
    assert!(session.is_active());
    sleep(ms(1000)).await;
    first.stop().await;
    assert!(kv.load(FOCUS_END_KEY).unwrap().is_some());

    let mut second = RigBuilder::new().kv(kv.clone()).clock(clock.clone()).start();
    sleep(ms(1500)).await;
    let early = second.drain();
    assert!(early.contains(&TimerEvent::StateRestored));
    assert!(early.iter().any(|e| matches!(e, TimerEvent::FocusTick { .. })));
    assert!(!early.contains(&TimerEvent::FocusExpired));

    // End time is 10s after the first start.
    sleep(ms(7000)).await;
    assert!(!second.drain().contains(&TimerEvent::FocusExpired));
    sleep(ms(1000)).await;
    let late = second.drain();
    assert_eq!(late.iter().filter(|e| **e == TimerEvent::FocusExpired).count(), 1);
    assert!(!second.handle.status().await.unwrap().focus_active);
    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn focus_that_ended_while_stopped_expires_on_restore() {
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(TokioClock::new());

    let first = RigBuilder::new().kv(kv.clone()).clock(clock.clone()).start();
    first.handle.start_focus(Duration::from_secs(2)).await.unwrap();
    first.stop().await;

    sleep(ms(5000)).await;
    let mut second = RigBuilder::new().kv(kv).clock(clock).start();
    sleep(ms(3000)).await;
    let events = second.drain();
    assert_eq!(events.iter().filter(|e| **e == TimerEvent::FocusExpired).count(), 1);
    assert_eq!(events.first(), Some(&TimerEvent::FocusExpired));
    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restrictions_survive_restart() {
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(TokioClock::new());

    let first = RigBuilder::new().kv(kv.clone()).clock(clock.clone()).start();
    first
        .handle
        .add_restriction("com.x", RestrictionTerm::minutes(30))
        .await
        .unwrap();
    first
        .handle
        .add_restriction("com.y", RestrictionTerm::Permanent)
        .await
        .unwrap();
    first.stop().await;

    let second = RigBuilder::new().kv(kv).clock(clock).start();
    let listed: Vec<String> = second
        .handle
        .list_restrictions()
        .await
        .unwrap()
        .iter()
        .map(|r| r.package_id().to_string())
        .collect();
    assert_eq!(listed, vec!["com.x".to_string(), "com.y".to_string()]);
    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_package_is_rejected() {
    let rig = RigBuilder::new().catalog(StaticCatalog::new(false)).start();
    let err = rig
        .handle
        .add_restriction("com.unknown", RestrictionTerm::Permanent)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn observers_get_snapshot_then_notices() {
    let rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::For { duration_ms: 2000 })
        .await
        .unwrap();

    let mut first = rig.handle.attach().await.unwrap();
    let mut second = rig.handle.attach().await.unwrap();
    assert_eq!(first.snapshot().restrictions.len(), 1);
    assert_eq!(first.snapshot().restrictions[0].remaining_ms, Some(2000));

    sleep(ms(3500)).await;
    for attachment in [&mut first, &mut second] {
        let mut notices = Vec::new();
        while let Ok(Some(update)) = tokio::time::timeout(ms(1), attachment.next()).await {
            if let ObserverUpdate::Notice { message } = update {
                notices.push(message);
            }
        }
        assert_eq!(notices, vec!["com.x restriction has expired".to_string()]);
        assert!(attachment.view().get("com.x").is_none());
    }
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn observer_view_follows_adds_and_removals() {
    let rig = RigBuilder::new().start();
    let mut attachment = rig.handle.attach().await.unwrap();

    rig.handle
        .add_restriction("com.t", RestrictionTerm::minutes(5))
        .await
        .unwrap();
    while let Ok(Some(_)) = tokio::time::timeout(ms(1), attachment.next()).await {}
    assert!(attachment.view().get("com.t").is_some());

    rig.handle
        .add_restriction("com.p", RestrictionTerm::Permanent)
        .await
        .unwrap();
    assert!(rig.handle.remove_restriction("com.t").await.unwrap().is_some());
    while let Ok(Some(_)) = tokio::time::timeout(ms(1), attachment.next()).await {}

    let seen: Vec<String> = attachment
        .view()
        .restrictions()
        .map(|v| v.record.package_id().to_string())
        .collect();
    let listed: Vec<String> = rig
        .handle
        .list_restrictions()
        .await
        .unwrap()
        .iter()
        .map(|r| r.package_id().to_string())
        .collect();
    assert_eq!(seen, listed);
    assert_eq!(seen, vec!["com.p".to_string()]);
    assert_eq!(attachment.view().get("com.p").unwrap().remaining_ms, None);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn zero_tick_interval_is_rejected() {
    let mut config = Config::default();
    config.timers.tick_interval_ms = 0;
    let clock = Arc::new(TokioClock::new());
    let (alarms, _fired) = TokioAlarms::new(clock.clone());
    let result = Engine::new(
        &config,
        Collaborators {
            kv: Arc::new(MemoryKv::new()),
            alarms: Arc::new(alarms),
            catalog: Arc::new(StaticCatalog::new(true)),
            surface: Arc::new(RecordingSurface::new(SurfaceMode::Works)),
            navigator: Arc::new(RecordingNavigator::default()),
            clock,
        },
    );
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[tokio::test(start_paused = true)]
async fn lagging_observer_resyncs() {
    let mut config = Config::default();
    config.events.channel_capacity = 2;
    let rig = RigBuilder::new().config(config).start();
    let mut attachment = rig.handle.attach().await.unwrap();

    for package_id in ["com.a", "com.b", "com.c", "com.d"] {
        rig.handle
            .add_restriction(package_id, RestrictionTerm::minutes(5))
            .await
            .unwrap();
    }

    match attachment.next().await {
        Some(ObserverUpdate::Resynced { snapshot }) => assert_eq!(snapshot.restrictions.len(), 4),
        other => panic!("expected a resync, got {other:?}"),
    }
    assert_eq!(attachment.view().restrictions().count(), 4);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn status_summarises_engine() {
    let rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::Permanent)
        .await
        .unwrap();
    rig.handle.start_focus(Duration::from_secs(60)).await.unwrap();

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.to_string(), "Focus Mode Active | 1 Active Restrictions");

    rig.handle.stop_focus().await.unwrap();
    assert_eq!(rig.handle.status().await.unwrap().to_string(), "1 Active Restrictions");
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_hides_surface_and_closes_handle() {
    let rig = RigBuilder::new().start();
    rig.handle
        .add_restriction("com.x", RestrictionTerm::Permanent)
        .await
        .unwrap();
    rig.foreground("com.x");
    sleep(ms(100)).await;

    let handle = rig.handle.clone();
    let surface = rig.surface.clone();
    rig.stop().await;

    assert!(surface.showing().is_none());
    assert!(matches!(
        handle.list_restrictions().await,
        Err(CoreError::EngineClosed)
    ));
}
