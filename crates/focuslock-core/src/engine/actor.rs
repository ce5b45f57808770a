use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{Collaborators, Command, EngineSettings, Reply};
use crate::enforcement::{Directive, EnforcementController};
use crate::error::{CoreError, ValidationError};
use crate::events::TimerEvent;
use crate::facade::{EngineStatus, SyncSnapshot};
use crate::model::{FocusSession, RestrictionRecord, RestrictionTerm};
use crate::platform::{AlarmId, BlockPrompt, SurfaceActions};
use crate::storage::{DurableMirror, RestrictionStore};
use crate::timer::ExpiryScheduler;

type Inbox = mpsc::WeakUnboundedSender<Command>;

enum SurfaceJob {
    Show(BlockPrompt),
    Hide,
}

/// Runs surface calls one at a time on the blocking pool, so a hide issued
/// after a show can never overtake it.
fn spawn_surface_worker(
    collaborators: &Collaborators,
    inbox: Inbox,
) -> (mpsc::UnboundedSender<SurfaceJob>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SurfaceJob>();
    let surface = collaborators.surface.clone();
    let worker = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let surface = surface.clone();
            let joined = tokio::task::spawn_blocking(move || match job {
                SurfaceJob::Show(prompt) => {
                    let package_id = prompt.package_id.clone();
                    surface.show(prompt).err().map(|error| (package_id, error))
                }
                SurfaceJob::Hide => {
                    if let Err(e) = surface.hide() {
                        tracing::warn!(error = %e, "failed to hide blocking surface");
                    }
                    None
                }
            })
            .await;
            match joined {
                Ok(Some((package_id, error))) => {
                    if let Some(inbox) = inbox.upgrade() {
                        let _ = inbox.send(Command::ShowFailed { package_id, error });
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "surface task failed to join"),
            }
        }
        tracing::debug!("surface worker drained");
    });
    (tx, worker)
}

struct Actor {
    settings: EngineSettings,
    collaborators: Collaborators,
    inbox: Inbox,
    events: broadcast::Sender<TimerEvent>,
    store: RestrictionStore,
    scheduler: ExpiryScheduler,
    controller: EnforcementController,
    surface_jobs: mpsc::UnboundedSender<SurfaceJob>,
    last_foreground_at: Option<DateTime<Utc>>,
}

pub(super) async fn run(
    settings: EngineSettings,
    collaborators: Collaborators,
    inbox: Inbox,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<TimerEvent>,
) {
    let failures = inbox.clone();
    let (mirror, writer) = DurableMirror::deferred(collaborators.kv.clone(), move |failure| {
        if let Some(inbox) = failures.upgrade() {
            let _ = inbox.send(Command::WriteFailed(failure));
        }
    });
    let (surface_jobs, surface_worker) = spawn_surface_worker(&collaborators, inbox.clone());

    let now = collaborators.clock.now();
    let store = RestrictionStore::load(mirror.clone(), collaborators.catalog.as_ref(), now);
    let scheduler = ExpiryScheduler::new(collaborators.alarms.clone(), mirror);
    let mut actor = Actor {
        controller: EnforcementController::new(&settings.enforcement),
        settings,
        collaborators,
        inbox,
        events,
        store,
        scheduler,
        surface_jobs,
        last_foreground_at: None,
    };

    let restored = actor.scheduler.restore(&actor.store, now);
    actor.emit(restored);
    tracing::info!(restrictions = actor.store.len(), "enforcement engine started");

    // The first tick is one period out: arming already emitted initial ticks.
    let mut tick = interval_at(
        Instant::now() + actor.settings.tick_interval,
        actor.settings.tick_interval,
    );
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll = interval_at(
        Instant::now() + actor.settings.poll_interval,
        actor.settings.poll_interval,
    );
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown_reply = loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(command) => {
                    if let Some(reply) = actor.handle(command) {
                        break Some(reply);
                    }
                }
                None => break None,
            },
            _ = tick.tick() => actor.on_tick(),
            _ = poll.tick() => actor.on_poll(),
        }
        actor.announce_lapsed();
    };

    actor.shut_down(surface_worker, writer).await;
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

impl Actor {
    fn now(&self) -> DateTime<Utc> {
        self.collaborators.clock.now()
    }

    /// Handle one command. Returns the reply channel when the command asks
    /// the engine to stop.
    fn handle(&mut self, command: Command) -> Option<Reply<()>> {
        tracing::trace!(command = command.name(), "handling command");
        let now = self.now();
        match command {
            Command::AddRestriction {
                package_id,
                term,
                reply,
            } => {
                let _ = reply.send(self.add_restriction(package_id, term, now));
            }
            Command::RemoveRestriction { package_id, reply } => {
                let _ = reply.send(self.remove_restriction(&package_id));
            }
            Command::StartFocus { duration, reply } => {
                let _ = reply.send(self.start_focus(duration, now));
            }
            Command::StopFocus { reply } => {
                let events = self.scheduler.stop_focus();
                self.emit(events);
                let _ = reply.send(());
            }
            Command::ListRestrictions { reply } => {
                let _ = reply.send(self.store.list(now));
            }
            Command::Status { reply } => {
                let _ = reply.send(EngineStatus {
                    focus_active: self.scheduler.focus().is_active(),
                    focus_remaining_ms: self.scheduler.focus().remaining_ms(now),
                    active_restrictions: self.store.list(now).len(),
                });
            }
            Command::Attach { reply } => {
                let snapshot = self.snapshot(now);
                let _ = reply.send((snapshot, self.events.subscribe()));
            }
            Command::ForegroundChanged {
                package_id,
                timestamp,
            } => self.on_foreground_changed(&package_id, timestamp, now),
            Command::AlarmFired(id) => {
                tracing::debug!(alarm = %id, "wake alarm fired");
                let events = self.scheduler.alarm_fired(&id, &mut self.store, now);
                self.emit(events);
            }
            Command::SurfaceDismissed => {
                tracing::debug!("blocking surface dismissed");
                self.controller.on_surface_dismissed();
            }
            Command::SurfaceAction(action) => {
                tracing::info!(?action, "surface action");
                let directives = self.controller.on_surface_action(action);
                self.execute(directives);
            }
            Command::Verify { step, generation } => {
                let directives = self
                    .controller
                    .on_verification(step, generation, &mut self.store, now);
                self.execute(directives);
            }
            Command::ShowFailed { package_id, error } => {
                tracing::warn!(
                    %package_id,
                    error = %error,
                    "blocking surface unavailable, falling back to navigation"
                );
                self.controller.on_show_failed(&package_id);
            }
            Command::WriteFailed(failure) => {
                tracing::warn!(
                    key = %failure.key,
                    error = %failure.error,
                    "durable write failed, keeping in-memory state"
                );
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    fn add_restriction(
        &mut self,
        package_id: String,
        term: RestrictionTerm,
        now: DateTime<Utc>,
    ) -> Result<RestrictionRecord, CoreError> {
        if package_id.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "package_id".into(),
                message: "must not be empty".into(),
            }
            .into());
        }
        let metadata = self
            .collaborators
            .catalog
            .resolve(&package_id)
            .ok_or_else(|| CoreError::NotFound(format!("package '{package_id}'")))?;
        let record = term.into_record(package_id, metadata, now)?;

        tracing::info!(
            package_id = record.package_id(),
            permanent = record.is_permanent(),
            "restriction added"
        );
        // The delta goes first so observers know the record before its ticks.
        let mut events = vec![TimerEvent::RestrictionAdded {
            record: record.clone(),
            remaining_ms: record.remaining_ms(now),
        }];
        events.extend(self.scheduler.arm_restriction(&record, now));
        self.store.add(record.clone());
        self.emit(events);
        Ok(record)
    }

    fn remove_restriction(&mut self, package_id: &str) -> Option<RestrictionRecord> {
        let removed = self.store.remove(package_id);
        self.scheduler
            .cancel(&AlarmId::Restriction(package_id.to_string()));
        if removed.is_some() {
            tracing::info!(%package_id, "restriction removed");
            let directives = self.controller.on_restriction_lifted(package_id);
            self.execute(directives);
            self.emit(vec![TimerEvent::RestrictionRemoved {
                package_id: package_id.to_string(),
            }]);
        }
        removed
    }

    fn start_focus(
        &mut self,
        duration: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<FocusSession, CoreError> {
        let end_time = chrono::Duration::from_std(duration)
            .ok()
            .filter(|d| *d > chrono::Duration::zero())
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "duration".into(),
                message: format!("{duration:?} is not a usable focus duration"),
            })?;
        let events = self.scheduler.start_focus(end_time, now);
        self.emit(events);
        Ok(self.scheduler.focus())
    }

    fn snapshot(&mut self, now: DateTime<Utc>) -> SyncSnapshot {
        SyncSnapshot::new(self.store.list(now), self.scheduler.focus(), now)
    }

    fn on_foreground_changed(
        &mut self,
        package_id: &str,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        if matches!(self.last_foreground_at, Some(last) if timestamp < last) {
            tracing::debug!(%package_id, %timestamp, "dropping out-of-order foreground event");
            return;
        }
        self.last_foreground_at = Some(timestamp);
        let directives = self
            .controller
            .on_foreground_changed(package_id, &mut self.store, now);
        self.execute(directives);
    }

    fn on_tick(&mut self) {
        let now = self.now();
        let events = self.scheduler.tick(&mut self.store, now);
        self.emit(events);
    }

    fn on_poll(&mut self) {
        let now = self.now();
        let directives = self.controller.on_poll(&mut self.store, now);
        self.execute(directives);
    }

    /// Report records that reads dropped by lazy expiry.
    fn announce_lapsed(&mut self) {
        let events = self.scheduler.collect_lapsed(&mut self.store);
        self.emit(events);
    }

    fn emit(&mut self, events: Vec<TimerEvent>) {
        for event in events {
            if let TimerEvent::RestrictionExpired { package_id } = &event {
                let directives = self.controller.on_restriction_lifted(package_id);
                self.execute(directives);
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn execute(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::ShowSurface { package_id } => {
                    let display_name = self
                        .store
                        .get(&package_id)
                        .map(|r| r.display_name().to_string())
                        .unwrap_or_else(|| package_id.clone());
                    let prompt = BlockPrompt {
                        package_id,
                        display_name,
                        actions: self.surface_actions(),
                    };
                    self.submit(SurfaceJob::Show(prompt));
                }
                Directive::HideSurface => self.submit(SurfaceJob::Hide),
                Directive::NavigateBack => {
                    navigate("back", self.collaborators.navigator.navigate_back());
                }
                Directive::NavigateHome => {
                    navigate("home", self.collaborators.navigator.navigate_home());
                }
                Directive::OpenDashboard => {
                    navigate("dashboard", self.collaborators.navigator.open_dashboard());
                }
                Directive::ScheduleVerification {
                    step,
                    delay,
                    generation,
                } => {
                    let inbox = self.inbox.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(inbox) = inbox.upgrade() {
                            let _ = inbox.send(Command::Verify { step, generation });
                        }
                    });
                }
            }
        }
    }

    fn surface_actions(&self) -> SurfaceActions {
        let inbox = self.inbox.clone();
        SurfaceActions::new(move |action| {
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(Command::SurfaceAction(action));
            }
        })
    }

    fn submit(&self, job: SurfaceJob) {
        if self.surface_jobs.send(job).is_err() {
            tracing::warn!("surface worker has stopped");
        }
    }

    async fn shut_down(mut self, surface_worker: JoinHandle<()>, writer: JoinHandle<()>) {
        tracing::info!("enforcement engine stopping");
        let directives = self.controller.on_shutdown();
        self.execute(directives);

        let Actor {
            surface_jobs,
            store,
            scheduler,
            ..
        } = self;
        drop(surface_jobs);
        if let Err(e) = surface_worker.await {
            tracing::error!(error = %e, "surface worker failed to join");
        }
        // Dropping every mirror clone lets the writer drain and exit.
        drop(store);
        drop(scheduler);
        if let Err(e) = writer.await {
            tracing::error!(error = %e, "durable writer failed to join");
        }
    }
}

fn navigate(destination: &'static str, result: Result<(), CoreError>) {
    match result {
        Ok(()) => tracing::debug!(destination, "navigation issued"),
        Err(e) => tracing::warn!(destination, error = %e, "navigation failed"),
    }
}
