use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{Command, Reply};
use crate::error::{CoreError, Result};
use crate::events::TimerEvent;
use crate::facade::{Attachment, EngineStatus, SyncSnapshot};
use crate::model::{FocusSession, RestrictionRecord, RestrictionTerm};
use crate::platform::{AlarmId, SurfaceAction};

/// Cloneable access point to a running engine.
///
/// Observer calls wait for the engine's answer. Collaborator inlets
/// (`foreground_changed`, `alarm_fired`, ...) only enqueue.
///
/// Handles never own the event stream: once the engine stops, every
/// subscriber sees the stream close.
#[derive(Clone)]
pub struct EngineHandle {
    inbox: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    pub(super) fn new(inbox: mpsc::UnboundedSender<Command>) -> Self {
        Self { inbox }
    }

    // ── Observer API ─────────────────────────────────────────────────

    /// Restrict `package_id` for `term`. Overwrites an existing restriction
    /// for the same package.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] if the app catalog does not know the package,
    /// [`CoreError::Validation`] for an empty id or an unusable term.
    pub async fn add_restriction(
        &self,
        package_id: impl Into<String>,
        term: RestrictionTerm,
    ) -> Result<RestrictionRecord> {
        let package_id = package_id.into();
        self.request(|reply| Command::AddRestriction {
            package_id,
            term,
            reply,
        })
        .await?
    }

    /// Remove the restriction for `package_id`, returning it if there was one.
    pub async fn remove_restriction(&self, package_id: &str) -> Result<Option<RestrictionRecord>> {
        let package_id = package_id.to_string();
        self.request(|reply| Command::RemoveRestriction { package_id, reply })
            .await
    }

    pub async fn start_focus(&self, duration: Duration) -> Result<FocusSession> {
        self.request(|reply| Command::StartFocus { duration, reply })
            .await?
    }

    pub async fn stop_focus(&self) -> Result<()> {
        self.request(|reply| Command::StopFocus { reply }).await
    }

    /// Active restrictions. Expired records are swept first.
    pub async fn list_restrictions(&self) -> Result<Vec<RestrictionRecord>> {
        self.request(|reply| Command::ListRestrictions { reply })
            .await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SyncSnapshot> {
        let (snapshot, _) = self.snapshot_and_subscribe().await?;
        Ok(snapshot)
    }

    /// Reconciliation snapshot followed by the live event stream.
    pub async fn attach(&self) -> Result<Attachment> {
        let (snapshot, events) = self.snapshot_and_subscribe().await?;
        Ok(Attachment::new(snapshot, events, self.clone()))
    }

    /// Raw event stream without a snapshot.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<TimerEvent>> {
        let (_, events) = self.snapshot_and_subscribe().await?;
        Ok(events)
    }

    /// Stop the engine: hides the surface and flushes pending writes.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub(crate) async fn snapshot_and_subscribe(
        &self,
    ) -> Result<(SyncSnapshot, broadcast::Receiver<TimerEvent>)> {
        self.request(|reply| Command::Attach { reply }).await
    }

    // ── Collaborator inlets ──────────────────────────────────────────

    pub fn foreground_changed(&self, package_id: impl Into<String>, timestamp: DateTime<Utc>) -> Result<()> {
        self.send(Command::ForegroundChanged {
            package_id: package_id.into(),
            timestamp,
        })
    }

    pub fn alarm_fired(&self, id: AlarmId) -> Result<()> {
        self.send(Command::AlarmFired(id))
    }

    pub fn surface_dismissed(&self) -> Result<()> {
        self.send(Command::SurfaceDismissed)
    }

    pub fn surface_action(&self, action: SurfaceAction) -> Result<()> {
        self.send(Command::SurfaceAction(action))
    }

    /// Forward fired alarm ids from `fired` until either side goes away.
    /// Does not keep the engine alive.
    pub fn forward_alarms(&self, mut fired: mpsc::UnboundedReceiver<AlarmId>) -> JoinHandle<()> {
        let inbox = self.inbox.downgrade();
        tokio::spawn(async move {
            while let Some(id) = fired.recv().await {
                let Some(inbox) = inbox.upgrade() else {
                    break;
                };
                if inbox.send(Command::AlarmFired(id)).is_err() {
                    break;
                }
            }
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inbox.send(command).map_err(|_| CoreError::EngineClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.send(build(reply))?;
        answer.await.map_err(|_| CoreError::EngineClosed)
    }
}
