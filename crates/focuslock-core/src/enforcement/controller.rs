//! Enforcement controller.
//!
//! Decides, for each foreground change, whether the frontmost app must be
//! blocked, and drives the blocking-surface lifecycle. The controller never
//! touches a collaborator itself: every method returns the [`Directive`]s the
//! engine should carry out, so surface calls and navigation can run off the
//! event loop.
//!
//! ## Escalation
//!
//! A block decision shows the surface, navigates back, and schedules one
//! verification per configured delay (300/800/1500ms by default). Each
//! verification re-shows the surface if it is not up for the current
//! foreground app; the last one also navigates home. Every block decision
//! starts a new generation, and verifications from older generations are
//! dropped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::platform::SurfaceAction;
use crate::storage::{EnforcementConfig, RestrictionStore};

/// What the engine must do on the controller's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    ShowSurface { package_id: String },
    HideSurface,
    NavigateBack,
    NavigateHome,
    OpenDashboard,
    /// Call [`EnforcementController::on_verification`] with `step` and
    /// `generation` after `delay`.
    ScheduleVerification {
        step: usize,
        delay: Duration,
        generation: u64,
    },
}

/// Transient per-process enforcement bookkeeping. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementState {
    pub current_foreground: Option<String>,
    pub last_blocked: Option<String>,
    pub last_blocked_at: Option<DateTime<Utc>>,
    /// Package the surface was last shown for. Set optimistically when a show
    /// is issued; cleared on hide, failed show, or dismissal.
    pub overlay_shown_for: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnforcementController {
    own_package: String,
    debounce: chrono::Duration,
    escalation_delays: Vec<Duration>,
    generation: u64,
    state: EnforcementState,
}

impl EnforcementController {
    pub fn new(config: &EnforcementConfig) -> Self {
        Self {
            own_package: config.own_package.clone(),
            debounce: chrono::Duration::from_std(config.debounce())
                .unwrap_or_else(|_| chrono::Duration::zero()),
            escalation_delays: config.escalation_delays(),
            generation: 0,
            state: EnforcementState::default(),
        }
    }

    pub fn state(&self) -> &EnforcementState {
        &self.state
    }

    /// Handle a foreground-app change.
    pub fn on_foreground_changed(
        &mut self,
        package_id: &str,
        store: &mut RestrictionStore,
        now: DateTime<Utc>,
    ) -> Vec<Directive> {
        if package_id == self.own_package {
            tracing::debug!(%package_id, "ignoring own package");
            return Vec::new();
        }

        if store.is_restricted(package_id, now) {
            if self.is_debounced(package_id, now) {
                tracing::debug!(%package_id, "block debounced");
                // Keep tracking the frontmost app so the poll can recover
                // a surface that was hidden in between.
                self.state.current_foreground = Some(package_id.to_string());
                return Vec::new();
            }
            return self.block(package_id, now);
        }

        if self.state.current_foreground.as_deref() == Some(package_id) {
            return Vec::new();
        }
        self.state.current_foreground = Some(package_id.to_string());
        self.hide_if_shown().into_iter().collect()
    }

    /// One step of the escalation sequence.
    pub fn on_verification(
        &mut self,
        step: usize,
        generation: u64,
        store: &mut RestrictionStore,
        now: DateTime<Utc>,
    ) -> Vec<Directive> {
        if generation != self.generation {
            tracing::debug!(step, generation, current = self.generation, "dropping stale verification");
            return Vec::new();
        }

        let mut directives = Vec::new();
        if let Some(show) = self.reshow_if_missing(store, now) {
            tracing::info!(step, "surface missing at verification, re-showing");
            directives.push(show);
        }
        if step + 1 >= self.escalation_delays.len() {
            tracing::info!(step, "escalation finished, sending user home");
            directives.push(Directive::NavigateHome);
        }
        directives
    }

    /// Ambient poll: re-show the surface if the frontmost app is restricted
    /// and nothing is shown for it.
    pub fn on_poll(&mut self, store: &mut RestrictionStore, now: DateTime<Utc>) -> Vec<Directive> {
        self.reshow_if_missing(store, now).into_iter().collect()
    }

    /// The surface refused to show. Enforcement falls back to navigation
    /// for this cycle.
    pub fn on_show_failed(&mut self, package_id: &str) {
        if self.state.overlay_shown_for.as_deref() == Some(package_id) {
            self.state.overlay_shown_for = None;
        }
    }

    /// The presentation collaborator reports the surface is gone.
    pub fn on_surface_dismissed(&mut self) {
        self.state.overlay_shown_for = None;
    }

    /// A restriction was removed or expired.
    pub fn on_restriction_lifted(&mut self, package_id: &str) -> Vec<Directive> {
        if self.state.last_blocked.as_deref() == Some(package_id) {
            self.state.last_blocked = None;
            self.state.last_blocked_at = None;
            self.generation += 1;
        }
        if self.state.overlay_shown_for.as_deref() == Some(package_id) {
            tracing::info!(%package_id, "restriction lifted, hiding surface");
            return self.hide_if_shown().into_iter().collect();
        }
        Vec::new()
    }

    /// A button on the blocking surface was pressed.
    pub fn on_surface_action(&mut self, action: SurfaceAction) -> Vec<Directive> {
        match action {
            SurfaceAction::GoHome => vec![Directive::NavigateHome],
            SurfaceAction::OpenDashboard => {
                self.state.current_foreground = None;
                let mut directives: Vec<Directive> = self.hide_if_shown().into_iter().collect();
                directives.push(Directive::OpenDashboard);
                directives
            }
        }
    }

    /// Hide the surface during shutdown and drop pending verifications.
    pub fn on_shutdown(&mut self) -> Vec<Directive> {
        self.generation += 1;
        self.state.overlay_shown_for = None;
        vec![Directive::HideSurface]
    }

    fn is_debounced(&self, package_id: &str, now: DateTime<Utc>) -> bool {
        match (&self.state.last_blocked, self.state.last_blocked_at) {
            (Some(last), Some(at)) => last == package_id && now - at < self.debounce,
            _ => false,
        }
    }

    fn block(&mut self, package_id: &str, now: DateTime<Utc>) -> Vec<Directive> {
        tracing::info!(%package_id, "blocking restricted app");
        self.state.last_blocked = Some(package_id.to_string());
        self.state.last_blocked_at = Some(now);
        self.state.current_foreground = Some(package_id.to_string());
        self.generation += 1;

        let mut directives = Vec::with_capacity(self.escalation_delays.len() + 2);
        if let Some(show) = self.show(package_id) {
            directives.push(show);
        }
        directives.push(Directive::NavigateBack);
        directives.extend(
            self.escalation_delays
                .iter()
                .enumerate()
                .map(|(step, delay)| Directive::ScheduleVerification {
                    step,
                    delay: *delay,
                    generation: self.generation,
                }),
        );
        directives
    }

    fn reshow_if_missing(&mut self, store: &mut RestrictionStore, now: DateTime<Utc>) -> Option<Directive> {
        let current = self.state.current_foreground.clone()?;
        if !store.is_restricted(&current, now) {
            return None;
        }
        self.show(&current)
    }

    /// No-op when already shown for `package_id`.
    fn show(&mut self, package_id: &str) -> Option<Directive> {
        if self.state.overlay_shown_for.as_deref() == Some(package_id) {
            return None;
        }
        self.state.overlay_shown_for = Some(package_id.to_string());
        Some(Directive::ShowSurface {
            package_id: package_id.to_string(),
        })
    }

    fn hide_if_shown(&mut self) -> Option<Directive> {
        self.state.overlay_shown_for.take().map(|_| Directive::HideSurface)
    }
}
