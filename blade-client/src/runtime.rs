//! Session runtime: auth gate, liveness monitoring, silent reconnection and the
//! periodic pollers that run while the dashboard is up.
//!
//! All mutable state sits behind one `std::sync::Mutex` that is never held across an
//! `.await`. Timers are tokio tasks; restarting a timer aborts the previous task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use blade_core::{
    AuthPolicy, DeviceAddress, GateDecision, LinkState, LivenessMachine, LivenessPhase,
    LivenessTransition, OutboundQueue, PolicyFailureAction, ReconcilerPhase, SeenFiles, Session,
    auth::on_policy_failure, format_elapsed,
};
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval, interval_at},
};
use tracing::{debug, info, warn};

use crate::{
    backend::{Backend, BackendError, bounded},
    config::ClientConfig,
    now_unix_ms,
    session_store::SessionStore,
    ui::{NoticeLevel, UiEvent, UiSink},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] blade_core::CoreError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no files selected")]
    NothingToSend,
    #[error("an upload is already in progress")]
    SendInProgress,
    #[error("another download is in progress")]
    Busy,
    #[error("{0} is no longer pending on the appliance")]
    FileNoLongerPending(blade_core::FileKey),
    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the auth gate left the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Dashboard,
    LoginRequired,
    /// Policy fetch failed but a session was persisted; recovering in the background.
    Reconnecting,
    ConnectionError,
}

pub(crate) struct EngineState {
    pub(crate) link: LinkState,
    pub(crate) liveness: LivenessMachine,
    pub(crate) session: Session,
    pub(crate) policy: Option<AuthPolicy>,
    pub(crate) seen: SeenFiles,
    pub(crate) reconciler: ReconcilerPhase,
    pub(crate) outbound: OutboundQueue,
    pub(crate) sending: bool,
    pub(crate) dashboard: bool,
}

#[derive(Default)]
pub(crate) struct Timers {
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    pending_poll: Option<JoinHandle<()>>,
    devices: Option<JoinHandle<()>>,
    clock: Option<JoinHandle<()>>,
    pub(crate) pass: Option<JoinHandle<()>>,
}

pub(crate) fn replace_timer(slot: &mut Option<JoinHandle<()>>, handle: JoinHandle<()>) {
    if let Some(previous) = slot.replace(handle) {
        previous.abort();
    }
}

fn cancel_timer(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

pub(crate) struct Inner {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) ui: Arc<dyn UiSink>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) config: ClientConfig,
    state: Mutex<EngineState>,
    timers: Mutex<Timers>,
}

/// Handle to a running client. Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct BladeClient {
    pub(crate) inner: Arc<Inner>,
}

impl BladeClient {
    pub fn new(
        backend: Arc<dyn Backend>,
        ui: Arc<dyn UiSink>,
        store: Arc<dyn SessionStore>,
        config: ClientConfig,
    ) -> Self {
        let state = EngineState {
            link: LinkState::Connecting,
            liveness: LivenessMachine::new(config.timings.failure_threshold),
            session: Session::default(),
            policy: None,
            seen: SeenFiles::new(),
            reconciler: ReconcilerPhase::default(),
            outbound: OutboundQueue::new(),
            sending: false,
            dashboard: false,
        };
        Self {
            inner: Arc::new(Inner {
                backend,
                ui,
                store,
                config,
                state: Mutex::new(state),
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn timers(&self) -> MutexGuard<'_, Timers> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: UiEvent) {
        self.inner.ui.emit(event);
    }

    pub(crate) fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(UiEvent::notice(level, message));
    }

    pub fn link_state(&self) -> LinkState {
        self.state().link
    }

    pub fn liveness_phase(&self) -> LivenessPhase {
        self.state().liveness.phase()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().session.authenticated
    }

    pub fn seen_count(&self) -> usize {
        self.state().seen.len()
    }

    /// Restores any persisted session, then runs the auth gate.
    pub async fn start(&self) -> GateOutcome {
        self.restore_session();
        self.resolve_auth().await
    }

    /// Runs the auth gate again, e.g. from a "retry" button on the connection error panel.
    pub async fn retry(&self) -> GateOutcome {
        self.resolve_auth().await
    }

    fn restore_session(&self) {
        match self.inner.store.load() {
            Ok(Some(record)) => {
                self.state().session = Session::resume_from(&record);
                info!(
                    manifest = record.file_manifest.len(),
                    "previous session found; will resume once the appliance answers"
                );
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "discarding unreadable session record");
                self.clear_persisted_session();
            }
        }
    }

    pub(crate) fn has_persisted_session(&self) -> bool {
        matches!(self.inner.store.load(), Ok(Some(_)))
    }

    pub(crate) fn persist_session(&self) {
        let record = {
            let state = self.state();
            state.session.to_record(state.outbound.manifest())
        };
        if let Some(record) = record
            && let Err(err) = self.inner.store.save(&record)
        {
            warn!(error = %err, "failed to persist session");
        }
    }

    fn clear_persisted_session(&self) {
        if let Err(err) = self.inner.store.clear() {
            warn!(error = %err, "failed to clear persisted session");
        }
    }

    pub(crate) fn set_link(&self, link: LinkState) {
        let changed = {
            let mut state = self.state();
            let changed = state.link != link;
            state.link = link;
            changed
        };
        if changed {
            info!(status = link.label(), "link state changed");
            self.emit(UiEvent::Link(link));
        }
    }

    /// Fetches the auth policy and routes to the dashboard, the login prompt, silent
    /// recovery or the connection error panel.
    pub async fn resolve_auth(&self) -> GateOutcome {
        if !self.is_authenticated() {
            self.set_link(LinkState::Connecting);
        }

        let timings = &self.inner.config.timings;
        match bounded(timings.policy_timeout, self.inner.backend.auth_config()).await {
            Ok(policy) => {
                let decision = policy.decide();
                self.state().policy = Some(policy);
                match decision {
                    GateDecision::Bypass => {
                        info!("appliance has auth disabled; skipping login");
                        self.state().session.authenticated = true;
                        self.set_link(LinkState::Connected);
                        self.enter_dashboard();
                        self.persist_session();
                        self.start_heartbeat();
                        GateOutcome::Dashboard
                    }
                    GateDecision::PromptLogin => {
                        info!("appliance requires login");
                        self.end_session();
                        self.set_link(LinkState::Disconnected);
                        self.emit(UiEvent::LoginRequired);
                        GateOutcome::LoginRequired
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to load auth config");
                self.set_link(LinkState::Disconnected);
                match on_policy_failure(self.has_persisted_session()) {
                    PolicyFailureAction::ResumeSilently => {
                        let begun = self.state().liveness.begin_reconnecting();
                        if begun {
                            self.start_reconnect();
                        }
                        GateOutcome::Reconnecting
                    }
                    PolicyFailureAction::ShowConnectionError => {
                        self.emit(UiEvent::ConnectionError(format!(
                            "Failed to connect to the server: {err}"
                        )));
                        GateOutcome::ConnectionError
                    }
                }
            }
        }
    }

    pub fn login(&self, username: Option<&str>, password: &str) -> Result<(), ClientError> {
        let policy = self.state().policy.clone();
        let verified = match policy {
            Some(policy) => policy.verify(username, password),
            None => Err(blade_core::CoreError::AuthNotEnabled),
        };
        if let Err(err) = verified {
            warn!(error = %err, "login rejected");
            let message = match err {
                blade_core::CoreError::AuthNotEnabled => "Authentication is not enabled",
                _ => "Invalid credentials",
            };
            self.notify(NoticeLevel::Error, message);
            return Err(err.into());
        }

        info!("login accepted");
        self.state().session.authenticated = true;
        self.set_link(LinkState::Connected);
        self.enter_dashboard();
        self.persist_session();
        self.start_heartbeat();
        Ok(())
    }

    /// Stops every timer, forgets the session and shows the login prompt again if the
    /// appliance asks for one.
    pub fn logout(&self) {
        info!("logging out");
        self.stop_all_timers();
        let login_required = {
            let mut state = self.state();
            state.session = Session::default();
            state.liveness.stop();
            state.seen.clear();
            state.outbound.clear();
            state.dashboard = false;
            state.policy.as_ref().is_some_and(|policy| policy.auth_enabled)
        };
        self.clear_persisted_session();
        self.set_link(LinkState::Disconnected);
        if login_required {
            self.emit(UiEvent::LoginRequired);
        }
    }

    /// Aborts every background task. The client can be started again afterwards.
    pub fn shutdown(&self) {
        self.stop_all_timers();
        self.state().liveness.stop();
    }

    fn stop_all_timers(&self) {
        let mut timers = self.timers();
        cancel_timer(&mut timers.heartbeat);
        cancel_timer(&mut timers.reconnect);
        cancel_timer(&mut timers.pending_poll);
        cancel_timer(&mut timers.devices);
        cancel_timer(&mut timers.clock);
        cancel_timer(&mut timers.pass);
    }

    /// Drops the in-memory and persisted session when the appliance demands a fresh login.
    fn end_session(&self) {
        {
            let mut timers = self.timers();
            cancel_timer(&mut timers.heartbeat);
            cancel_timer(&mut timers.pending_poll);
            cancel_timer(&mut timers.devices);
            cancel_timer(&mut timers.clock);
        }
        {
            let mut state = self.state();
            state.session = Session::default();
            state.liveness.stop();
            state.dashboard = false;
        }
        self.clear_persisted_session();
    }

    fn enter_dashboard(&self) {
        let first = {
            let mut state = self.state();
            state.session.start_clock(now_unix_ms());
            !std::mem::replace(&mut state.dashboard, true)
        };
        if first {
            self.emit(UiEvent::Dashboard);
        }
        self.ensure_clock();
        self.start_pending_poll();
        self.start_device_poll();
    }

    fn start_heartbeat(&self) {
        self.state().liveness.start_monitoring();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.heartbeat_loop().await });
        replace_timer(&mut self.timers().heartbeat, handle);
    }

    async fn heartbeat_loop(&self) {
        let timings = &self.inner.config.timings;
        let mut ticker = interval_at(
            Instant::now() + timings.heartbeat_period,
            timings.heartbeat_period,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let probe = bounded(timings.heartbeat_timeout, self.inner.backend.heartbeat()).await;
            if let Err(err) = &probe {
                debug!(error = %err, "heartbeat failed");
            }
            let transition = self.state().liveness.record_probe(probe.is_ok());
            if transition == LivenessTransition::Lost {
                self.enter_disconnected();
                return;
            }
        }
    }

    /// Link lost: keep the session, stop the dashboard pollers and start probing.
    fn enter_disconnected(&self) {
        info!("appliance unreachable; reconnecting in the background");
        self.set_link(LinkState::Disconnected);
        self.persist_session();
        {
            let mut timers = self.timers();
            // Dropping our own handle detaches rather than aborts the running task.
            drop(timers.heartbeat.take());
            cancel_timer(&mut timers.pending_poll);
            cancel_timer(&mut timers.devices);
        }
        self.start_reconnect();
    }

    fn start_reconnect(&self) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.reconnect_loop().await });
        replace_timer(&mut self.timers().reconnect, handle);
    }

    async fn reconnect_loop(&self) {
        let timings = &self.inner.config.timings;
        let mut ticker = interval_at(
            Instant::now() + timings.reconnect_period,
            timings.reconnect_period,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match bounded(timings.reconnect_timeout, self.inner.backend.heartbeat()).await {
                Ok(()) => {
                    let transition = self.state().liveness.record_probe(true);
                    if transition == LivenessTransition::Regained {
                        drop(self.timers().reconnect.take());
                        self.handle_reconnected().await;
                        return;
                    }
                    if !self.state().liveness.is_reconnecting() {
                        return;
                    }
                }
                Err(err) => debug!(error = %err, "reconnection attempt failed; retrying"),
            }
        }
    }

    async fn handle_reconnected(&self) {
        info!("appliance reachable again; restoring session");
        let outcome = self.resolve_auth().await;
        if outcome == GateOutcome::Dashboard {
            self.ensure_clock();
            debug!("session restored after reconnection");
        }
    }

    fn ensure_clock(&self) {
        let running = self
            .timers()
            .clock
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if !running {
            let this = self.clone();
            let handle = tokio::spawn(async move { this.clock_loop().await });
            replace_timer(&mut self.timers().clock, handle);
        }
    }

    async fn clock_loop(&self) {
        let mut ticker = interval(self.inner.config.timings.clock_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let started_at = self.state().session.started_at;
            if let Some(started_at) = started_at {
                let elapsed = now_unix_ms().saturating_sub(started_at);
                self.emit(UiEvent::SessionClock(format_elapsed(elapsed)));
            }
        }
    }

    fn start_pending_poll(&self) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.pending_poll_loop().await });
        replace_timer(&mut self.timers().pending_poll, handle);
    }

    async fn pending_poll_loop(&self) {
        let mut ticker = interval(self.inner.config.timings.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // A tick during a pass is dropped; the pass itself also refuses to overlap.
            if self.state().reconciler == ReconcilerPhase::Reconciling {
                debug!("reconciliation still running; skipping poll tick");
                continue;
            }
            let this = self.clone();
            let handle = tokio::spawn(async move {
                this.reconcile_now().await;
            });
            self.timers().pass = Some(handle);
        }
    }

    fn start_device_poll(&self) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.device_poll_loop().await });
        replace_timer(&mut self.timers().devices, handle);
    }

    async fn device_poll_loop(&self) {
        let timings = &self.inner.config.timings;
        let mut ticker = interval(timings.devices_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<Vec<DeviceAddress>> = None;
        loop {
            ticker.tick().await;
            let request = self.inner.backend.connected_devices();
            let devices = match bounded(timings.request_timeout, request).await {
                Ok(devices) => devices,
                Err(err) => {
                    debug!(error = %err, "failed to load connected devices");
                    Vec::new()
                }
            };
            if last.as_ref() != Some(&devices) {
                self.emit(UiEvent::Devices(devices.clone()));
                last = Some(devices);
            }
        }
    }
}
