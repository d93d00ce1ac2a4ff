//! Call lifecycle coordinator.
//!
//! Owns the local media tracks and at most one peer connection. Operations
//! that wait on the platform or the network run without holding the state
//! lock; each takes a ticket (cancellation token plus epoch) so `end()` and
//! `destroy()` can cancel it and discard a late result.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::HavenError;
use crate::events::{EventEmitter, HavenEvent};
use crate::media::{FacingMode, LocalStream, MediaConstraints, MediaDevices, MediaTrack};
use crate::signaling::{IncomingSession, PeerConnection, SignalingNotice, SignalingService};

pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallStatus {
    Idle,
    Initializing,
    Calling,
    Ringing,
    Connected,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn status_text(&self) -> &'static str {
        match self {
            CallStatus::Idle => "Not connected",
            CallStatus::Initializing => "Ready to call",
            CallStatus::Calling => "Calling...",
            CallStatus::Ringing => "Incoming call",
            CallStatus::Connected => "Connected",
            CallStatus::Ended => "Call ended",
            CallStatus::Failed => "Call failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalMediaEnabled {
    pub video: bool,
    pub audio: bool,
}

/// Snapshot of the coordinator's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub local_identity: String,
    pub remote_identity: Option<String>,
    pub status: CallStatus,
    pub local_media_enabled: LocalMediaEnabled,
    pub screen_sharing: bool,
    pub facing: FacingMode,
    pub last_error: Option<HavenError>,
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Upper bound on `call`/`answer` waiting for the remote stream.
    pub answer_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
        }
    }
}

type IncomingCallback = Arc<dyn Fn(IncomingSession) + Send + Sync>;

struct Inflight {
    id: u64,
    op: &'static str,
    cancel: CancellationToken,
}

struct Ticket {
    id: u64,
    cancel: CancellationToken,
    epoch: u64,
}

struct CallState {
    session: CallSession,
    registered: bool,
    destroyed: bool,
    local_stream: Option<LocalStream>,
    screen_track: Option<MediaTrack>,
    connection: Option<Arc<dyn PeerConnection>>,
    pending_incoming: VecDeque<IncomingSession>,
    inflight: Option<Inflight>,
    next_ticket: u64,
    /// Bumped by `end()`; results carrying an older epoch are discarded.
    epoch: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl CallState {
    fn ensure_usable(&self) -> Result<(), HavenError> {
        if self.destroyed {
            return Err(HavenError::Destroyed);
        }
        if let Some(inflight) = &self.inflight {
            return Err(HavenError::OperationPending(inflight.op));
        }
        Ok(())
    }

    fn begin(&mut self, op: &'static str) -> Ticket {
        self.next_ticket += 1;
        let cancel = CancellationToken::new();
        self.inflight = Some(Inflight {
            id: self.next_ticket,
            op,
            cancel: cancel.clone(),
        });
        Ticket {
            id: self.next_ticket,
            cancel,
            epoch: self.epoch,
        }
    }

    /// Release the in-flight slot held by `ticket`. Returns false when the
    /// session moved on while the ticket was suspended.
    fn finish(&mut self, ticket: &Ticket) -> bool {
        if self.inflight.as_ref().is_some_and(|i| i.id == ticket.id) {
            self.inflight = None;
        }
        !self.destroyed && ticket.epoch == self.epoch && !ticket.cancel.is_cancelled()
    }

    /// Keep a background task for `destroy()` to abort, dropping handles of
    /// tasks that already finished.
    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn invalid(&self, op: &'static str) -> HavenError {
        HavenError::InvalidTransition {
            from: self.session.status,
            op,
        }
    }
}

struct Inner {
    signaling: Arc<dyn SignalingService>,
    devices: Arc<dyn MediaDevices>,
    emitter: EventEmitter,
    config: CallConfig,
    state: Mutex<CallState>,
    incoming_listeners: RwLock<Vec<IncomingCallback>>,
}

/// Drives one call view: identity registration, local media, a single peer
/// session and its teardown.
pub struct CallCoordinator {
    inner: Arc<Inner>,
}

impl CallCoordinator {
    pub fn new(
        signaling: Arc<dyn SignalingService>,
        devices: Arc<dyn MediaDevices>,
        emitter: EventEmitter,
        config: CallConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                signaling,
                devices,
                emitter,
                config,
                state: Mutex::new(CallState {
                    session: CallSession {
                        local_identity: String::new(),
                        remote_identity: None,
                        status: CallStatus::Idle,
                        local_media_enabled: LocalMediaEnabled::default(),
                        screen_sharing: false,
                        facing: FacingMode::default(),
                        last_error: None,
                    },
                    registered: false,
                    destroyed: false,
                    local_stream: None,
                    screen_track: None,
                    connection: None,
                    pending_incoming: VecDeque::new(),
                    inflight: None,
                    next_ticket: 0,
                    epoch: 0,
                    tasks: Vec::new(),
                }),
                incoming_listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub async fn session(&self) -> CallSession {
        self.inner.state.lock().await.session.clone()
    }

    pub async fn status(&self) -> CallStatus {
        self.inner.state.lock().await.session.status
    }

    /// Status line for the call view. Failures read according to their cause.
    pub async fn status_text(&self) -> &'static str {
        let state = self.inner.state.lock().await;
        match (&state.session.status, &state.session.last_error) {
            (CallStatus::Failed | CallStatus::Idle, Some(err)) => err.status_text(),
            (status, _) => status.status_text(),
        }
    }

    /// Video track currently sent to the peer: the screen while sharing,
    /// otherwise the camera.
    pub async fn active_video_track(&self) -> Option<MediaTrack> {
        let state = self.inner.state.lock().await;
        state
            .screen_track
            .clone()
            .or_else(|| state.local_stream.as_ref().and_then(|s| s.video.clone()))
    }

    pub async fn pending_incoming(&self) -> Vec<IncomingSession> {
        self.inner.state.lock().await.pending_incoming.iter().cloned().collect()
    }

    /// Called for every inbound request queued for a decision.
    pub fn on_incoming_session<F>(&self, callback: F)
    where
        F: Fn(IncomingSession) + Send + Sync + 'static,
    {
        self.inner
            .incoming_listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(callback));
    }

    /// Register `local_identity` with the signaling service.
    pub async fn initialize(&self, local_identity: &str) -> Result<String, HavenError> {
        let ticket = {
            let mut state = self.inner.state.lock().await;
            state.ensure_usable()?;
            let fresh = matches!(state.session.status, CallStatus::Idle | CallStatus::Failed);
            if state.registered || !fresh {
                return Err(state.invalid("initialize"));
            }
            state.session.local_identity = local_identity.to_string();
            state.session.last_error = None;
            self.inner.set_status(&mut state, CallStatus::Initializing);
            state.begin("initialize")
        };

        tracing::info!("registering peer identity {local_identity}");
        let result = suspend(&ticket, self.inner.signaling.register_identity(local_identity)).await;

        let mut state = self.inner.state.lock().await;
        let current = state.finish(&ticket);
        match result {
            Ok(registration) if current => {
                state.registered = true;
                state.session.local_identity = registration.identity.clone();
                let pump = self.spawn_incoming_pump(registration.notices);
                state.track(pump);
                tracing::info!("peer identity {} registered", registration.identity);
                Ok(registration.identity)
            }
            Ok(registration) => {
                drop(state);
                self.inner.signaling.release_identity(&registration.identity).await;
                Err(HavenError::Cancelled)
            }
            Err(e) => {
                if current {
                    tracing::error!("identity registration failed: {e}");
                    self.inner.fail(&mut state, e.clone());
                }
                Err(e)
            }
        }
    }

    /// Open camera and/or microphone. Required before `call` or `answer`.
    pub async fn acquire_local_media(&self, video: bool, audio: bool) -> Result<(), HavenError> {
        if !video && !audio {
            return Err(HavenError::Precondition("request camera or microphone".into()));
        }
        let (ticket, facing) = {
            let mut state = self.inner.state.lock().await;
            state.ensure_usable()?;
            if matches!(
                state.session.status,
                CallStatus::Calling | CallStatus::Connected | CallStatus::Ended
            ) {
                return Err(state.invalid("acquire local media"));
            }
            (state.begin("media acquisition"), state.session.facing)
        };

        let constraints = MediaConstraints { video, audio, facing };
        let result = suspend(&ticket, self.inner.devices.user_media(constraints)).await;

        let mut state = self.inner.state.lock().await;
        if !state.finish(&ticket) {
            if let Ok(stream) = result {
                stream.stop_all();
            }
            return Err(HavenError::Cancelled);
        }
        match result {
            Ok(stream) => {
                if let Some(old) = state.local_stream.replace(stream.clone()) {
                    old.stop_all();
                }
                let enabled = LocalMediaEnabled {
                    video: stream.video.is_some(),
                    audio: stream.audio.is_some(),
                };
                state.session.local_media_enabled = enabled;
                tracing::info!(
                    "local media acquired: video={} audio={}",
                    enabled.video,
                    enabled.audio
                );
                self.inner.emitter.emit(HavenEvent::LocalMediaChanged {
                    video: enabled.video,
                    audio: enabled.audio,
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("local media unavailable: {e}");
                state.session.last_error = Some(e.clone());
                if state.session.status != CallStatus::Ringing {
                    self.inner.set_status(&mut state, CallStatus::Idle);
                }
                Err(e)
            }
        }
    }

    /// Place an outbound call.
    pub async fn call(&self, remote_identity: &str) -> Result<(), HavenError> {
        let (ticket, local_identity, stream) = {
            let mut state = self.inner.state.lock().await;
            state.ensure_usable()?;
            if !matches!(
                state.session.status,
                CallStatus::Idle | CallStatus::Initializing | CallStatus::Failed
            ) {
                return Err(state.invalid("call"));
            }
            if !state.registered {
                return Err(HavenError::Precondition("initialize before calling".into()));
            }
            let Some(stream) = state.local_stream.clone() else {
                return Err(HavenError::Precondition(
                    "acquire local media before calling".into(),
                ));
            };
            if remote_identity == state.session.local_identity {
                return Err(HavenError::Precondition("cannot call yourself".into()));
            }
            state.session.remote_identity = Some(remote_identity.to_string());
            state.session.last_error = None;
            self.inner.set_status(&mut state, CallStatus::Calling);
            (state.begin("call"), state.session.local_identity.clone(), stream)
        };

        tracing::info!("calling {remote_identity}");
        let connect = self.inner.signaling.call(&local_identity, remote_identity, &stream);
        let result = suspend(&ticket, bounded(self.inner.config.answer_timeout, connect)).await;
        self.finish_connect(&ticket, result).await
    }

    /// Accept a queued inbound request.
    pub async fn answer(&self, incoming_id: &str) -> Result<(), HavenError> {
        let (ticket, incoming, stream) = {
            let mut state = self.inner.state.lock().await;
            state.ensure_usable()?;
            if state.session.status != CallStatus::Ringing {
                return Err(state.invalid("answer"));
            }
            let Some(stream) = state.local_stream.clone() else {
                return Err(HavenError::Precondition(
                    "acquire local media before answering".into(),
                ));
            };
            let Some(pos) = state.pending_incoming.iter().position(|s| s.id == incoming_id) else {
                return Err(no_incoming(incoming_id));
            };
            let incoming = state
                .pending_incoming
                .remove(pos)
                .ok_or_else(|| no_incoming(incoming_id))?;
            state.session.remote_identity = Some(incoming.remote_identity.clone());
            state.session.last_error = None;
            (state.begin("answer"), incoming, stream)
        };

        tracing::info!("answering {}", incoming.remote_identity);
        let connect = self.inner.signaling.answer(&incoming, &stream);
        let result = suspend(&ticket, bounded(self.inner.config.answer_timeout, connect)).await;
        self.finish_connect(&ticket, result).await
    }

    /// Turn down one inbound request; the others stay queued.
    pub async fn decline(&self, incoming_id: &str) -> Result<(), HavenError> {
        let incoming = {
            let mut state = self.inner.state.lock().await;
            if state.destroyed {
                return Err(HavenError::Destroyed);
            }
            let Some(pos) = state.pending_incoming.iter().position(|s| s.id == incoming_id) else {
                return Err(no_incoming(incoming_id));
            };
            let incoming = state
                .pending_incoming
                .remove(pos)
                .ok_or_else(|| no_incoming(incoming_id))?;
            if state.pending_incoming.is_empty() && state.session.status == CallStatus::Ringing {
                self.inner.set_status(&mut state, CallStatus::Initializing);
            }
            incoming
        };
        tracing::info!("declined call from {}", incoming.remote_identity);
        self.inner
            .emitter
            .emit(HavenEvent::IncomingSessionDeclined(incoming.id.clone()));
        self.inner.signaling.decline(&incoming).await;
        Ok(())
    }

    /// Enable or disable the camera track. Returns false without a camera.
    pub async fn toggle_video(&self, enabled: bool) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(track) = state.local_stream.as_ref().and_then(|s| s.video.clone()) else {
            return false;
        };
        track.set_enabled(enabled);
        if let Some(screen) = &state.screen_track {
            screen.set_enabled(enabled);
        }
        state.session.local_media_enabled.video = enabled;
        self.emit_media(&state);
        true
    }

    /// Enable or disable the microphone track. Returns false without a microphone.
    pub async fn toggle_audio(&self, enabled: bool) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(track) = state.local_stream.as_ref().and_then(|s| s.audio.clone()) else {
            return false;
        };
        track.set_enabled(enabled);
        state.session.local_media_enabled.audio = enabled;
        self.emit_media(&state);
        true
    }

    /// Flip between front and back camera without dropping audio or the call.
    ///
    /// The new camera is opened before the old one is released, so a failure
    /// leaves the current track in place.
    pub async fn switch_camera(&self) -> Result<FacingMode, HavenError> {
        let (ticket, target, old_track, connection, sharing) = {
            let mut state = self.inner.state.lock().await;
            state.ensure_usable()?;
            let Some(old_track) = state.local_stream.as_ref().and_then(|s| s.video.clone()) else {
                return Err(HavenError::Precondition("no camera track to switch".into()));
            };
            (
                state.begin("camera switch"),
                state.session.facing.opposite(),
                old_track,
                state.connection.clone(),
                state.screen_track.is_some(),
            )
        };

        let constraints = MediaConstraints {
            video: true,
            audio: false,
            facing: target,
        };
        let result = suspend(&ticket, async {
            let stream = self.inner.devices.user_media(constraints).await?;
            if let Some(stray) = &stream.audio {
                stray.stop();
            }
            let track = stream
                .video
                .ok_or_else(|| HavenError::DeviceUnavailable(format!("{target:?} camera")))?;
            track.set_enabled(old_track.is_enabled());
            // While sharing, the screen stays outbound; the new camera is
            // picked up again when sharing stops.
            if let (Some(conn), false) = (&connection, sharing) {
                if let Err(e) = conn.replace_outbound_track(&track).await {
                    track.stop();
                    return Err(e);
                }
            }
            Ok(track)
        })
        .await;

        let mut state = self.inner.state.lock().await;
        let current = state.finish(&ticket);
        let new_track = match result {
            Ok(track) if current => track,
            Ok(track) => {
                track.stop();
                return Err(HavenError::Cancelled);
            }
            Err(e) => {
                tracing::warn!("camera switch failed, keeping current camera: {e}");
                return Err(e);
            }
        };
        if let Some(stream) = state.local_stream.as_mut() {
            stream.video = Some(new_track);
        }
        old_track.stop();
        state.session.facing = target;
        tracing::info!("switched camera to {target:?}");
        self.inner.emitter.emit(HavenEvent::CameraSwitched(target));
        Ok(target)
    }

    /// Send a display capture instead of the camera.
    pub async fn start_screen_share(&self) -> Result<(), HavenError> {
        let (ticket, connection) = {
            let mut state = self.inner.state.lock().await;
            state.ensure_usable()?;
            if state.screen_track.is_some() {
                return Ok(());
            }
            let Some(connection) = state.connection.clone() else {
                return Err(HavenError::Precondition("screen sharing needs an active call".into()));
            };
            (state.begin("screen share"), connection)
        };

        let result = suspend(&ticket, async {
            let track = self.inner.devices.display_media().await?;
            if let Err(e) = connection.replace_outbound_track(&track).await {
                track.stop();
                return Err(e);
            }
            Ok(track)
        })
        .await;

        let mut state = self.inner.state.lock().await;
        let current = state.finish(&ticket);
        let track = match result {
            Ok(track) if current => track,
            Ok(track) => {
                track.stop();
                return Err(HavenError::Cancelled);
            }
            Err(e) => {
                tracing::warn!("screen share failed: {e}");
                return Err(e);
            }
        };
        state.screen_track = Some(track.clone());
        state.session.screen_sharing = true;
        let watcher = self.spawn_share_watcher(track, state.epoch);
        state.track(watcher);
        tracing::info!("screen share started");
        self.inner.emitter.emit(HavenEvent::ScreenShareStarted);
        Ok(())
    }

    /// Go back to the camera. A no-op when not sharing.
    pub async fn stop_screen_share(&self) -> Result<(), HavenError> {
        let (ticket, camera, connection) = {
            let mut state = self.inner.state.lock().await;
            state.ensure_usable()?;
            if state.screen_track.is_none() {
                return Ok(());
            }
            (
                state.begin("screen share"),
                state.local_stream.as_ref().and_then(|s| s.video.clone()),
                state.connection.clone(),
            )
        };

        let result = match (&connection, &camera) {
            (Some(conn), Some(camera)) => {
                suspend(&ticket, conn.replace_outbound_track(camera)).await
            }
            _ => Ok(()),
        };

        let mut state = self.inner.state.lock().await;
        state.finish(&ticket);
        if let Some(screen) = state.screen_track.take() {
            state.session.screen_sharing = false;
            screen.stop();
            tracing::info!("screen share stopped");
            self.inner
                .emitter
                .emit(HavenEvent::ScreenShareEnded { revoked: false });
        }
        if let Err(e) = &result {
            tracing::warn!("restoring camera after screen share failed: {e}");
        }
        result
    }

    /// Hang up and release local media. Repeated calls do nothing.
    pub async fn end(&self) -> Result<(), HavenError> {
        let mut state = self.inner.state.lock().await;
        if state.destroyed || state.session.status == CallStatus::Ended {
            return Ok(());
        }
        let (connection, declined) = self.inner.teardown(&mut state);
        self.inner.set_status(&mut state, CallStatus::Ended);
        drop(state);

        if let Some(conn) = connection {
            conn.close().await;
        }
        self.inner.decline_all(declined).await;
        tracing::info!("call ended");
        Ok(())
    }

    /// End any session and release the peer identity. Later calls are
    /// ignored; every other operation then fails with `Destroyed`.
    pub async fn destroy(&self) {
        self.end().await.ok();
        let (identity, tasks) = {
            let mut state = self.inner.state.lock().await;
            if state.destroyed {
                tracing::warn!("call coordinator destroyed twice");
                return;
            }
            state.destroyed = true;
            let identity = state
                .registered
                .then(|| state.session.local_identity.clone());
            state.registered = false;
            (identity, std::mem::take(&mut state.tasks))
        };
        for task in tasks {
            task.abort();
        }
        if let Some(identity) = identity {
            self.inner.signaling.release_identity(&identity).await;
            tracing::info!("peer identity {identity} released");
        }
    }

    async fn finish_connect(
        &self,
        ticket: &Ticket,
        result: Result<Arc<dyn PeerConnection>, HavenError>,
    ) -> Result<(), HavenError> {
        let mut state = self.inner.state.lock().await;
        let current = state.finish(ticket);
        let declined: Vec<IncomingSession> = state.pending_incoming.drain(..).collect();

        let outcome = match result {
            Ok(conn) if current => {
                let remote = conn.remote_identity().to_string();
                state.session.remote_identity = Some(remote.clone());
                state.connection = Some(conn.clone());
                self.inner.set_status(&mut state, CallStatus::Connected);
                let watcher = self.spawn_hangup_watcher(conn, state.epoch);
                state.track(watcher);
                tracing::info!("connected to {remote}");
                Ok(())
            }
            Ok(conn) => {
                drop(state);
                tracing::debug!("discarding connection that resolved after hang-up");
                conn.close().await;
                self.inner.decline_all(declined).await;
                return Err(HavenError::Cancelled);
            }
            Err(e) => {
                if current {
                    tracing::error!("call setup failed: {e}");
                    self.inner.fail(&mut state, e.clone());
                }
                Err(e)
            }
        };
        drop(state);
        self.inner.decline_all(declined).await;
        outcome
    }

    fn emit_media(&self, state: &MutexGuard<'_, CallState>) {
        let enabled = state.session.local_media_enabled;
        self.inner.emitter.emit(HavenEvent::LocalMediaChanged {
            video: enabled.video,
            audio: enabled.audio,
        });
    }

    fn spawn_incoming_pump(
        &self,
        mut notices: mpsc::UnboundedReceiver<SignalingNotice>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match notice {
                    SignalingNotice::Incoming(session) => inner.handle_incoming(session).await,
                    SignalingNotice::Withdrawn(id) => inner.handle_withdrawn(&id).await,
                }
            }
            tracing::debug!("incoming session feed closed");
        })
    }

    fn spawn_hangup_watcher(&self, conn: Arc<dyn PeerConnection>, epoch: u64) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            conn.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.remote_closed(epoch, conn.remote_identity()).await;
            }
        })
    }

    fn spawn_share_watcher(&self, track: MediaTrack, epoch: u64) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            track.ended().await;
            if let Some(inner) = weak.upgrade() {
                inner.share_source_ended(epoch, &track).await;
            }
        })
    }
}

impl Inner {
    fn set_status(&self, state: &mut CallState, status: CallStatus) {
        if state.session.status == status {
            return;
        }
        tracing::debug!("call status {:?} -> {status:?}", state.session.status);
        state.session.status = status;
        self.emitter.emit(HavenEvent::CallStatusChanged(status));
    }

    fn fail(&self, state: &mut CallState, error: HavenError) {
        state.session.last_error = Some(error);
        self.set_status(state, CallStatus::Failed);
    }

    /// Cancel in-flight work and release media. Returns the connection to
    /// close and the inbound requests to decline once the lock is dropped.
    fn teardown(
        &self,
        state: &mut CallState,
    ) -> (Option<Arc<dyn PeerConnection>>, Vec<IncomingSession>) {
        state.epoch += 1;
        if let Some(inflight) = state.inflight.take() {
            tracing::debug!("cancelling pending {}", inflight.op);
            inflight.cancel.cancel();
        }
        if let Some(screen) = state.screen_track.take() {
            screen.stop();
        }
        if let Some(stream) = state.local_stream.take() {
            stream.stop_all();
        }
        state.session.screen_sharing = false;
        state.session.local_media_enabled = LocalMediaEnabled::default();
        (
            state.connection.take(),
            state.pending_incoming.drain(..).collect(),
        )
    }

    async fn decline_all(&self, sessions: Vec<IncomingSession>) {
        join_all(sessions.iter().map(|s| self.signaling.decline(s))).await;
    }

    async fn handle_incoming(&self, session: IncomingSession) {
        let mut state = self.state.lock().await;
        let accepting = !state.destroyed
            && state.inflight.is_none()
            && matches!(
                state.session.status,
                CallStatus::Idle | CallStatus::Initializing | CallStatus::Ringing
            );
        if !accepting {
            drop(state);
            tracing::info!("busy, declining call from {}", session.remote_identity);
            self.signaling.decline(&session).await;
            return;
        }
        state.pending_incoming.push_back(session.clone());
        self.set_status(&mut state, CallStatus::Ringing);
        drop(state);

        tracing::info!("incoming call from {}", session.remote_identity);
        self.emitter.emit(HavenEvent::IncomingSession(session.clone()));
        let listeners: Vec<IncomingCallback> = self
            .incoming_listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for listener in listeners {
            listener(session.clone());
        }
    }

    /// The caller gave up before this side decided.
    async fn handle_withdrawn(&self, incoming_id: &str) {
        let mut state = self.state.lock().await;
        let Some(pos) = state.pending_incoming.iter().position(|s| s.id == incoming_id) else {
            return;
        };
        let withdrawn = state.pending_incoming.remove(pos);
        if state.pending_incoming.is_empty() && state.session.status == CallStatus::Ringing {
            self.set_status(&mut state, CallStatus::Initializing);
        }
        drop(state);
        if let Some(session) = withdrawn {
            tracing::info!("{} stopped calling", session.remote_identity);
            self.emitter.emit(HavenEvent::IncomingSessionWithdrawn(session.id));
        }
    }

    async fn remote_closed(&self, epoch: u64, remote: &str) {
        let mut state = self.state.lock().await;
        if state.epoch != epoch || state.session.status != CallStatus::Connected {
            return;
        }
        let (_, declined) = self.teardown(&mut state);
        self.set_status(&mut state, CallStatus::Ended);
        drop(state);
        tracing::info!("{remote} hung up");
        self.emitter.emit(HavenEvent::RemoteHangup(remote.to_string()));
        self.decline_all(declined).await;
    }

    /// The display source went away on its own; fall back to the camera.
    async fn share_source_ended(&self, epoch: u64, track: &MediaTrack) {
        let (camera, connection) = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch || state.screen_track.as_ref() != Some(track) {
                return;
            }
            state.screen_track = None;
            state.session.screen_sharing = false;
            (
                state.local_stream.as_ref().and_then(|s| s.video.clone()),
                state.connection.clone(),
            )
        };
        if let (Some(conn), Some(camera)) = (connection, camera) {
            if let Err(e) = conn.replace_outbound_track(&camera).await {
                tracing::warn!("camera fallback after share revocation failed: {e}");
            }
        }
        tracing::info!("screen share revoked by the system, back to camera");
        self.emitter.emit(HavenEvent::ScreenShareEnded { revoked: true });
    }
}

/// Race `fut` against the ticket's cancellation. `fut` is polled first: a
/// result that is already available is returned so the caller can release
/// it (close a connection, stop a track). Only a still-pending future is
/// dropped on cancellation.
async fn suspend<T, F>(ticket: &Ticket, fut: F) -> Result<T, HavenError>
where
    F: Future<Output = Result<T, HavenError>>,
{
    tokio::select! {
        biased;
        result = fut => result,
        _ = ticket.cancel.cancelled() => Err(HavenError::Cancelled),
    }
}

fn no_incoming(incoming_id: &str) -> HavenError {
    HavenError::Precondition(format!("no incoming session {incoming_id}"))
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, HavenError>
where
    F: Future<Output = Result<T, HavenError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| HavenError::Timeout("remote stream"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackHub, SyntheticDevices};
    use crate::media::TrackSource;
    use std::sync::Mutex as StdMutex;

    struct Peer {
        call: Arc<CallCoordinator>,
        devices: Arc<SyntheticDevices>,
        events: Arc<StdMutex<Vec<HavenEvent>>>,
    }

    impl Peer {
        fn saw(&self, wanted: &HavenEvent) -> usize {
            self.events.lock().unwrap().iter().filter(|e| *e == wanted).count()
        }
    }

    fn peer_with(hub: &Arc<LoopbackHub>, config: CallConfig) -> Peer {
        let devices = Arc::new(SyntheticDevices::new());
        let emitter = EventEmitter::new();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        emitter.add_listener(Arc::new(move |e: HavenEvent| sink.lock().unwrap().push(e)));
        let call = CallCoordinator::new(hub.clone(), devices.clone(), emitter, config);
        Peer {
            call: Arc::new(call),
            devices,
            events,
        }
    }

    async fn ready(hub: &Arc<LoopbackHub>, identity: &str) -> Peer {
        let p = peer_with(hub, CallConfig::default());
        p.call.initialize(identity).await.unwrap();
        p.call.acquire_local_media(true, true).await.unwrap();
        p
    }

    async fn next_incoming(p: &Peer) -> IncomingSession {
        for _ in 0..200 {
            if let Some(s) = p.call.pending_incoming().await.into_iter().next() {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no incoming session arrived");
    }

    async fn wait_for_status(p: &Peer, status: CallStatus) {
        for _ in 0..200 {
            if p.call.status().await == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("status never became {status:?}");
    }

    fn place_call(p: &Peer, remote: &str) -> JoinHandle<Result<(), HavenError>> {
        let call = p.call.clone();
        let remote = remote.to_string();
        tokio::spawn(async move { call.call(&remote).await })
    }

    async fn connected_pair(hub: &Arc<LoopbackHub>) -> (Peer, Peer) {
        let a = ready(hub, "user1").await;
        let b = ready(hub, "user2").await;
        let pending = place_call(&a, "user2");
        let incoming = next_incoming(&b).await;
        b.call.answer(&incoming.id).await.unwrap();
        pending.await.unwrap().unwrap();
        (a, b)
    }

    fn outbound_of(hub: &LoopbackHub, identity: &str) -> Option<String> {
        hub.connections_of(identity).last().and_then(|c| c.outbound_video_track())
    }

    #[tokio::test]
    async fn call_before_media_is_rejected() {
        let hub = Arc::new(LoopbackHub::new());
        let _callee = ready(&hub, "user2").await;
        let a = peer_with(&hub, CallConfig::default());
        assert_eq!(a.call.initialize("user1").await.unwrap(), "user1");

        let err = a.call.call("user2").await.unwrap_err();
        assert!(matches!(err, HavenError::Precondition(_)));
        assert_eq!(a.call.status().await, CallStatus::Initializing);
    }

    #[tokio::test]
    async fn call_and_answer_connect_both_sides() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, b) = connected_pair(&hub).await;

        let sa = a.call.session().await;
        assert_eq!(sa.status, CallStatus::Connected);
        assert_eq!(sa.remote_identity.as_deref(), Some("user2"));
        assert_eq!(sa.local_media_enabled, LocalMediaEnabled { video: true, audio: true });
        assert_eq!(b.call.session().await.remote_identity.as_deref(), Some("user1"));
        assert_eq!(a.call.status_text().await, "Connected");
    }

    #[tokio::test]
    async fn connected_rejects_call_and_answer() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, b) = connected_pair(&hub).await;

        assert_eq!(
            a.call.call("user2").await,
            Err(HavenError::InvalidTransition { from: CallStatus::Connected, op: "call" })
        );
        assert_eq!(
            b.call.answer("anything").await,
            Err(HavenError::InvalidTransition { from: CallStatus::Connected, op: "answer" })
        );
        assert_eq!(a.call.status().await, CallStatus::Connected);
    }

    #[tokio::test]
    async fn end_is_idempotent_and_hangs_up_the_peer() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, b) = connected_pair(&hub).await;
        let camera = a.call.active_video_track().await.unwrap();

        a.call.end().await.unwrap();
        a.call.end().await.unwrap();

        assert_eq!(a.call.status().await, CallStatus::Ended);
        assert!(!camera.is_live());
        assert_eq!(a.saw(&HavenEvent::CallStatusChanged(CallStatus::Ended)), 1);

        wait_for_status(&b, CallStatus::Ended).await;
        assert_eq!(b.saw(&HavenEvent::RemoteHangup("user1".into())), 1);
        assert!(b.call.active_video_track().await.is_none());
    }

    #[tokio::test]
    async fn permission_denied_returns_to_idle() {
        let hub = Arc::new(LoopbackHub::new());
        let a = peer_with(&hub, CallConfig::default());
        a.call.initialize("user1").await.unwrap();
        a.devices.deny_permission(true);

        let err = a.call.acquire_local_media(true, true).await.unwrap_err();
        assert!(matches!(err, HavenError::PermissionDenied(_)));
        assert_eq!(a.call.status().await, CallStatus::Idle);
        assert_eq!(a.call.status_text().await, err.status_text());
    }

    #[tokio::test]
    async fn identity_collision_fails_initialization() {
        let hub = Arc::new(LoopbackHub::new());
        let _first = ready(&hub, "user1").await;
        let dup = peer_with(&hub, CallConfig::default());

        let err = dup.call.initialize("user1").await.unwrap_err();
        assert_eq!(err, HavenError::IdentityTaken("user1".into()));
        assert_eq!(dup.call.status().await, CallStatus::Failed);
    }

    #[tokio::test]
    async fn unreachable_signaling_can_be_retried() {
        let hub = Arc::new(LoopbackHub::new());
        let a = peer_with(&hub, CallConfig::default());
        hub.set_offline(true);
        assert!(matches!(a.call.initialize("user1").await, Err(HavenError::Signaling(_))));
        assert_eq!(a.call.status_text().await, "Connection failed. Please retry.");

        hub.set_offline(false);
        a.call.initialize("user1").await.unwrap();
        assert_eq!(a.call.status().await, CallStatus::Initializing);
    }

    #[tokio::test]
    async fn toggles_need_a_local_stream() {
        let hub = Arc::new(LoopbackHub::new());
        let a = peer_with(&hub, CallConfig::default());
        assert!(!a.call.toggle_video(false).await);
        assert!(!a.call.toggle_audio(false).await);

        a.call.initialize("user1").await.unwrap();
        a.call.acquire_local_media(true, true).await.unwrap();
        assert!(a.call.toggle_audio(false).await);
        assert!(a.call.toggle_video(false).await);

        let session = a.call.session().await;
        assert_eq!(session.local_media_enabled, LocalMediaEnabled { video: false, audio: false });
        assert!(!a.call.active_video_track().await.unwrap().is_enabled());
    }

    #[tokio::test]
    async fn failed_camera_switch_keeps_current_track() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, _b) = connected_pair(&hub).await;
        a.call.toggle_video(false).await;
        let before = a.call.active_video_track().await.unwrap();
        let session_before = a.call.session().await;
        a.devices.remove_camera(FacingMode::Environment);

        let err = a.call.switch_camera().await.unwrap_err();
        assert!(matches!(err, HavenError::DeviceUnavailable(_)));

        let after = a.call.active_video_track().await.unwrap();
        assert_eq!(after, before);
        assert!(after.is_live());
        assert_eq!(a.call.session().await, session_before);
        assert_eq!(outbound_of(&hub, "user1").as_deref(), Some(before.id()));
    }

    #[tokio::test]
    async fn rejected_track_replacement_keeps_current_camera() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, _b) = connected_pair(&hub).await;
        let old = a.call.active_video_track().await.unwrap();
        let conn = hub.connections_of("user1").pop().unwrap();
        conn.set_fail_replace(true);

        assert!(matches!(a.call.switch_camera().await, Err(HavenError::Signaling(_))));

        let opened = a
            .devices
            .issued_tracks()
            .into_iter()
            .filter(|t| t.source() == TrackSource::Camera && *t != old)
            .collect::<Vec<_>>();
        assert_eq!(opened.len(), 1);
        assert!(!opened[0].is_live());
        assert!(old.is_live());
        assert_eq!(a.call.active_video_track().await, Some(old.clone()));
        assert_eq!(conn.outbound_video_track().as_deref(), Some(old.id()));
        assert_eq!(a.call.session().await.facing, FacingMode::User);
        assert_eq!(a.call.status().await, CallStatus::Connected);
    }

    #[tokio::test]
    async fn camera_switch_replaces_outbound_video_only() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, _b) = connected_pair(&hub).await;
        let old = a.call.active_video_track().await.unwrap();
        let mic = a
            .devices
            .issued_tracks()
            .into_iter()
            .find(|t| t.source() == TrackSource::Microphone)
            .unwrap();

        assert_eq!(a.call.switch_camera().await.unwrap(), FacingMode::Environment);

        let new = a.call.active_video_track().await.unwrap();
        assert_ne!(new, old);
        assert!(!old.is_live());
        assert!(mic.is_live());
        assert_eq!(outbound_of(&hub, "user1").as_deref(), Some(new.id()));
        assert_eq!(a.call.status().await, CallStatus::Connected);
        assert_eq!(a.call.session().await.facing, FacingMode::Environment);
    }

    #[tokio::test]
    async fn revoked_screen_share_falls_back_to_camera() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, _b) = connected_pair(&hub).await;
        let camera = a.call.active_video_track().await.unwrap();

        a.call.start_screen_share().await.unwrap();
        let screen = a.call.active_video_track().await.unwrap();
        assert_eq!(screen.source(), TrackSource::ScreenShare);
        assert_eq!(outbound_of(&hub, "user1").as_deref(), Some(screen.id()));

        assert!(a.devices.revoke_screen_share());
        for _ in 0..200 {
            if a.saw(&HavenEvent::ScreenShareEnded { revoked: true }) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!a.call.session().await.screen_sharing);
        assert_eq!(a.call.status().await, CallStatus::Connected);
        assert_eq!(outbound_of(&hub, "user1").as_deref(), Some(camera.id()));
        assert_eq!(a.saw(&HavenEvent::ScreenShareEnded { revoked: true }), 1);
    }

    #[tokio::test]
    async fn stopping_screen_share_restores_camera() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, _b) = connected_pair(&hub).await;
        let camera = a.call.active_video_track().await.unwrap();

        a.call.start_screen_share().await.unwrap();
        a.call.stop_screen_share().await.unwrap();
        a.call.stop_screen_share().await.unwrap();

        assert_eq!(outbound_of(&hub, "user1").as_deref(), Some(camera.id()));
        assert_eq!(a.saw(&HavenEvent::ScreenShareEnded { revoked: false }), 1);
        assert_eq!(a.saw(&HavenEvent::ScreenShareEnded { revoked: true }), 0);
    }

    #[tokio::test]
    async fn denied_display_capture_keeps_camera_outbound() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, _b) = connected_pair(&hub).await;
        let camera = a.call.active_video_track().await.unwrap();
        a.devices.deny_display(true);

        let err = a.call.start_screen_share().await.unwrap_err();
        assert!(matches!(err, HavenError::PermissionDenied(_)));

        assert!(!a.call.session().await.screen_sharing);
        assert_eq!(a.call.active_video_track().await, Some(camera.clone()));
        assert_eq!(outbound_of(&hub, "user1").as_deref(), Some(camera.id()));
        assert_eq!(a.saw(&HavenEvent::ScreenShareStarted), 0);
    }

    #[tokio::test]
    async fn finished_watchers_are_not_kept() {
        let hub = Arc::new(LoopbackHub::new());
        let (a, _b) = connected_pair(&hub).await;

        for _ in 0..5 {
            a.call.start_screen_share().await.unwrap();
            a.call.stop_screen_share().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        a.call.start_screen_share().await.unwrap();

        // Incoming pump, hangup watcher and the live share watcher.
        assert_eq!(a.call.inner.state.lock().await.tasks.len(), 3);
    }

    #[tokio::test]
    async fn screen_share_needs_a_call() {
        let hub = Arc::new(LoopbackHub::new());
        let a = ready(&hub, "user1").await;
        assert!(matches!(
            a.call.start_screen_share().await,
            Err(HavenError::Precondition(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out() {
        let hub = Arc::new(LoopbackHub::new());
        let _b = ready(&hub, "user2").await;
        let a = peer_with(
            &hub,
            CallConfig {
                answer_timeout: Duration::from_secs(5),
            },
        );
        a.call.initialize("user1").await.unwrap();
        a.call.acquire_local_media(true, false).await.unwrap();

        let err = a.call.call("user2").await.unwrap_err();
        assert_eq!(err, HavenError::Timeout("remote stream"));
        assert_eq!(a.call.status().await, CallStatus::Failed);
        assert_eq!(a.call.status_text().await, err.status_text());
    }

    #[tokio::test]
    async fn second_call_while_pending_is_rejected() {
        let hub = Arc::new(LoopbackHub::new());
        let a = ready(&hub, "user1").await;
        let b = ready(&hub, "user2").await;
        let pending = place_call(&a, "user2");
        next_incoming(&b).await;

        assert_eq!(a.call.call("user2").await, Err(HavenError::OperationPending("call")));

        a.call.end().await.unwrap();
        assert_eq!(pending.await.unwrap(), Err(HavenError::Cancelled));
    }

    #[tokio::test]
    async fn ending_pending_call_withdraws_the_offer() {
        let hub = Arc::new(LoopbackHub::new());
        let a = ready(&hub, "user1").await;
        let b = ready(&hub, "user2").await;
        let pending = place_call(&a, "user2");
        let incoming = next_incoming(&b).await;

        a.call.end().await.unwrap();
        assert_eq!(pending.await.unwrap(), Err(HavenError::Cancelled));

        wait_for_status(&b, CallStatus::Initializing).await;
        assert!(b.call.pending_incoming().await.is_empty());
        assert_eq!(b.saw(&HavenEvent::IncomingSessionWithdrawn(incoming.id.clone())), 1);
        assert_eq!(
            b.call.answer(&incoming.id).await,
            Err(HavenError::InvalidTransition { from: CallStatus::Initializing, op: "answer" })
        );
        assert_eq!(a.call.status().await, CallStatus::Ended);
        assert!(hub.connections_of("user1").is_empty());
    }

    #[tokio::test]
    async fn hanging_up_right_after_answer_ends_both_sides() {
        let hub = Arc::new(LoopbackHub::new());
        let a = ready(&hub, "user1").await;
        let b = ready(&hub, "user2").await;
        let pending = place_call(&a, "user2");
        let incoming = next_incoming(&b).await;

        b.call.answer(&incoming.id).await.unwrap();
        a.call.end().await.unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Ok(()) | Err(HavenError::Cancelled)), "{result:?}");
        wait_for_status(&b, CallStatus::Ended).await;
        assert_eq!(b.saw(&HavenEvent::RemoteHangup("user1".into())), 1);
        assert!(hub.connections_of("user1").iter().all(|c| c.is_closed()));
        assert_eq!(a.call.status().await, CallStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_caller_stops_the_ringing() {
        let hub = Arc::new(LoopbackHub::new());
        let b = ready(&hub, "user2").await;
        let a = peer_with(
            &hub,
            CallConfig {
                answer_timeout: Duration::from_secs(5),
            },
        );
        a.call.initialize("user1").await.unwrap();
        a.call.acquire_local_media(true, true).await.unwrap();

        assert_eq!(a.call.call("user2").await, Err(HavenError::Timeout("remote stream")));
        wait_for_status(&b, CallStatus::Initializing).await;
        assert!(b.call.pending_incoming().await.is_empty());

        // The callee is free for the next caller.
        let retry = place_call(&a, "user2");
        let incoming = next_incoming(&b).await;
        b.call.answer(&incoming.id).await.unwrap();
        retry.await.unwrap().unwrap();
        assert_eq!(b.call.status().await, CallStatus::Connected);
    }

    #[tokio::test]
    async fn declining_one_incoming_keeps_the_others() {
        let hub = Arc::new(LoopbackHub::new());
        let a = ready(&hub, "user1").await;
        let c = ready(&hub, "user3").await;
        let b = ready(&hub, "user2").await;
        let notified = Arc::new(StdMutex::new(Vec::new()));
        let sink = notified.clone();
        b.call
            .on_incoming_session(move |s| sink.lock().unwrap().push(s.remote_identity));

        let from_a = place_call(&a, "user2");
        next_incoming(&b).await;
        let from_c = place_call(&c, "user2");
        for _ in 0..200 {
            if b.call.pending_incoming().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queued = b.call.pending_incoming().await;
        assert_eq!(queued.len(), 2);
        assert_eq!(b.call.status().await, CallStatus::Ringing);

        b.call.decline(&queued[0].id).await.unwrap();
        assert_eq!(b.call.pending_incoming().await, vec![queued[1].clone()]);
        assert_eq!(b.call.status().await, CallStatus::Ringing);
        assert!(matches!(from_a.await.unwrap(), Err(HavenError::Signaling(_))));
        assert_eq!(a.call.status().await, CallStatus::Failed);

        b.call.answer(&queued[1].id).await.unwrap();
        from_c.await.unwrap().unwrap();
        assert_eq!(b.call.session().await.remote_identity.as_deref(), Some("user3"));
        assert_eq!(*notified.lock().unwrap(), vec!["user1".to_string(), "user3".to_string()]);
    }

    #[tokio::test]
    async fn busy_peer_declines_new_incoming() {
        let hub = Arc::new(LoopbackHub::new());
        let (_a, b) = connected_pair(&hub).await;
        let c = ready(&hub, "user3").await;

        assert!(matches!(c.call.call("user2").await, Err(HavenError::Signaling(_))));
        assert!(b.call.pending_incoming().await.is_empty());
        assert_eq!(b.call.status().await, CallStatus::Connected);
    }

    #[tokio::test]
    async fn destroy_releases_identity_once() {
        let hub = Arc::new(LoopbackHub::new());
        let a = ready(&hub, "user1").await;
        let camera = a.call.active_video_track().await.unwrap();

        a.call.destroy().await;
        a.call.destroy().await;

        assert!(!hub.is_registered("user1"));
        assert!(!camera.is_live());
        assert_eq!(a.call.call("user2").await, Err(HavenError::Destroyed));
        assert_eq!(a.call.end().await, Ok(()));

        // The identity is free again for a new call view.
        let again = peer_with(&hub, CallConfig::default());
        again.call.initialize("user1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_cancels_pending_media_request() {
        let hub = Arc::new(LoopbackHub::new());
        let a = peer_with(&hub, CallConfig::default());
        a.call.initialize("user1").await.unwrap();
        a.devices.set_delay(Duration::from_secs(10));

        let call = a.call.clone();
        let pending = tokio::spawn(async move { call.acquire_local_media(true, true).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        a.call.destroy().await;

        assert_eq!(pending.await.unwrap(), Err(HavenError::Cancelled));
        assert!(a.devices.issued_tracks().is_empty());
        assert_eq!(a.call.session().await.local_media_enabled, LocalMediaEnabled::default());
    }
}
