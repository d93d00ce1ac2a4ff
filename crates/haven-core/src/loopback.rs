//! In-process signaling hub and scriptable media devices.
//!
//! Lets several coordinators in one process call each other without a
//! network. The CLI uses it for its demo session and the tests use it to drive
//! every lifecycle path, including failures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::errors::HavenError;
use crate::media::{
    FacingMode, LocalStream, MediaConstraints, MediaDevices, MediaTrack, TrackKind, TrackSource,
};
use crate::signaling::{
    IncomingSession, PeerConnection, Registration, SignalingNotice, SignalingService,
};

type Reply = oneshot::Sender<Result<Arc<LoopbackConnection>, HavenError>>;

struct Offer {
    caller: String,
    callee: String,
    caller_video: Option<String>,
    reply: Reply,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<String, mpsc::UnboundedSender<SignalingNotice>>,
    offers: HashMap<String, Offer>,
    connections: Vec<Arc<LoopbackConnection>>,
    offline: bool,
}

#[derive(Default)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every registration and call attempt fail as if unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.lock().peers.contains_key(identity)
    }

    /// Connection ends owned by `identity`, oldest first.
    pub fn connections_of(&self, identity: &str) -> Vec<Arc<LoopbackConnection>> {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.local == identity)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn unreachable() -> HavenError {
        HavenError::Signaling("signaling service unreachable".into())
    }
}

/// Withdraws an offer nobody resolved once the caller stops waiting for it.
struct PendingOffer<'a> {
    hub: &'a LoopbackHub,
    id: String,
}

impl Drop for PendingOffer<'_> {
    fn drop(&mut self) {
        let mut state = self.hub.lock();
        let Some(offer) = state.offers.remove(&self.id) else {
            return;
        };
        tracing::debug!("loopback: {} withdrew call to {}", offer.caller, offer.callee);
        if let Some(callee) = state.peers.get(&offer.callee) {
            let _ = callee.send(SignalingNotice::Withdrawn(self.id.clone()));
        }
    }
}

#[async_trait]
impl SignalingService for LoopbackHub {
    async fn register_identity(&self, identity: &str) -> Result<Registration, HavenError> {
        let mut state = self.lock();
        if state.offline {
            return Err(Self::unreachable());
        }
        if state.peers.get(identity).is_some_and(|tx| !tx.is_closed()) {
            return Err(HavenError::IdentityTaken(identity.to_string()));
        }
        let (tx, notices) = mpsc::unbounded_channel();
        state.peers.insert(identity.to_string(), tx);
        tracing::debug!("loopback: registered {identity}");
        Ok(Registration {
            identity: identity.to_string(),
            notices,
        })
    }

    async fn call(
        &self,
        local_identity: &str,
        remote_identity: &str,
        local: &LocalStream,
    ) -> Result<Arc<dyn PeerConnection>, HavenError> {
        let (reply, response) = oneshot::channel();
        let id = Uuid::new_v4().to_string();
        {
            let mut state = self.lock();
            if state.offline {
                return Err(Self::unreachable());
            }
            let Some(callee) = state.peers.get(remote_identity).cloned() else {
                return Err(HavenError::Signaling(format!("{remote_identity} is not available")));
            };
            let incoming = IncomingSession {
                id: id.clone(),
                remote_identity: local_identity.to_string(),
            };
            if callee.send(SignalingNotice::Incoming(incoming)).is_err() {
                return Err(HavenError::Signaling(format!("{remote_identity} is not available")));
            }
            state.offers.insert(
                id.clone(),
                Offer {
                    caller: local_identity.to_string(),
                    callee: remote_identity.to_string(),
                    caller_video: local.video.as_ref().map(|t| t.id().to_string()),
                    reply,
                },
            );
        }
        let _pending = PendingOffer { hub: self, id };
        match response.await {
            Ok(result) => result.map(|conn| conn as Arc<dyn PeerConnection>),
            Err(_) => Err(HavenError::Signaling("call abandoned".into())),
        }
    }

    async fn answer(
        &self,
        incoming: &IncomingSession,
        local: &LocalStream,
    ) -> Result<Arc<dyn PeerConnection>, HavenError> {
        let mut state = self.lock();
        if state.offline {
            return Err(Self::unreachable());
        }
        let Some(offer) = state.offers.remove(&incoming.id) else {
            return Err(HavenError::Signaling("call no longer available".into()));
        };
        let (caller_end, callee_end) = LoopbackConnection::pair(
            &offer.caller,
            offer.caller_video,
            &offer.callee,
            local.video.as_ref().map(|t| t.id().to_string()),
        );
        if offer.reply.send(Ok(caller_end.clone())).is_err() {
            return Err(HavenError::Signaling(format!("{} hung up", offer.caller)));
        }
        state.connections.push(caller_end);
        state.connections.push(callee_end.clone());
        Ok(callee_end)
    }

    async fn decline(&self, incoming: &IncomingSession) {
        if let Some(offer) = self.lock().offers.remove(&incoming.id) {
            let _ = offer
                .reply
                .send(Err(HavenError::Signaling(format!("{} declined", offer.callee))));
        }
    }

    async fn release_identity(&self, identity: &str) {
        let mut state = self.lock();
        state.peers.remove(identity);
        let stale: Vec<String> = state
            .offers
            .iter()
            .filter(|(_, o)| o.callee == identity)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(offer) = state.offers.remove(&id) {
                let _ = offer
                    .reply
                    .send(Err(HavenError::Signaling(format!("{identity} went offline"))));
            }
        }
        tracing::debug!("loopback: released {identity}");
    }
}

/// One end of an in-process peer connection.
pub struct LoopbackConnection {
    local: String,
    remote: String,
    link: Arc<watch::Sender<bool>>,
    outbound_video: Mutex<Option<String>>,
    fail_replace: AtomicBool,
}

impl LoopbackConnection {
    fn pair(
        a: &str,
        a_video: Option<String>,
        b: &str,
        b_video: Option<String>,
    ) -> (Arc<Self>, Arc<Self>) {
        let (link, _) = watch::channel(false);
        let link = Arc::new(link);
        let end = |local: &str, remote: &str, video: Option<String>| {
            Arc::new(Self {
                local: local.to_string(),
                remote: remote.to_string(),
                link: link.clone(),
                outbound_video: Mutex::new(video),
                fail_replace: AtomicBool::new(false),
            })
        };
        (end(a, b, a_video), end(b, a, b_video))
    }

    pub fn local_identity(&self) -> &str {
        &self.local
    }

    /// Id of the video track currently sent to the remote side.
    pub fn outbound_video_track(&self) -> Option<String> {
        self.outbound_video
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn set_fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        *self.link.borrow()
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    fn remote_identity(&self) -> &str {
        &self.remote
    }

    async fn replace_outbound_track(&self, track: &MediaTrack) -> Result<(), HavenError> {
        if self.is_closed() {
            return Err(HavenError::Signaling("connection closed".into()));
        }
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(HavenError::Signaling("track replacement rejected".into()));
        }
        *self.outbound_video.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(track.id().to_string());
        Ok(())
    }

    async fn closed(&self) {
        let mut rx = self.link.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.link.send_replace(true);
    }
}

#[derive(Default)]
struct DeviceState {
    permission_denied: bool,
    display_denied: bool,
    missing_cameras: HashSet<FacingMode>,
    delay: Duration,
    last_display: Option<MediaTrack>,
    issued: Vec<MediaTrack>,
}

/// Media devices whose behaviour can be scripted: refuse permission, unplug a
/// camera, slow down acquisition or revoke a screen share.
#[derive(Default)]
pub struct SyntheticDevices {
    state: Mutex<DeviceState>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_permission(&self, denied: bool) {
        self.lock().permission_denied = denied;
    }

    pub fn deny_display(&self, denied: bool) {
        self.lock().display_denied = denied;
    }

    pub fn remove_camera(&self, facing: FacingMode) {
        self.lock().missing_cameras.insert(facing);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Simulate the user pressing "stop sharing" in the OS chrome.
    pub fn revoke_screen_share(&self) -> bool {
        match self.lock().last_display.take() {
            Some(track) => {
                track.stop();
                true
            }
            None => false,
        }
    }

    /// Every track handed out so far.
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.lock().issued.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<LocalStream, HavenError> {
        let delay = self.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.permission_denied {
            return Err(HavenError::PermissionDenied("camera and microphone".into()));
        }
        if constraints.video && state.missing_cameras.contains(&constraints.facing) {
            let missing = format!("{:?} camera", constraints.facing);
            return Err(HavenError::DeviceUnavailable(missing));
        }
        let stream = LocalStream {
            audio: constraints
                .audio
                .then(|| MediaTrack::new(TrackKind::Audio, TrackSource::Microphone)),
            video: constraints
                .video
                .then(|| MediaTrack::new(TrackKind::Video, TrackSource::Camera)),
        };
        state.issued.extend(stream.tracks().cloned());
        Ok(stream)
    }

    async fn display_media(&self) -> Result<MediaTrack, HavenError> {
        let mut state = self.lock();
        if state.display_denied {
            return Err(HavenError::PermissionDenied("screen capture".into()));
        }
        let track = MediaTrack::new(TrackKind::Video, TrackSource::ScreenShare);
        state.last_display = Some(track.clone());
        state.issued.push(track.clone());
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_incoming(reg: &mut Registration) -> IncomingSession {
        match reg.notices.recv().await {
            Some(SignalingNotice::Incoming(session)) => session,
            other => panic!("expected an incoming session, got {other:?}"),
        }
    }

    fn stream() -> LocalStream {
        LocalStream {
            audio: Some(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone)),
            video: Some(MediaTrack::new(TrackKind::Video, TrackSource::Camera)),
        }
    }

    #[tokio::test]
    async fn duplicate_identity_is_rejected() {
        let hub = LoopbackHub::new();
        let _reg = hub.register_identity("user1").await.unwrap();
        assert_eq!(
            hub.register_identity("user1").await.err(),
            Some(HavenError::IdentityTaken("user1".into()))
        );
    }

    #[tokio::test]
    async fn call_and_answer_link_both_ends() {
        let hub = Arc::new(LoopbackHub::new());
        let _a = hub.register_identity("a").await.unwrap();
        let mut b = hub.register_identity("b").await.unwrap();

        let caller_stream = stream();
        let h = hub.clone();
        let s = caller_stream.clone();
        let caller = tokio::spawn(async move { h.call("a", "b", &s).await });

        let incoming = next_incoming(&mut b).await;
        assert_eq!(incoming.remote_identity, "a");
        let callee = hub.answer(&incoming, &stream()).await.unwrap();
        let caller = caller.await.unwrap().unwrap();

        assert_eq!(caller.remote_identity(), "b");
        assert_eq!(callee.remote_identity(), "a");
        let a_end = &hub.connections_of("a")[0];
        assert_eq!(
            a_end.outbound_video_track().as_deref(),
            caller_stream.video.as_ref().map(|t| t.id())
        );

        callee.close().await;
        caller.closed().await;
    }

    #[tokio::test]
    async fn declined_call_fails_for_caller() {
        let hub = Arc::new(LoopbackHub::new());
        let _a = hub.register_identity("a").await.unwrap();
        let mut b = hub.register_identity("b").await.unwrap();

        let h = hub.clone();
        let caller = tokio::spawn(async move { h.call("a", "b", &LocalStream::default()).await });
        let incoming = next_incoming(&mut b).await;
        hub.decline(&incoming).await;

        assert!(matches!(caller.await.unwrap(), Err(HavenError::Signaling(_))));
        assert!(hub.lock().offers.is_empty());
    }

    #[tokio::test]
    async fn abandoned_call_is_withdrawn() {
        let hub = Arc::new(LoopbackHub::new());
        let _a = hub.register_identity("a").await.unwrap();
        let mut b = hub.register_identity("b").await.unwrap();

        let h = hub.clone();
        let caller = tokio::spawn(async move { h.call("a", "b", &LocalStream::default()).await });
        let incoming = next_incoming(&mut b).await;
        caller.abort();
        let _ = caller.await;

        assert_eq!(
            b.notices.recv().await,
            Some(SignalingNotice::Withdrawn(incoming.id.clone()))
        );
        assert!(hub.lock().offers.is_empty());
        assert!(matches!(
            hub.answer(&incoming, &stream()).await,
            Err(HavenError::Signaling(_))
        ));
    }

    #[tokio::test]
    async fn offline_hub_refuses_registration() {
        let hub = LoopbackHub::new();
        hub.set_offline(true);
        assert!(matches!(hub.register_identity("a").await, Err(HavenError::Signaling(_))));
    }

    #[tokio::test]
    async fn devices_follow_script() {
        let devices = SyntheticDevices::new();
        let constraints = MediaConstraints {
            video: true,
            audio: true,
            facing: FacingMode::Environment,
        };
        devices.remove_camera(FacingMode::Environment);
        assert!(matches!(
            devices.user_media(constraints).await,
            Err(HavenError::DeviceUnavailable(_))
        ));

        let share = devices.display_media().await.unwrap();
        assert!(devices.revoke_screen_share());
        assert!(!share.is_live());
        assert!(!devices.revoke_screen_share());
    }
}
