use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::errors::HavenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenShare,
}

/// Which way the camera points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// Handle to a captured media track. Clones share the same underlying track.
///
/// A track ends either when the coordinator stops it or when its source goes
/// away (device unplugged, user stopped sharing from the OS).
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                source,
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute without renegotiating.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !*self.inner.ended.borrow()
    }

    /// Release the capture device. Idempotent.
    pub fn stop(&self) {
        self.inner.ended.send_if_modified(|ended| !std::mem::replace(ended, true));
    }

    /// Resolves once the track has ended.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        // The sender lives in `self`, so this only errors if it was dropped.
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

/// Camera and microphone captured for a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalStream {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
}

impl LocalStream {
    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub facing: FacingMode,
}

/// Camera, microphone and display capture provided by the platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fails with `PermissionDenied` or `DeviceUnavailable`.
    async fn user_media(&self, constraints: MediaConstraints) -> Result<LocalStream, HavenError>;

    async fn display_media(&self) -> Result<MediaTrack, HavenError>;
}
