use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::HavenError;
use crate::media::{LocalStream, MediaTrack};

/// An inbound call request waiting for the user to accept or decline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingSession {
    pub id: String,
    pub remote_identity: String,
}

/// What the signaling service tells a registered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingNotice {
    Incoming(IncomingSession),
    /// The caller gave up before an answer; carries the incoming session id.
    Withdrawn(String),
}

/// A confirmed peer identity plus the feed of inbound call requests for it.
pub struct Registration {
    pub identity: String,
    pub notices: mpsc::UnboundedReceiver<SignalingNotice>,
}

/// Peer signaling service: resolves identities and relays call handshakes.
///
/// `call` and `answer` resolve once the remote media stream is flowing.
#[async_trait]
pub trait SignalingService: Send + Sync {
    /// Fails with `IdentityTaken` on collision or `Signaling` when unreachable.
    async fn register_identity(&self, identity: &str) -> Result<Registration, HavenError>;

    /// Dropping the returned future before it resolves withdraws the offer.
    async fn call(
        &self,
        local_identity: &str,
        remote_identity: &str,
        local: &LocalStream,
    ) -> Result<Arc<dyn PeerConnection>, HavenError>;

    async fn answer(
        &self,
        incoming: &IncomingSession,
        local: &LocalStream,
    ) -> Result<Arc<dyn PeerConnection>, HavenError>;

    async fn decline(&self, incoming: &IncomingSession);

    async fn release_identity(&self, identity: &str);
}

/// A live media session with one remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn remote_identity(&self) -> &str;

    /// Swap the outbound video without renegotiating the connection.
    async fn replace_outbound_track(&self, track: &MediaTrack) -> Result<(), HavenError>;

    /// Resolves when either side has closed the connection.
    async fn closed(&self);

    async fn close(&self);
}
