use std::sync::{Arc, RwLock};

use crate::call::CallStatus;
use crate::media::FacingMode;
use crate::meter::MeteredFeature;
use crate::signaling::IncomingSession;
use crate::wallet::Paise;

/// Events emitted by the core to UI listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum HavenEvent {
    CallStatusChanged(CallStatus),
    IncomingSession(IncomingSession),
    IncomingSessionDeclined(String), // incoming session id
    IncomingSessionWithdrawn(String), // incoming session id
    LocalMediaChanged { video: bool, audio: bool },
    CameraSwitched(FacingMode),
    ScreenShareStarted,
    ScreenShareEnded { revoked: bool },
    RemoteHangup(String), // remote identity
    Meter(MeterEvent),
    WalletBalanceChanged(Paise),
    PersistenceWarning { key: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterEvent {
    Started { feature: MeteredFeature, free_seconds: u64 },
    TrialExhausted { feature: MeteredFeature },
    Debited { feature: MeteredFeature, amount: Paise, balance: Paise },
    Halted { feature: MeteredFeature, reason: HaltReason },
    Resumed { feature: MeteredFeature },
    Stopped { feature: MeteredFeature },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    InsufficientFunds,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait HavenEventListener: Send + Sync {
    fn on_event(&self, event: HavenEvent);
}

impl<F> HavenEventListener for F
where
    F: Fn(HavenEvent) + Send + Sync,
{
    fn on_event(&self, event: HavenEvent) {
        self(event)
    }
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn HavenEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn HavenEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn emit(&self, event: HavenEvent) {
        // Snapshot so a listener may register another listener without deadlocking.
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }
}
