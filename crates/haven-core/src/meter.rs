//! Session meter: gates a chat or call session behind the free-trial
//! allowance and the wallet.
//!
//! Every second of use either spends one free-trial second or accrues toward a
//! paid unit; after `tick_interval_seconds` accrued seconds one unit is debited
//! from the wallet. When the wallet cannot cover a unit the meter halts and the
//! UI is told to offer a top-up.
//!
//! The tick that brings the allowance to zero is a trial tick only. Paid
//! accrual starts at zero on the following tick, so there is neither a free
//! grace second nor a double charge at the handoff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::errors::HavenError;
use crate::events::{EventEmitter, HaltReason, HavenEvent, MeterEvent};
use crate::store::{FREE_TRIAL_KEY, KeyValueStore, RetryQueue};
use crate::trial::FreeTrial;
use crate::wallet::{Paise, Wallet};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeteredFeature {
    Chat,
    VideoCall,
}

impl MeteredFeature {
    pub fn label(&self) -> &'static str {
        match self {
            MeteredFeature::Chat => "chat",
            MeteredFeature::VideoCall => "video call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterMode {
    FreeTrial,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterSnapshot {
    pub feature: MeteredFeature,
    pub mode: MeterMode,
    pub active: bool,
    pub elapsed_seconds: u64,
    pub tick_interval_seconds: u64,
    pub free_seconds_remaining: u64,
    pub insufficient_funds: bool,
}

/// What a single tick did. Exactly one kind of accounting happens per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Meter not running; nothing happened.
    Inactive,
    TrialSecond { remaining: u64 },
    TrialExhausted,
    Accrued { elapsed: u64 },
    Debited { balance: Paise },
    Halted,
}

/// Per-session accounting state. Built fresh from persisted values on every
/// start so a reload never grants unearned time.
struct MeterCore {
    trial: FreeTrial,
    tick_interval: u64,
    elapsed: u64,
    active: bool,
    insufficient: bool,
}

struct Shared {
    feature: MeteredFeature,
    unit_cost: Paise,
    wallet: Arc<Wallet>,
    store: Arc<dyn KeyValueStore>,
    retry: Arc<RetryQueue>,
    emitter: EventEmitter,
    core: Mutex<Option<MeterCore>>,
    snapshot: watch::Sender<MeterSnapshot>,
}

struct MeterTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives a [`MeterCore`] from a dedicated background task on a monotonic
/// one-second interval.
pub struct SessionMeter {
    shared: Arc<Shared>,
    task: Mutex<Option<MeterTask>>,
}

impl SessionMeter {
    pub fn new(
        feature: MeteredFeature,
        unit_cost: Paise,
        wallet: Arc<Wallet>,
        store: Arc<dyn KeyValueStore>,
        retry: Arc<RetryQueue>,
        emitter: EventEmitter,
    ) -> Self {
        let (snapshot, _) = watch::channel(MeterSnapshot {
            feature,
            mode: MeterMode::FreeTrial,
            active: false,
            elapsed_seconds: 0,
            tick_interval_seconds: 0,
            free_seconds_remaining: 0,
            insufficient_funds: false,
        });
        Self {
            shared: Arc::new(Shared {
                feature,
                unit_cost,
                wallet,
                store,
                retry,
                emitter,
                core: Mutex::new(None),
                snapshot,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeterSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.shared
            .core
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|c| c.active)
    }

    /// Start metering. `initial_free_seconds` only applies when no allowance was
    /// ever persisted. Starting an active meter does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        initial_free_seconds: u64,
        tick_interval_seconds: u64,
    ) -> Result<(), HavenError> {
        if tick_interval_seconds == 0 {
            return Err(HavenError::Config("tick interval must be at least one second".into()));
        }
        if self.shared.unit_cost == Paise::ZERO {
            return Err(HavenError::Config("unit cost must be positive".into()));
        }
        if self.is_active() {
            tracing::debug!("{} meter already running", self.shared.feature.label());
            return Ok(());
        }
        self.shared.retry.flush(self.shared.store.as_ref());
        let (trial, granted) = FreeTrial::load_or_grant(
            self.shared.store.clone(),
            self.shared.retry.clone(),
            initial_free_seconds,
        );
        if let Err(e) = granted {
            tracing::warn!("free trial grant not saved: {e}");
            self.shared.emitter.emit(HavenEvent::PersistenceWarning {
                key: FREE_TRIAL_KEY.to_string(),
                error: e.to_string(),
            });
        }
        let free_seconds = trial.remaining();
        *self.shared.core.lock().unwrap_or_else(|p| p.into_inner()) = Some(MeterCore {
            trial,
            tick_interval: tick_interval_seconds,
            elapsed: 0,
            active: true,
            insufficient: false,
        });
        tracing::info!(
            "{} meter started: {free_seconds}s free, {} per {tick_interval_seconds}s",
            self.shared.feature.label(),
            self.shared.unit_cost
        );
        self.shared.publish_snapshot();
        self.shared.emitter.emit(HavenEvent::Meter(MeterEvent::Started {
            feature: self.shared.feature,
            free_seconds,
        }));
        self.spawn_ticker();
        Ok(())
    }

    /// Process one second of usage. Called by the background task; a no-op
    /// while the meter is stopped or halted.
    pub fn on_tick(&self) -> TickOutcome {
        self.shared.tick()
    }

    /// Stop metering. Calling it again changes nothing.
    pub fn stop(&self) {
        self.cancel_ticker();
        let was_active = {
            let mut core = self.shared.core.lock().unwrap_or_else(|p| p.into_inner());
            match core.as_mut() {
                Some(c) if c.active => {
                    c.active = false;
                    true
                }
                _ => false,
            }
        };
        if was_active {
            tracing::info!("{} meter stopped", self.shared.feature.label());
            self.shared.publish_snapshot();
            self.shared.emitter.emit(HavenEvent::Meter(MeterEvent::Stopped {
                feature: self.shared.feature,
            }));
        }
    }

    /// Re-activate a stopped or halted meter if the free allowance or the
    /// wallet can pay for more time. Otherwise re-signal insufficient funds and
    /// return `false`.
    pub fn resume(&self) -> bool {
        let resumed = {
            let mut guard = self.shared.core.lock().unwrap_or_else(|p| p.into_inner());
            let Some(core) = guard.as_mut() else {
                tracing::debug!("resume before start ignored");
                return false;
            };
            if core.active {
                return true;
            }
            let covered = self.shared.wallet.can_cover(self.shared.unit_cost);
            if core.trial.is_exhausted() && !covered {
                core.insufficient = true;
                false
            } else {
                core.active = true;
                core.insufficient = false;
                true
            }
        };
        self.shared.publish_snapshot();
        let feature = self.shared.feature;
        if resumed {
            tracing::info!("{} meter resumed", feature.label());
            self.shared.emitter.emit(HavenEvent::Meter(MeterEvent::Resumed { feature }));
            self.spawn_ticker();
        } else {
            tracing::info!("{} meter cannot resume: insufficient funds", feature.label());
            self.shared.emitter.emit(HavenEvent::Meter(MeterEvent::Halted {
                feature,
                reason: HaltReason::InsufficientFunds,
            }));
        }
        resumed
    }

    fn spawn_ticker(&self) {
        self.cancel_ticker();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + TICK, TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match shared.tick() {
                            TickOutcome::Halted | TickOutcome::Inactive => break,
                            _ => {}
                        }
                    }
                }
            }
            tracing::debug!("{} meter task ended", shared.feature.label());
        });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(MeterTask { cancel, handle });
    }

    fn cancel_ticker(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.cancel.cancel();
            // Never joined: the task may be the caller (halt from inside a tick).
            drop(task.handle);
        }
    }
}

impl Drop for SessionMeter {
    fn drop(&mut self) {
        self.cancel_ticker();
    }
}

impl Shared {
    fn tick(&self) -> TickOutcome {
        let mut events = Vec::new();
        let outcome = {
            let mut guard = self.core.lock().unwrap_or_else(|p| p.into_inner());
            let Some(core) = guard.as_mut() else {
                return TickOutcome::Inactive;
            };
            if !core.active {
                return TickOutcome::Inactive;
            }
            self.retry.flush(self.store.as_ref());
            self.account(core, &mut events)
        };
        self.publish_snapshot();
        // Emitted outside the lock so listeners may call back into the meter.
        for event in events {
            self.emitter.emit(event);
        }
        outcome
    }

    fn account(&self, core: &mut MeterCore, events: &mut Vec<HavenEvent>) -> TickOutcome {
        let feature = self.feature;

        if !core.trial.is_exhausted() {
            if let Err(e) = core.trial.consume_second() {
                events.push(HavenEvent::PersistenceWarning {
                    key: FREE_TRIAL_KEY.to_string(),
                    error: e.to_string(),
                });
            }
            if core.trial.is_exhausted() {
                tracing::info!("{} free trial exhausted", feature.label());
                events.push(HavenEvent::Meter(MeterEvent::TrialExhausted { feature }));
                return TickOutcome::TrialExhausted;
            }
            return TickOutcome::TrialSecond {
                remaining: core.trial.remaining(),
            };
        }

        if !self.wallet.can_cover(self.unit_cost) {
            return self.halt(core, events);
        }

        core.elapsed += 1;
        if core.elapsed < core.tick_interval {
            tracing::debug!(
                "{} accrued {}s of {}s",
                feature.label(),
                core.elapsed,
                core.tick_interval
            );
            return TickOutcome::Accrued { elapsed: core.elapsed };
        }

        match self.wallet.try_debit(self.unit_cost, feature.label()) {
            Ok(balance) => {
                core.elapsed = 0;
                events.push(HavenEvent::Meter(MeterEvent::Debited {
                    feature,
                    amount: self.unit_cost,
                    balance,
                }));
                TickOutcome::Debited { balance }
            }
            // Another meter drained the wallet between the check and the debit.
            Err(_) => self.halt(core, events),
        }
    }

    fn halt(&self, core: &mut MeterCore, events: &mut Vec<HavenEvent>) -> TickOutcome {
        core.active = false;
        core.insufficient = true;
        tracing::info!(
            "{} meter halted: balance {} below {}",
            self.feature.label(),
            self.wallet.balance(),
            self.unit_cost
        );
        events.push(HavenEvent::Meter(MeterEvent::Halted {
            feature: self.feature,
            reason: HaltReason::InsufficientFunds,
        }));
        TickOutcome::Halted
    }

    fn publish_snapshot(&self) {
        let guard = self.core.lock().unwrap_or_else(|p| p.into_inner());
        let Some(core) = guard.as_ref() else { return };
        let snapshot = MeterSnapshot {
            feature: self.feature,
            mode: if core.trial.is_exhausted() {
                MeterMode::Paid
            } else {
                MeterMode::FreeTrial
            },
            active: core.active,
            elapsed_seconds: core.elapsed,
            tick_interval_seconds: core.tick_interval,
            free_seconds_remaining: core.trial.remaining(),
            insufficient_funds: core.insufficient,
        };
        self.snapshot.send_replace(snapshot);
    }
}
