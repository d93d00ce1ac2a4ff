use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::errors::HavenError;
use crate::events::{EventEmitter, HavenEvent};
use crate::store::{KeyValueStore, RetryQueue, WALLET_BALANCE_KEY};

/// Most recent transactions kept for the wallet screen.
const HISTORY_LIMIT: usize = 100;

/// Amount in paise (1/100 of a rupee).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Paise(pub u64);

impl Paise {
    pub const ZERO: Paise = Paise(0);

    pub fn from_rupees(rupees: u64) -> Self {
        Paise(rupees.saturating_mul(100))
    }
}

impl fmt::Display for Paise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "₹{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Credit,
    Debit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub amount: Paise,
    pub balance_after: Paise,
    pub at: DateTime<Utc>,
    pub note: String,
}

/// The locally persisted wallet balance.
///
/// Shared by every meter in the process. The balance never goes negative:
/// debits that are not covered are refused.
pub struct Wallet {
    store: Arc<dyn KeyValueStore>,
    retry: Arc<RetryQueue>,
    emitter: EventEmitter,
    balance: watch::Sender<Paise>,
    history: Mutex<VecDeque<WalletTransaction>>,
}

impl Wallet {
    /// Load the persisted balance. A missing or unreadable value counts as zero.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        retry: Arc<RetryQueue>,
        emitter: EventEmitter,
    ) -> Self {
        let initial = store
            .get(WALLET_BALANCE_KEY)
            .and_then(|raw| match raw.trim().parse::<u64>() {
                Ok(v) => Some(Paise(v)),
                Err(e) => {
                    tracing::warn!("ignoring unreadable wallet balance {raw:?}: {e}");
                    None
                }
            })
            .unwrap_or_default();
        tracing::info!("wallet opened with balance {initial}");
        let (balance, _) = watch::channel(initial);
        Self {
            store,
            retry,
            emitter,
            balance,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn balance(&self) -> Paise {
        *self.balance.borrow()
    }

    /// Observe balance changes.
    pub fn subscribe(&self) -> watch::Receiver<Paise> {
        self.balance.subscribe()
    }

    pub fn can_cover(&self, amount: Paise) -> bool {
        self.balance() >= amount
    }

    /// Credit the wallet.
    pub fn top_up(&self, amount: Paise) -> Result<Paise, HavenError> {
        if amount == Paise::ZERO {
            return Err(HavenError::InvalidAmount("top-up must be positive".into()));
        }
        let mut after = Paise::ZERO;
        self.balance.send_modify(|b| {
            b.0 = b.0.saturating_add(amount.0);
            after = *b;
        });
        tracing::info!("wallet topped up by {amount}, balance {after}");
        self.record(TransactionKind::Credit, amount, after, "top-up");
        self.publish(after);
        Ok(after)
    }

    /// Debit the wallet if the balance covers `amount`.
    pub fn try_debit(&self, amount: Paise, note: &str) -> Result<Paise, HavenError> {
        let mut after = Paise::ZERO;
        let debited = self.balance.send_if_modified(|b| {
            if b.0 >= amount.0 {
                b.0 -= amount.0;
                after = *b;
                true
            } else {
                false
            }
        });
        if !debited {
            tracing::info!("debit of {amount} refused, balance {}", self.balance());
            return Err(HavenError::InsufficientFunds);
        }
        tracing::debug!("wallet debited {amount} for {note}, balance {after}");
        self.record(TransactionKind::Debit, amount, after, note);
        self.publish(after);
        Ok(after)
    }

    /// Recent transactions, newest first.
    pub fn history(&self) -> Vec<WalletTransaction> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .rev()
            .cloned()
            .collect()
    }

    fn record(&self, kind: TransactionKind, amount: Paise, balance_after: Paise, note: &str) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(WalletTransaction {
            id: Uuid::new_v4(),
            kind,
            amount,
            balance_after,
            at: Utc::now(),
            note: note.to_string(),
        });
    }

    fn publish(&self, balance: Paise) {
        if let Err(e) = self
            .retry
            .write(self.store.as_ref(), WALLET_BALANCE_KEY, &balance.0.to_string())
        {
            self.emitter.emit(HavenEvent::PersistenceWarning {
                key: WALLET_BALANCE_KEY.to_string(),
                error: e.to_string(),
            });
        }
        self.emitter.emit(HavenEvent::WalletBalanceChanged(balance));
    }
}
