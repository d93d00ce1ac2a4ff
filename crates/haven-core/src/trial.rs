use std::sync::Arc;

use crate::errors::HavenError;
use crate::store::{FREE_TRIAL_KEY, KeyValueStore, RetryQueue};

/// One-time free-trial budget in seconds.
///
/// Granted once per persisted record. The counter only ever decreases and a
/// reload resumes from the persisted value instead of granting a new budget.
pub struct FreeTrial {
    store: Arc<dyn KeyValueStore>,
    retry: Arc<RetryQueue>,
    remaining: u64,
}

impl FreeTrial {
    /// Resume the persisted allowance, or grant `initial_seconds` if none was
    /// ever recorded.
    ///
    /// The allowance is usable even when the grant could not be written; the
    /// write error is returned alongside it and the value stays queued on
    /// `retry`.
    pub fn load_or_grant(
        store: Arc<dyn KeyValueStore>,
        retry: Arc<RetryQueue>,
        initial_seconds: u64,
    ) -> (Self, Result<(), HavenError>) {
        let persisted = store
            .get(FREE_TRIAL_KEY)
            .and_then(|raw| raw.trim().parse::<u64>().ok());
        let (remaining, written) = match persisted {
            Some(v) => (v, Ok(())),
            None => {
                tracing::info!("granting free trial of {initial_seconds}s");
                let value = initial_seconds.to_string();
                let written = retry.write(store.as_ref(), FREE_TRIAL_KEY, &value);
                (initial_seconds, written)
            }
        };
        let trial = Self {
            store,
            retry,
            remaining,
        };
        (trial, written)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Spend one second. Returns the write error, if any, after the in-memory
    /// counter has already advanced.
    pub fn consume_second(&mut self) -> Result<u64, HavenError> {
        if self.remaining == 0 {
            return Ok(0);
        }
        self.remaining -= 1;
        self.retry
            .write(self.store.as_ref(), FREE_TRIAL_KEY, &self.remaining.to_string())?;
        Ok(self.remaining)
    }
}
