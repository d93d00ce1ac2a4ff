//! Small key/value persistence used by the wallet and the free-trial counter.
//!
//! Values are short strings, read and written synchronously. Writes may fail
//! (disk full, storage quota); callers treat that as non-fatal and park the
//! value in a [`RetryQueue`] until a later write succeeds.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::errors::HavenError;

pub const WALLET_BALANCE_KEY: &str = "walletBalance";
pub const FREE_TRIAL_KEY: &str = "freeTrialSeconds";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), HavenError>;
}

/// Stores every key in one JSON object on disk.
///
/// Two processes sharing the same file are not coordinated: whichever writes
/// last wins.
pub struct JsonFileStore {
    file_path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("store.json");
        let values = Self::load(&file_path);
        Self {
            file_path,
            values: Mutex::new(values),
        }
    }

    fn load(path: &Path) -> BTreeMap<String, String> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("store file {} is corrupt, starting empty: {e}", path.display());
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    /// Re-read the file so values written by another process become visible.
    pub fn reload(&self) {
        let fresh = Self::load(&self.file_path);
        *self.values.lock().unwrap_or_else(|p| p.into_inner()) = fresh;
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), HavenError> {
        let snapshot = {
            let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
            values.insert(key.to_string(), value.to_string());
            values.clone()
        };
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HavenError::Persistence(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| HavenError::Persistence(e.to_string()))?;
        std::fs::write(&self.file_path, json).map_err(|e| HavenError::Persistence(e.to_string()))
    }
}

/// In-memory store. Writes can be made to fail for exercising retry paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, key: &str, value: &str) -> Self {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), HavenError> {
        if *self.fail_writes.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(HavenError::Persistence(format!("write to {key} rejected")));
        }
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Writes that failed and must be replayed. Only the newest value per key is
/// kept, so a flush never resurrects stale state.
#[derive(Default)]
pub struct RetryQueue {
    pending: Mutex<BTreeMap<String, String>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value`, queueing it on failure. A successful direct write
    /// supersedes whatever was queued for the same key.
    pub fn write(
        &self,
        store: &dyn KeyValueStore,
        key: &str,
        value: &str,
    ) -> Result<(), HavenError> {
        match store.set(key, value) {
            Ok(()) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(key);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("persisting {key} failed, queued for retry: {e}");
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(key.to_string(), value.to_string());
                Err(e)
            }
        }
    }

    /// Replay queued writes. Returns how many are still pending.
    pub fn flush(&self, store: &dyn KeyValueStore) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.retain(|key, value| match store.set(key, value) {
            Ok(()) => {
                tracing::debug!("reconciled queued write for {key}");
                false
            }
            Err(_) => true,
        });
        pending.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
