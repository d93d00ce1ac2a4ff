use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::call::CallConfig;
use crate::errors::HavenError;
use crate::wallet::Paise;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    /// One-time allowance granted on first use of a metered feature.
    #[serde(default = "default_free_trial_seconds")]
    pub free_trial_seconds: u64,
    /// Seconds of usage billed as one unit.
    #[serde(default = "default_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    #[serde(default = "default_unit_cost_paise")]
    pub unit_cost_paise: u64,
    #[serde(default = "default_answer_timeout_secs")]
    pub answer_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default = "default_true")]
    pub camera_enabled_on_join: bool,
}

fn default_true() -> bool {
    true
}

fn default_free_trial_seconds() -> u64 {
    300
}

fn default_tick_interval_seconds() -> u64 {
    120
}

fn default_unit_cost_paise() -> u64 {
    100
}

fn default_answer_timeout_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            free_trial_seconds: default_free_trial_seconds(),
            tick_interval_seconds: default_tick_interval_seconds(),
            unit_cost_paise: default_unit_cost_paise(),
            answer_timeout_secs: default_answer_timeout_secs(),
            mic_enabled_on_join: true,
            camera_enabled_on_join: true,
        }
    }
}

impl Settings {
    pub fn unit_cost(&self) -> Paise {
        Paise(self.unit_cost_paise)
    }

    pub fn call_config(&self) -> CallConfig {
        CallConfig {
            answer_timeout: Duration::from_secs(self.answer_timeout_secs),
        }
    }

    /// Reject values the meter and coordinator cannot run with.
    pub fn validate(&self) -> Result<(), HavenError> {
        if self.tick_interval_seconds == 0 {
            return Err(HavenError::Config("tick interval must be at least one second".into()));
        }
        if self.unit_cost_paise == 0 {
            return Err(HavenError::Config("unit cost must be positive".into()));
        }
        if self.answer_timeout_secs == 0 {
            return Err(HavenError::Config("answer timeout must be positive".into()));
        }
        Ok(())
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.lock().display_name = name;
        self.save();
    }

    pub fn set_free_trial_seconds(&self, seconds: u64) {
        self.lock().free_trial_seconds = seconds;
        self.save();
    }

    pub fn set_tick_interval_seconds(&self, seconds: u64) {
        self.lock().tick_interval_seconds = seconds;
        self.save();
    }

    pub fn set_unit_cost_paise(&self, paise: u64) {
        self.lock().unit_cost_paise = paise;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.lock().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.lock().camera_enabled_on_join = enabled;
        self.save();
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize settings: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable settings file: {e}");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
