//! Persisted lock settings
//!
//! The settings store is opened once at startup and handed to the components
//! that need it. Every changed field is announced on a broadcast channel;
//! dropping a receiver unsubscribes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use devlock_core::{
    AutomaticLocking, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_CODE_LENGTH, DEFAULT_MIN_CODE_LENGTH,
};

use crate::error::{DaemonError, Result};

/// Lock settings shared by the state machine and the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Minutes until automatic relock (-1 disabled, 0 immediate)
    pub automatic_locking: AutomaticLocking,
    /// Attempts before lockout, zero or negative for unlimited
    pub maximum_attempts: i32,
    pub minimum_code_length: u32,
    pub maximum_code_length: u32,
    /// Lock codes may contain any characters, not only digits
    pub code_input_is_keyboard: bool,
    /// A rejected fingerprint counts as a failed attempt
    pub biometric_mismatch_consumes_attempt: bool,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            automatic_locking: AutomaticLocking::default(),
            maximum_attempts: DEFAULT_MAX_ATTEMPTS,
            minimum_code_length: DEFAULT_MIN_CODE_LENGTH,
            maximum_code_length: DEFAULT_MAX_CODE_LENGTH,
            code_input_is_keyboard: false,
            biometric_mismatch_consumes_attempt: true,
        }
    }
}

impl LockSettings {
    /// Attempt limit, None when unlimited
    pub fn max_attempts(&self) -> Option<u32> {
        u32::try_from(self.maximum_attempts).ok().filter(|&n| n > 0)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.minimum_code_length == 0 {
            return Err(DaemonError::Config(
                "minimum_code_length must be at least 1".to_string(),
            ));
        }
        if self.maximum_code_length < self.minimum_code_length {
            return Err(DaemonError::Config(format!(
                "maximum_code_length {} is below minimum_code_length {}",
                self.maximum_code_length, self.minimum_code_length
            )));
        }
        Ok(())
    }

    fn changed_fields(&self, other: &LockSettings) -> Vec<SettingsField> {
        let mut fields = Vec::new();
        if self.automatic_locking != other.automatic_locking {
            fields.push(SettingsField::AutomaticLocking);
        }
        if self.maximum_attempts != other.maximum_attempts {
            fields.push(SettingsField::MaximumAttempts);
        }
        if self.minimum_code_length != other.minimum_code_length
            || self.maximum_code_length != other.maximum_code_length
        {
            fields.push(SettingsField::CodeLength);
        }
        if self.code_input_is_keyboard != other.code_input_is_keyboard {
            fields.push(SettingsField::CodeInputIsKeyboard);
        }
        if self.biometric_mismatch_consumes_attempt != other.biometric_mismatch_consumes_attempt {
            fields.push(SettingsField::BiometricMismatchConsumesAttempt);
        }
        fields
    }
}

/// Partial settings change requested by a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic_locking: Option<AutomaticLocking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_attempts: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_input_is_keyboard: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biometric_mismatch_consumes_attempt: Option<bool>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self == &SettingsUpdate::default()
    }

    /// Overwrite the fields present in this update
    pub fn apply(&self, settings: &mut LockSettings) {
        if let Some(locking) = self.automatic_locking {
            settings.automatic_locking = locking;
        }
        if let Some(max) = self.maximum_attempts {
            settings.maximum_attempts = max;
        }
        if let Some(keyboard) = self.code_input_is_keyboard {
            settings.code_input_is_keyboard = keyboard;
        }
        if let Some(consumes) = self.biometric_mismatch_consumes_attempt {
            settings.biometric_mismatch_consumes_attempt = consumes;
        }
    }
}

/// Individual settings that can change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    AutomaticLocking,
    MaximumAttempts,
    CodeLength,
    CodeInputIsKeyboard,
    BiometricMismatchConsumesAttempt,
}

/// Notification for one changed field
#[derive(Debug, Clone)]
pub struct SettingsChange {
    pub field: SettingsField,
    /// Settings after the change
    pub settings: LockSettings,
}

/// Settings store with file persistence
pub struct SettingsStore {
    /// Backing file, None for an in-memory store
    path: Option<PathBuf>,
    current: RwLock<LockSettings>,
    events: broadcast::Sender<SettingsChange>,
}

impl SettingsStore {
    /// Open the store, loading existing settings if present
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let settings = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<LockSettings>(&contents) {
                Ok(settings) if settings.validate().is_ok() => {
                    info!("Loaded settings from {:?}", path);
                    settings
                }
                Ok(_) => {
                    warn!("Settings at {:?} are inconsistent, using defaults", path);
                    LockSettings::default()
                }
                Err(e) => {
                    warn!("Failed to parse settings, using defaults: {}", e);
                    LockSettings::default()
                }
            }
        } else {
            debug!("No existing settings, using defaults");
            LockSettings::default()
        };

        let store = Self::build(Some(path), settings);
        store.persist(&store.current())?;
        Ok(store)
    }

    /// Create a store that is never written to disk
    pub fn in_memory(settings: LockSettings) -> Self {
        Self::build(None, settings)
    }

    fn build(path: Option<PathBuf>, settings: LockSettings) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            path,
            current: RwLock::new(settings),
            events,
        }
    }

    /// Current settings
    pub fn current(&self) -> LockSettings {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Subscribe to per-field change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.events.subscribe()
    }

    /// Apply a modification, persist it and announce each changed field
    pub fn update<F>(&self, modify: F) -> Result<Vec<SettingsField>>
    where
        F: FnOnce(&mut LockSettings),
    {
        let (fields, settings) = {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let mut updated = current.clone();
            modify(&mut updated);
            updated.validate()?;

            let fields = updated.changed_fields(&current);
            if fields.is_empty() {
                return Ok(fields);
            }

            // Memory only changes once the file does
            self.persist(&updated)?;
            *current = updated.clone();
            (fields, updated)
        };

        for field in &fields {
            debug!("Setting changed: {:?}", field);
            let _ = self.events.send(SettingsChange {
                field: *field,
                settings: settings.clone(),
            });
        }

        Ok(fields)
    }

    /// Flush settings before the daemon exits
    pub fn shutdown(&self) -> Result<()> {
        self.persist(&self.current())
    }

    fn persist(&self, settings: &LockSettings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(settings)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}
