//! Lock code storage with secure hashing
//!
//! The lock code is stored as an Argon2id hash together with the number of
//! consecutive failed attempts, so a lockout survives a daemon restart.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use devlock_core::Error;

use crate::error::{DaemonError, Result};
use crate::settings::LockSettings;

/// Outcome of checking a lock code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeVerdict {
    Accepted,
    /// Wrong code; carries the failed-attempt count after this attempt
    Rejected { failed_attempts: u32 },
}

/// Lock code verification as seen by the authentication broker
///
/// `verify` is expensive and is run on a blocking thread.
pub trait CodeVerifier: Send + Sync {
    /// Whether a lock code has been set
    fn is_set(&self) -> bool;

    /// Persisted consecutive failed attempts
    fn failed_attempts(&self) -> u32;

    /// Check a code, updating the failed-attempt counter
    fn verify(&self, code: &str) -> Result<CodeVerdict>;

    /// Count a failed attempt made by another method
    fn record_failure(&self) -> Result<u32>;

    /// Reset the counter after a successful authentication by another method
    fn reset_failures(&self) -> Result<()>;
}

/// Persisted lock code record
#[derive(Debug, Default, Serialize, Deserialize)]
struct LockCodeRecord {
    /// Argon2 hash of the lock code
    hash: Option<String>,
    /// Consecutive failed attempts
    failed_attempts: u32,
    last_failed_attempt: Option<DateTime<Utc>>,
}

/// Argon2id-backed lock code store
pub struct LockCodeStore {
    /// Backing file, None for an in-memory store
    path: Option<PathBuf>,
    record: Mutex<LockCodeRecord>,
}

impl LockCodeStore {
    /// Open the store, loading an existing record if present
    pub fn open(path: PathBuf) -> Result<Self> {
        let record = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| DaemonError::Store(format!("Failed to parse lock code: {}", e)))?
        } else {
            LockCodeRecord::default()
        };

        if record.hash.is_some() {
            info!(
                "Loaded lock code ({} failed attempts)",
                record.failed_attempts
            );
        }

        Ok(Self {
            path: Some(path),
            record: Mutex::new(record),
        })
    }

    /// Create a store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            record: Mutex::new(LockCodeRecord::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LockCodeRecord> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check a proposed code against the length and alphabet settings
    pub fn validate(code: &str, settings: &LockSettings) -> devlock_core::Result<()> {
        let length = code.chars().count() as u32;
        if length < settings.minimum_code_length || length > settings.maximum_code_length {
            return Err(Error::InvalidCode(format!(
                "lock code must be between {} and {} characters",
                settings.minimum_code_length, settings.maximum_code_length
            )));
        }

        if !settings.code_input_is_keyboard && !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidCode(
                "lock code must contain only digits".to_string(),
            ));
        }

        Ok(())
    }

    /// Set or replace the lock code
    ///
    /// When a code is already set, `current` must match it.
    pub fn change(&self, current: Option<&str>, new: &str, settings: &LockSettings) -> Result<()> {
        Self::validate(new, settings)?;
        self.require_current(current, settings)?;

        let salt = SaltString::generate(&mut OsRng);
        let code = Zeroizing::new(new.as_bytes().to_vec());
        let hash = Argon2::default()
            .hash_password(&code, &salt)
            .map_err(|e| DaemonError::Store(format!("Failed to hash lock code: {}", e)))?
            .to_string();

        let mut record = self.lock();
        record.hash = Some(hash);
        record.failed_attempts = 0;
        record.last_failed_attempt = None;
        self.save(&record)?;

        info!("Lock code changed");
        Ok(())
    }

    /// Remove the lock code
    pub fn clear(&self, current: &str, settings: &LockSettings) -> Result<()> {
        if !self.is_set() {
            return Err(Error::InvalidArgument("no lock code is set".to_string()).into());
        }
        self.require_current(Some(current), settings)?;

        let mut record = self.lock();
        *record = LockCodeRecord::default();
        self.save(&record)?;

        info!("Lock code cleared");
        Ok(())
    }

    fn require_current(&self, current: Option<&str>, settings: &LockSettings) -> Result<()> {
        if !self.is_set() {
            return Ok(());
        }

        if let Some(max) = settings.max_attempts() {
            if self.failed_attempts() >= max {
                return Err(Error::LockedOut.into());
            }
        }

        let current = current.ok_or_else(|| Error::access_denied("Current lock code required"))?;
        match self.verify(current)? {
            CodeVerdict::Accepted => Ok(()),
            CodeVerdict::Rejected { .. } => {
                Err(Error::access_denied("Current lock code is incorrect").into())
            }
        }
    }

    fn save(&self, record: &LockCodeRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let contents = serde_json::to_string_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;

        // Set restrictive permissions (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl CodeVerifier for LockCodeStore {
    fn is_set(&self) -> bool {
        self.lock().hash.is_some()
    }

    fn failed_attempts(&self) -> u32 {
        self.lock().failed_attempts
    }

    fn verify(&self, code: &str) -> Result<CodeVerdict> {
        let hash = self
            .lock()
            .hash
            .clone()
            .ok_or_else(|| Error::MethodNotInUse("no lock code is set".to_string()))?;

        let parsed = PasswordHash::new(&hash)
            .map_err(|e| DaemonError::Store(format!("Invalid stored hash: {}", e)))?;

        // Verify outside the record lock; Argon2 is slow on purpose
        let code = Zeroizing::new(code.as_bytes().to_vec());
        let accepted = Argon2::default().verify_password(&code, &parsed).is_ok();

        if accepted {
            self.reset_failures()?;
            Ok(CodeVerdict::Accepted)
        } else {
            let failed_attempts = self.record_failure()?;
            Ok(CodeVerdict::Rejected { failed_attempts })
        }
    }

    fn record_failure(&self) -> Result<u32> {
        let mut record = self.lock();
        record.failed_attempts = record.failed_attempts.saturating_add(1);
        record.last_failed_attempt = Some(Utc::now());
        self.save(&record)?;

        warn!("Failed authentication attempt ({} total)", record.failed_attempts);
        Ok(record.failed_attempts)
    }

    fn reset_failures(&self) -> Result<()> {
        let mut record = self.lock();
        if record.failed_attempts == 0 {
            return Ok(());
        }
        record.failed_attempts = 0;
        record.last_failed_attempt = None;
        self.save(&record)?;

        debug!("Failed attempt counter reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_code() {
        let settings = LockSettings::default();
        assert!(LockCodeStore::validate("12345", &settings).is_ok());
        assert!(matches!(
            LockCodeStore::validate("1234", &settings),
            Err(Error::InvalidCode(_))
        ));
        assert!(LockCodeStore::validate("12a45", &settings).is_err());

        let keyboard = LockSettings {
            code_input_is_keyboard: true,
            ..LockSettings::default()
        };
        assert!(LockCodeStore::validate("hunter2", &keyboard).is_ok());
    }

    #[test]
    fn test_set_and_verify() {
        let settings = LockSettings::default();
        let store = LockCodeStore::in_memory();
        assert!(!store.is_set());

        store.change(None, "12345", &settings).unwrap();
        assert!(store.is_set());

        assert_eq!(
            store.verify("54321").unwrap(),
            CodeVerdict::Rejected { failed_attempts: 1 }
        );
        assert_eq!(store.failed_attempts(), 1);

        assert_eq!(store.verify("12345").unwrap(), CodeVerdict::Accepted);
        assert_eq!(store.failed_attempts(), 0);
    }

    #[test]
    fn test_change_requires_current_code() {
        let settings = LockSettings::default();
        let store = LockCodeStore::in_memory();
        store.change(None, "12345", &settings).unwrap();

        let missing = store.change(None, "67890", &settings);
        assert!(matches!(
            missing,
            Err(DaemonError::Core(Error::AccessDenied(_)))
        ));

        let wrong = store.change(Some("00000"), "67890", &settings);
        assert!(matches!(wrong, Err(DaemonError::Core(Error::AccessDenied(_)))));

        store.change(Some("12345"), "67890", &settings).unwrap();
        assert_eq!(store.verify("67890").unwrap(), CodeVerdict::Accepted);
    }

    #[test]
    fn test_change_refused_when_locked_out() {
        let settings = LockSettings {
            maximum_attempts: 2,
            ..LockSettings::default()
        };
        let store = LockCodeStore::in_memory();
        store.change(None, "12345", &settings).unwrap();
        store.record_failure().unwrap();
        store.record_failure().unwrap();

        let result = store.change(Some("12345"), "67890", &settings);
        assert!(matches!(result, Err(DaemonError::Core(Error::LockedOut))));
    }

    #[test]
    fn test_clear() {
        let settings = LockSettings::default();
        let store = LockCodeStore::in_memory();
        assert!(store.clear("12345", &settings).is_err());

        store.change(None, "12345", &settings).unwrap();
        store.clear("12345", &settings).unwrap();
        assert!(!store.is_set());
    }

    #[test]
    fn test_failed_attempts_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lockcode.json");
        let settings = LockSettings::default();

        {
            let store = LockCodeStore::open(path.clone()).unwrap();
            store.change(None, "12345", &settings).unwrap();
            store.verify("99999").unwrap();
            store.record_failure().unwrap();
        }

        let store = LockCodeStore::open(path).unwrap();
        assert!(store.is_set());
        assert_eq!(store.failed_attempts(), 2);
        assert_eq!(store.verify("12345").unwrap(), CodeVerdict::Accepted);
    }
}
