//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings file name inside the state directory
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Lock code file name inside the state directory
pub const LOCK_CODE_FILE_NAME: &str = "lockcode.json";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket path for IPC
    pub ipc_socket_path: PathBuf,

    /// Directory holding settings and the lock code
    pub state_dir: PathBuf,

    /// Whether a biometric sensor is present
    #[serde(default)]
    pub biometric_enabled: bool,

    /// Accept environment and biometric reports from IPC clients
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ipc_socket_path: Self::default_ipc_path(),
            state_dir: Self::default_state_dir(),
            biometric_enabled: false,
            dev_mode: false,
        }
    }
}

impl DaemonConfig {
    /// Default IPC path, under XDG_RUNTIME_DIR when available
    pub fn default_ipc_path() -> PathBuf {
        dirs::runtime_dir()
            .map(|dir| dir.join("devlock.sock"))
            .unwrap_or_else(|| PathBuf::from("/tmp/devlock.sock"))
    }

    fn default_state_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("devlock")
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("devlock")
            .join("daemon.json")
    }

    /// Path of the persisted settings
    pub fn settings_path(&self) -> PathBuf {
        self.state_dir.join(SETTINGS_FILE_NAME)
    }

    /// Path of the persisted lock code
    pub fn lock_code_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_CODE_FILE_NAME)
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration, writing defaults when the file does not exist
    pub fn load_or_create(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(path)?;
        Ok(config)
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> crate::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.state_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        if let Some(parent) = self.ipc_socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(())
    }
}
