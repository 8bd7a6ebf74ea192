//! devlock Daemon - Device lock state and authentication service
//!
//! This crate provides:
//! - The device lock state machine and its relock timer
//! - Authentication sessions and the broker that arbitrates them
//! - Mirrored authentication input for lock screens and PIN dialogs
//! - Persisted lock settings and lock code
//! - IPC server and client

pub mod auth;
pub mod config;
pub mod device_lock;
pub mod environment;
pub mod error;
pub mod ipc;
pub mod lockcode;
pub mod service;
pub mod settings;
pub mod timer;

pub use config::DaemonConfig;
pub use device_lock::DeviceLock;
pub use environment::{EnvironmentMonitor, EnvironmentSource, ManualEnvironment};
pub use error::{DaemonError, Result};
pub use ipc::{IpcClient, IpcServer, IpcSession};
pub use lockcode::LockCodeStore;
pub use service::{DeviceLockService, ServiceDeps, ServiceHandle, ServiceProperties};
pub use settings::{LockSettings, SettingsStore, SettingsUpdate};
pub use timer::{Clock, ManualClock, SystemClock};
