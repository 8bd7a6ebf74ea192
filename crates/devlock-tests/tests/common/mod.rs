//! Shared harness: a service wired to file-backed stores, a manual
//! environment source and a hand-driven clock

#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use devlock_core::{AuthSignal, ClientId, EnvSignal, EnvironmentSnapshot, PropertyChange, Signal};
use devlock_daemon::service::{Audience, Envelope};
use devlock_daemon::{
    DeviceLockService, EnvironmentMonitor, LockCodeStore, LockSettings, ManualClock,
    ManualEnvironment, ServiceDeps, ServiceHandle, SettingsStore,
};

pub const CODE: &str = "24680";

/// Display on, input unlocked, user active: the device is in use
pub fn in_use() -> EnvironmentSnapshot {
    EnvironmentSnapshot {
        display_on: true,
        call_active: false,
        input_lock_active: false,
        user_active: true,
    }
}

pub struct Daemon {
    pub handle: ServiceHandle,
    pub clock: ManualClock,
    pub source: Arc<ManualEnvironment>,
    pub monitor: Arc<EnvironmentMonitor>,
    pub signals: broadcast::Receiver<Envelope>,
    pub dir: TempDir,
    monitor_task: JoinHandle<()>,
}

impl Daemon {
    pub async fn start(settings: LockSettings, code: Option<&str>, env: EnvironmentSnapshot) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let settings_store = Arc::new(SettingsStore::open(dir.path().join("settings.json")).unwrap());
        settings_store.update(|s| *s = settings.clone()).unwrap();

        let lock_code = Arc::new(LockCodeStore::open(dir.path().join("lockcode.json")).unwrap());
        if let Some(code) = code {
            lock_code.change(None, code, &settings).unwrap();
        }

        let source = Arc::new(ManualEnvironment::new(env));
        let monitor = Arc::new(EnvironmentMonitor::new(source.clone()));
        let updates = monitor.start().await.unwrap();
        let monitor_task = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                let _ = monitor.follow(updates).await;
            })
        };

        let clock = ManualClock::default();
        let handle = DeviceLockService::spawn(ServiceDeps {
            settings: settings_store,
            lock_code,
            environment: monitor.subscribe(),
            manual_environment: Some(source.clone()),
            clock: Arc::new(clock.clone()),
            biometric_enabled: false,
        });
        let signals = handle.subscribe();

        Self {
            handle,
            clock,
            source,
            monitor,
            signals,
            dir,
            monitor_task,
        }
    }

    /// Report a signal and wait until the monitor has folded it in
    pub async fn set_env(&self, signal: EnvSignal, value: bool) {
        let mut snapshots = self.monitor.subscribe();
        self.handle.report_environment(signal, value).await.unwrap();
        snapshots
            .wait_for(|env| observed(env, signal) == value)
            .await
            .unwrap();
    }

    /// Next authentication signal addressed to `client`
    pub async fn next_auth(&mut self, client: ClientId) -> AuthSignal {
        loop {
            let envelope = self.signals.recv().await.unwrap();
            if let (Audience::Client(id), Signal::Auth(signal)) = (envelope.audience, envelope.signal)
            {
                if id == client {
                    return signal;
                }
            }
        }
    }

    /// Wait for a property change matching `pred`
    pub async fn wait_property(&mut self, pred: impl Fn(&PropertyChange) -> bool) -> PropertyChange {
        loop {
            let envelope = self.signals.recv().await.unwrap();
            if let Signal::Property(change) = envelope.signal {
                if pred(&change) {
                    return change;
                }
            }
        }
    }

    pub async fn stop(self) {
        self.handle.shutdown().await;
        self.monitor_task.abort();
    }
}

fn observed(env: &EnvironmentSnapshot, signal: EnvSignal) -> bool {
    match signal {
        EnvSignal::Display => env.display_on,
        EnvSignal::Call => env.call_active,
        EnvSignal::InputLock => env.input_lock_active,
        EnvSignal::Inactivity => !env.user_active,
    }
}
