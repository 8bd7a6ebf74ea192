//! Environment monitoring
//!
//! Tracks the power-management signals that feed the lock policy. Every
//! tracked signal is handled the same way: subscribe to changes first, then
//! query the initial value, so no change can slip between the two.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use devlock_core::{EnvSignal, EnvironmentSnapshot};

use crate::error::Result;

/// A single signal change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvUpdate {
    pub signal: EnvSignal,
    pub value: bool,
}

/// Provider of environment signals
#[async_trait]
pub trait EnvironmentSource: Send + Sync {
    /// Query the current value of a signal
    async fn query(&self, signal: EnvSignal) -> Result<bool>;

    /// Subscribe to signal changes
    fn subscribe(&self) -> broadcast::Receiver<EnvUpdate>;
}

/// In-memory environment source fed by explicit reports
///
/// Used for development over IPC and in tests.
pub struct ManualEnvironment {
    values: RwLock<HashMap<EnvSignal, bool>>,
    event_tx: broadcast::Sender<EnvUpdate>,
}

impl ManualEnvironment {
    pub fn new(initial: EnvironmentSnapshot) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let values = TRACKED
            .iter()
            .map(|tracked| (tracked.signal, (tracked.read)(&initial)))
            .collect();

        Self {
            values: RwLock::new(values),
            event_tx,
        }
    }

    /// Report a new signal value
    pub async fn report(&self, signal: EnvSignal, value: bool) {
        self.values.write().await.insert(signal, value);
        debug!("Environment report: {}={}", signal, value);
        let _ = self.event_tx.send(EnvUpdate { signal, value });
    }
}

impl Default for ManualEnvironment {
    fn default() -> Self {
        Self::new(EnvironmentSnapshot::default())
    }
}

#[async_trait]
impl EnvironmentSource for ManualEnvironment {
    async fn query(&self, signal: EnvSignal) -> Result<bool> {
        let values = self.values.read().await;
        Ok(values.get(&signal).copied().unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<EnvUpdate> {
        self.event_tx.subscribe()
    }
}

/// A tracked signal and how it maps onto the snapshot
struct TrackedProperty {
    signal: EnvSignal,
    apply: fn(&mut EnvironmentSnapshot, bool),
    read: fn(&EnvironmentSnapshot) -> bool,
}

const TRACKED: [TrackedProperty; 4] = [
    TrackedProperty {
        signal: EnvSignal::Display,
        apply: |env, value| env.display_on = value,
        read: |env| env.display_on,
    },
    TrackedProperty {
        signal: EnvSignal::Call,
        apply: |env, value| env.call_active = value,
        read: |env| env.call_active,
    },
    TrackedProperty {
        signal: EnvSignal::InputLock,
        apply: |env, value| env.input_lock_active = value,
        read: |env| env.input_lock_active,
    },
    // The source reports inactivity; the snapshot tracks activity
    TrackedProperty {
        signal: EnvSignal::Inactivity,
        apply: |env, value| env.user_active = !value,
        read: |env| !env.user_active,
    },
];

fn tracked(signal: EnvSignal) -> &'static TrackedProperty {
    match signal {
        EnvSignal::Display => &TRACKED[0],
        EnvSignal::Call => &TRACKED[1],
        EnvSignal::InputLock => &TRACKED[2],
        EnvSignal::Inactivity => &TRACKED[3],
    }
}

/// Folds source signals into environment snapshots
pub struct EnvironmentMonitor {
    source: Arc<dyn EnvironmentSource>,
    snapshot_tx: watch::Sender<EnvironmentSnapshot>,
}

impl EnvironmentMonitor {
    /// Create a monitor starting from the default snapshot
    pub fn new(source: Arc<dyn EnvironmentSource>) -> Self {
        let (snapshot_tx, _) = watch::channel(EnvironmentSnapshot::default());
        Self {
            source,
            snapshot_tx,
        }
    }

    /// Receive snapshots as they change
    pub fn subscribe(&self) -> watch::Receiver<EnvironmentSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> EnvironmentSnapshot {
        *self.snapshot_tx.borrow()
    }

    /// Apply one signal change, returning whether the snapshot changed
    pub fn apply(&self, update: EnvUpdate) -> bool {
        let property = tracked(update.signal);
        self.snapshot_tx.send_if_modified(|env| {
            let before = *env;
            (property.apply)(env, update.value);
            *env != before
        })
    }

    /// Subscribe to the source, then query every tracked signal
    pub async fn start(&self) -> Result<broadcast::Receiver<EnvUpdate>> {
        let rx = self.source.subscribe();
        self.resync().await;
        info!("Environment monitor started: {:?}", self.snapshot());
        Ok(rx)
    }

    async fn resync(&self) {
        for property in TRACKED.iter() {
            match self.source.query(property.signal).await {
                Ok(value) => {
                    self.apply(EnvUpdate {
                        signal: property.signal,
                        value,
                    });
                }
                Err(e) => {
                    warn!("Failed to query {}: {}", property.signal, e);
                }
            }
        }
    }

    /// Start, then track the source until it goes away
    pub async fn watch(&self) -> Result<()> {
        let rx = self.start().await?;
        self.follow(rx).await
    }

    /// Track changes from a receiver obtained with [`start`](Self::start)
    pub async fn follow(&self, mut rx: broadcast::Receiver<EnvUpdate>) -> Result<()> {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    if self.apply(update) {
                        debug!("Environment changed: {}={}", update.signal, update.value);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Environment monitor lagged by {} updates, resyncing", skipped);
                    self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        info!("Environment source closed");
        Ok(())
    }
}
