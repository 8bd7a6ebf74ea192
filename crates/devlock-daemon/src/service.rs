//! Device lock service
//!
//! A single task owns the state machine, the broker and the input mirror.
//! Everything else talks to it through a [`ServiceHandle`], which sends
//! commands over an mpsc channel and awaits the reply on a oneshot.

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use devlock_core::{
    AuthPurpose, AuthSignal, AutomaticLocking, BiometricEvent, Challenge, ClientId, EnvSignal,
    EnvironmentSnapshot, Error, LockState, Methods, PropertyChange, Signal,
};

use crate::auth::{
    AuthenticationBroker, BrokerEvent, BrokerEventKind, InputMirror, MirrorState,
    PendingVerification, VerificationResult,
};
use crate::device_lock::{DeviceLock, DeviceLockEvent};
use crate::environment::ManualEnvironment;
use crate::error::{DaemonError, Result};
use crate::lockcode::{CodeVerifier, LockCodeStore};
use crate::settings::{SettingsChange, SettingsField, SettingsStore, SettingsUpdate};
use crate::timer::Clock;

/// Who a signal is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Client(ClientId),
    Everyone,
}

/// A signal and its recipients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub audience: Audience,
    pub signal: Signal,
}

impl Envelope {
    pub fn is_for(&self, client: ClientId) -> bool {
        match self.audience {
            Audience::Everyone => true,
            Audience::Client(id) => id == client,
        }
    }
}

/// Observable service properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProperties {
    pub state: LockState,
    /// Device locking is in use
    pub enabled: bool,
    /// An unlock authentication is in progress
    pub unlocking: bool,
    /// Effective automatic locking policy
    pub automatic_locking: AutomaticLocking,
    pub available_methods: Methods,
    pub utilized_methods: Methods,
    pub authenticating: bool,
    pub minimum_code_length: u32,
    pub maximum_code_length: u32,
    pub maximum_attempts: Option<u32>,
    pub code_input_is_keyboard: bool,
    pub lock_code_set: bool,
}

impl ServiceProperties {
    /// Property changes needed to go from `self` to `next`
    fn changes(&self, next: &ServiceProperties) -> Vec<PropertyChange> {
        let mut changes = Vec::new();
        if self.state != next.state {
            changes.push(PropertyChange::State(next.state));
        }
        if self.enabled != next.enabled {
            changes.push(PropertyChange::Enabled(next.enabled));
        }
        if self.unlocking != next.unlocking {
            changes.push(PropertyChange::Unlocking(next.unlocking));
        }
        if self.automatic_locking != next.automatic_locking {
            changes.push(PropertyChange::AutomaticLocking(next.automatic_locking));
        }
        if self.available_methods != next.available_methods {
            changes.push(PropertyChange::AvailableMethods(next.available_methods));
        }
        if self.utilized_methods != next.utilized_methods {
            changes.push(PropertyChange::UtilizedMethods(next.utilized_methods));
        }
        if self.authenticating != next.authenticating {
            changes.push(PropertyChange::Authenticating(next.authenticating));
        }
        if self.minimum_code_length != next.minimum_code_length {
            changes.push(PropertyChange::MinimumCodeLength(next.minimum_code_length));
        }
        if self.maximum_code_length != next.maximum_code_length {
            changes.push(PropertyChange::MaximumCodeLength(next.maximum_code_length));
        }
        if self.maximum_attempts != next.maximum_attempts {
            changes.push(PropertyChange::MaximumAttempts(next.maximum_attempts));
        }
        if self.code_input_is_keyboard != next.code_input_is_keyboard {
            changes.push(PropertyChange::CodeInputIsKeyboard(next.code_input_is_keyboard));
        }
        if self.lock_code_set != next.lock_code_set {
            changes.push(PropertyChange::LockCodeSet(next.lock_code_set));
        }
        changes
    }
}

type Responder<T> = oneshot::Sender<devlock_core::Result<T>>;

/// Requests handled by the service loop
enum Command {
    Properties {
        respond: oneshot::Sender<ServiceProperties>,
    },
    Authenticate {
        client: ClientId,
        challenge: Challenge,
        methods: Methods,
        respond: Responder<()>,
    },
    EnterCode {
        client: ClientId,
        code: Zeroizing<String>,
        respond: Responder<()>,
    },
    Cancel {
        client: ClientId,
        respond: Responder<()>,
    },
    Unlock {
        client: ClientId,
        respond: Responder<()>,
    },
    SetState {
        state: LockState,
        respond: Responder<()>,
    },
    RegisterInput {
        client: ClientId,
        purpose: AuthPurpose,
        respond: Responder<MirrorState>,
    },
    UnregisterInput {
        client: ClientId,
        respond: Responder<()>,
    },
    SetInputActive {
        client: ClientId,
        active: bool,
        respond: Responder<()>,
    },
    RedeemToken {
        client: ClientId,
        token: String,
        respond: Responder<()>,
    },
    LockCodeChanged {
        respond: Responder<()>,
    },
    SettingsUpdated {
        respond: Responder<()>,
    },
    Biometric {
        event: BiometricEvent,
        respond: Responder<()>,
    },
    PollTimer {
        respond: Responder<bool>,
    },
    Disconnected {
        client: ClientId,
    },
    Shutdown,
}

/// Everything the service needs to run
pub struct ServiceDeps {
    pub settings: Arc<SettingsStore>,
    pub lock_code: Arc<LockCodeStore>,
    pub environment: watch::Receiver<EnvironmentSnapshot>,
    /// Source accepting environment reports, when reports are allowed
    pub manual_environment: Option<Arc<ManualEnvironment>>,
    pub clock: Arc<dyn Clock>,
    pub biometric_enabled: bool,
}

/// The device lock service loop state
pub struct DeviceLockService {
    lock: DeviceLock,
    broker: AuthenticationBroker,
    mirror: InputMirror,
    settings: Arc<SettingsStore>,
    lock_code: Arc<LockCodeStore>,
    lock_rx: broadcast::Receiver<DeviceLockEvent>,
    broker_rx: broadcast::Receiver<BrokerEvent>,
    signal_tx: broadcast::Sender<Envelope>,
    verify_tx: mpsc::UnboundedSender<VerificationResult>,
    published: ServiceProperties,
}

/// Effective policy: the device cannot lock without a lock code
fn effective_locking(settings: &SettingsStore, lock_code: &LockCodeStore) -> AutomaticLocking {
    if lock_code.is_set() {
        settings.current().automatic_locking
    } else {
        AutomaticLocking::Disabled
    }
}

impl DeviceLockService {
    /// Build the service and spawn its loop
    pub fn spawn(deps: ServiceDeps) -> ServiceHandle {
        let ServiceDeps {
            settings,
            lock_code,
            mut environment,
            manual_environment,
            clock,
            biometric_enabled,
        } = deps;

        let env = *environment.borrow_and_update();
        let lock = DeviceLock::new(
            effective_locking(&settings, &lock_code),
            env,
            clock.clone(),
        );
        let verifier: Arc<dyn CodeVerifier> = lock_code.clone();
        let broker =
            AuthenticationBroker::new(settings.clone(), verifier, clock, biometric_enabled);

        let (signal_tx, _) = broadcast::channel(256);
        let (verify_tx, verify_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(64);

        let mut service = Self {
            lock_rx: lock.subscribe(),
            broker_rx: broker.subscribe(),
            lock,
            broker,
            mirror: InputMirror::new(),
            settings: settings.clone(),
            lock_code: lock_code.clone(),
            signal_tx: signal_tx.clone(),
            verify_tx,
            published: ServiceProperties {
                state: LockState::Undefined,
                enabled: false,
                unlocking: false,
                automatic_locking: AutomaticLocking::Disabled,
                available_methods: Methods::NONE,
                utilized_methods: Methods::NONE,
                authenticating: false,
                minimum_code_length: 0,
                maximum_code_length: 0,
                maximum_attempts: None,
                code_input_is_keyboard: false,
                lock_code_set: false,
            },
        };

        if let Err(e) = service.lock.initialize() {
            error!("Lock state initialization failed: {}", e);
        }
        service.drain_events();
        service.published = service.properties();

        let settings_rx = settings.subscribe();
        tokio::spawn(service.run(command_rx, environment, settings_rx, verify_rx));

        ServiceHandle {
            commands: command_tx,
            signals: signal_tx,
            settings,
            lock_code,
            manual_environment,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut environment: watch::Receiver<EnvironmentSnapshot>,
        mut settings_rx: broadcast::Receiver<SettingsChange>,
        mut verify_rx: mpsc::UnboundedReceiver<VerificationResult>,
    ) {
        info!("Device lock service started in state {}", self.lock.state());
        let mut environment_open = true;
        let mut settings_open = true;

        loop {
            let poll = self.lock.next_poll();

            // Inputs that already happened are applied before new requests
            tokio::select! {
                biased;

                changed = environment.changed(), if environment_open => {
                    if changed.is_err() {
                        warn!("Environment monitor stopped");
                        environment_open = false;
                    } else {
                        let env = *environment.borrow_and_update();
                        let result = self.lock.on_environment_changed(env);
                        self.report(result);
                    }
                }
                change = settings_rx.recv(), if settings_open => match change {
                    Ok(change) => self.on_settings_changed(change),
                    Err(broadcast::error::RecvError::Lagged(_)) => self.refresh_locking(),
                    Err(broadcast::error::RecvError::Closed) => settings_open = false,
                },
                Some(result) = verify_rx.recv() => {
                    self.broker.complete_verification(result, &mut self.lock);
                }
                _ = tokio::time::sleep(poll.unwrap_or(Duration::ZERO)), if poll.is_some() => {
                    let result = self.lock.poll_timer().map(|_| ());
                    self.report(result);
                }
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
            }

            self.pump();
        }

        info!("Device lock service stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Properties { respond } => {
                let _ = respond.send(self.properties());
            }
            Command::Authenticate {
                client,
                challenge,
                methods,
                respond,
            } => {
                let result =
                    self.broker
                        .authenticate(client, AuthPurpose::Authentication, challenge, methods);
                let _ = respond.send(result);
            }
            Command::EnterCode {
                client,
                code,
                respond,
            } => {
                let result = self
                    .broker
                    .enter_code(client, code)
                    .map(|pending| self.verify(pending));
                let _ = respond.send(result);
            }
            Command::Cancel { client, respond } => {
                let _ = respond.send(self.broker.cancel(client));
            }
            Command::Unlock { client, respond } => {
                let _ = respond.send(self.unlock(client));
            }
            Command::SetState { state, respond } => {
                let _ = respond.send(self.lock.request_state(state));
            }
            Command::RegisterInput {
                client,
                purpose,
                respond,
            } => {
                let _ = respond.send(Ok(self.mirror.register(client, purpose)));
            }
            Command::UnregisterInput { client, respond } => {
                self.mirror.unregister(client);
                let _ = respond.send(Ok(()));
            }
            Command::SetInputActive {
                client,
                active,
                respond,
            } => {
                let _ = respond.send(self.mirror.set_active(client, active));
            }
            Command::RedeemToken {
                client,
                token,
                respond,
            } => {
                let _ = respond.send(self.broker.redeem_token(client, &token));
            }
            Command::LockCodeChanged { respond } | Command::SettingsUpdated { respond } => {
                self.refresh_locking();
                let _ = respond.send(Ok(()));
            }
            Command::Biometric { event, respond } => {
                let result = self
                    .broker
                    .on_biometric(event)
                    .map(|pending| pending.map_or((), |pending| self.verify(pending)));
                let _ = respond.send(result);
            }
            Command::PollTimer { respond } => {
                let _ = respond.send(self.lock.poll_timer());
            }
            Command::Disconnected { client } => {
                self.broker.client_disconnected(client);
                self.mirror.unregister(client);
            }
            Command::Shutdown => {}
        }
    }

    /// Run a verification on a blocking thread; the result returns to the loop
    fn verify(&self, pending: PendingVerification) {
        let verify_tx = self.verify_tx.clone();
        tokio::task::spawn_blocking(move || {
            let _ = verify_tx.send(pending.run());
        });
    }

    /// Start an unlock session if the device is locked
    fn unlock(&mut self, client: ClientId) -> devlock_core::Result<()> {
        if self.lock.state() != LockState::Locked {
            debug!("{} asked to unlock while {}", client, self.lock.state());
            return Ok(());
        }

        let mut challenge = vec![0u8; 16];
        OsRng.fill_bytes(&mut challenge);
        self.broker.authenticate(
            client,
            AuthPurpose::DeviceUnlock,
            Challenge::new(challenge),
            Methods::ALL,
        )
    }

    fn on_settings_changed(&mut self, change: SettingsChange) {
        debug!("Settings changed: {:?}", change.field);
        if change.field == SettingsField::AutomaticLocking {
            self.refresh_locking();
        }
    }

    fn refresh_locking(&mut self) {
        let locking = effective_locking(&self.settings, &self.lock_code);
        let result = self.lock.on_automatic_locking_changed(locking);
        self.report(result);
    }

    fn report(&self, result: devlock_core::Result<()>) {
        if let Err(e) = result {
            error!("Lock state update failed: {}", e);
        }
    }

    fn properties(&self) -> ServiceProperties {
        let settings = self.settings.current();
        ServiceProperties {
            state: self.lock.state(),
            enabled: self.lock.is_enabled(),
            unlocking: self.lock.is_unlocking(),
            automatic_locking: self.lock.locking(),
            available_methods: self.broker.available_methods(),
            utilized_methods: self.broker.utilized_methods(),
            authenticating: self.broker.is_authenticating(),
            minimum_code_length: settings.minimum_code_length,
            maximum_code_length: settings.maximum_code_length,
            maximum_attempts: settings.max_attempts(),
            code_input_is_keyboard: settings.code_input_is_keyboard,
            lock_code_set: self.lock_code.is_set(),
        }
    }

    /// Route component events and publish property changes
    fn pump(&mut self) {
        self.drain_events();
        self.publish_properties();
    }

    fn publish_properties(&mut self) {
        let current = self.properties();
        for change in self.published.changes(&current) {
            debug!("Property changed: {:?}", change);
            self.send(Audience::Everyone, Signal::Property(change));
        }
        self.published = current;
    }

    fn drain_events(&mut self) {
        loop {
            let mut progressed = false;

            loop {
                match self.lock_rx.try_recv() {
                    Ok(event) => {
                        progressed = true;
                        self.on_lock_event(event);
                    }
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!("Dropped {} device lock events", n);
                    }
                    Err(_) => break,
                }
            }

            // Lock state reaches observers before the signals that follow it
            if progressed {
                self.publish_properties();
            }

            loop {
                match self.broker_rx.try_recv() {
                    Ok(event) => {
                        progressed = true;
                        self.on_broker_event(event);
                    }
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!("Dropped {} broker events", n);
                    }
                    Err(_) => break,
                }
            }

            if !progressed {
                break;
            }
        }
    }

    fn on_lock_event(&mut self, event: DeviceLockEvent) {
        match event {
            DeviceLockEvent::StateChanged(LockState::Locked) => {
                self.broker.cancel_purpose(AuthPurpose::Authentication);
            }
            DeviceLockEvent::StateChanged(LockState::Unlocked) => {
                // A successful unlock session is already gone by now
                self.broker.cancel_purpose(AuthPurpose::DeviceUnlock);
            }
            DeviceLockEvent::TimerArmed(window) => {
                debug!("Relock window {} - {}", window.earliest, window.latest);
            }
            other => debug!("Device lock event: {:?}", other),
        }
    }

    fn on_broker_event(&mut self, event: BrokerEvent) {
        let owner_signal = match &event.kind {
            BrokerEventKind::Started { methods, feedback, .. } => {
                Some(AuthSignal::AuthenticationStarted {
                    methods: *methods,
                    feedback: *feedback,
                })
            }
            BrokerEventKind::Evaluating => Some(AuthSignal::AuthenticationEvaluating),
            BrokerEventKind::Feedback {
                feedback,
                attempts_remaining,
                methods,
            } => Some(AuthSignal::Feedback {
                feedback: *feedback,
                attempts_remaining: *attempts_remaining,
                methods: *methods,
            }),
            BrokerEventKind::Authenticated { token } => Some(AuthSignal::Authenticated {
                token: token.clone(),
            }),
            BrokerEventKind::Error { error } => Some(AuthSignal::Error { error: *error }),
            BrokerEventKind::Unavailable { .. } | BrokerEventKind::Ended { .. } => None,
        };
        if let Some(signal) = owner_signal {
            self.send(Audience::Client(event.client), Signal::Auth(signal));
        }

        if event.purpose == AuthPurpose::DeviceUnlock {
            match event.kind {
                BrokerEventKind::Started { .. } => self.lock.set_unlocking(true),
                BrokerEventKind::Ended { .. } => self.lock.set_unlocking(false),
                _ => {}
            }
        }

        for (observer, signal) in self.mirror.on_broker_event(&event) {
            self.send(Audience::Client(observer), Signal::Input(signal));
        }
    }

    fn send(&self, audience: Audience, signal: Signal) {
        let _ = self.signal_tx.send(Envelope { audience, signal });
    }
}

/// Cloneable handle to the running service
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<Command>,
    signals: broadcast::Sender<Envelope>,
    settings: Arc<SettingsStore>,
    lock_code: Arc<LockCodeStore>,
    manual_environment: Option<Arc<ManualEnvironment>>,
}

impl ServiceHandle {
    /// Receive signals published by the service
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.signals.subscribe()
    }

    async fn call<T>(&self, command: impl FnOnce(Responder<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| DaemonError::ServiceStopped)?;
        let result = rx.await.map_err(|_| DaemonError::ServiceStopped)?;
        Ok(result?)
    }

    pub async fn properties(&self) -> Result<ServiceProperties> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Properties { respond: tx })
            .await
            .map_err(|_| DaemonError::ServiceStopped)?;
        rx.await.map_err(|_| DaemonError::ServiceStopped)
    }

    /// Start a generic authentication session
    pub async fn authenticate(
        &self,
        client: ClientId,
        challenge: Challenge,
        methods: Methods,
    ) -> Result<()> {
        self.call(|respond| Command::Authenticate {
            client,
            challenge,
            methods,
            respond,
        })
        .await
    }

    /// Submit a lock code; the outcome arrives as a signal
    pub async fn enter_code(&self, client: ClientId, code: Zeroizing<String>) -> Result<()> {
        self.call(|respond| Command::EnterCode {
            client,
            code,
            respond,
        })
        .await
    }

    pub async fn cancel(&self, client: ClientId) -> Result<()> {
        self.call(|respond| Command::Cancel { client, respond }).await
    }

    /// Start an unlock session
    pub async fn unlock(&self, client: ClientId) -> Result<()> {
        self.call(|respond| Command::Unlock { client, respond }).await
    }

    /// Guarded lock state change
    pub async fn set_state(&self, state: LockState) -> Result<()> {
        self.call(|respond| Command::SetState { state, respond }).await
    }

    pub async fn register_input(
        &self,
        client: ClientId,
        purpose: AuthPurpose,
    ) -> Result<MirrorState> {
        self.call(|respond| Command::RegisterInput {
            client,
            purpose,
            respond,
        })
        .await
    }

    pub async fn unregister_input(&self, client: ClientId) -> Result<()> {
        self.call(|respond| Command::UnregisterInput { client, respond })
            .await
    }

    pub async fn set_input_active(&self, client: ClientId, active: bool) -> Result<()> {
        self.call(|respond| Command::SetInputActive {
            client,
            active,
            respond,
        })
        .await
    }

    /// Set or replace the lock code
    pub async fn change_lock_code(
        &self,
        current: Option<Zeroizing<String>>,
        new: Zeroizing<String>,
    ) -> Result<()> {
        let store = self.lock_code.clone();
        let settings = self.settings.current();
        tokio::task::spawn_blocking(move || {
            store.change(current.as_deref().map(String::as_str), &new, &settings)
        })
        .await
        .map_err(|e| DaemonError::Store(e.to_string()))??;

        self.call(|respond| Command::LockCodeChanged { respond })
            .await
    }

    /// Remove the lock code, disabling device locking
    pub async fn clear_lock_code(&self, current: Zeroizing<String>) -> Result<()> {
        let store = self.lock_code.clone();
        let settings = self.settings.current();
        tokio::task::spawn_blocking(move || store.clear(&current, &settings))
            .await
            .map_err(|e| DaemonError::Store(e.to_string()))??;

        self.call(|respond| Command::LockCodeChanged { respond })
            .await
    }

    /// Change settings, authorized by a token from a successful authentication
    pub async fn update_settings(
        &self,
        client: ClientId,
        token: String,
        update: SettingsUpdate,
    ) -> Result<()> {
        if update.is_empty() {
            return Err(Error::InvalidArgument("empty settings update".to_string()).into());
        }

        self.call(|respond| Command::RedeemToken {
            client,
            token,
            respond,
        })
        .await?;

        self.settings
            .update(|settings| update.apply(settings))
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        info!("{} updated settings", client);

        self.call(|respond| Command::SettingsUpdated { respond })
            .await
    }

    /// Report an environment signal (development sources only)
    pub async fn report_environment(&self, signal: EnvSignal, value: bool) -> Result<()> {
        let source = self
            .manual_environment
            .as_ref()
            .ok_or_else(|| Error::NotSupported("environment reports are disabled".to_string()))?;
        source.report(signal, value).await;
        Ok(())
    }

    /// Feed a biometric sensor event to the current session
    pub async fn report_biometric(&self, event: BiometricEvent) -> Result<()> {
        self.call(|respond| Command::Biometric { event, respond })
            .await
    }

    /// Check the relock timer now, e.g. after a resume
    pub async fn poll_timer(&self) -> Result<bool> {
        self.call(|respond| Command::PollTimer { respond }).await
    }

    /// The client's connection closed
    pub async fn disconnected(&self, client: ClientId) {
        let _ = self.commands.send(Command::Disconnected { client }).await;
    }

    /// Stop the service loop
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}
