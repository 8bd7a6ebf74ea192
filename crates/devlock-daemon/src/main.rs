//! devlock Daemon - Main entry point
//!
//! The daemon owns the device lock state and brokers authentication for
//! local clients.

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devlock_daemon::{
    DaemonConfig, DeviceLockService, EnvironmentMonitor, EnvironmentSource, IpcServer,
    LockCodeStore, ManualEnvironment, ServiceDeps, SettingsStore, SystemClock,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devlock_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting devlock daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load or create config
    let config_path = std::env::var("DEVLOCK_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| DaemonConfig::default_path());

    let config = DaemonConfig::load_or_create(&config_path)?;
    info!("Using config at {:?}", config_path);

    // Ensure directories exist
    config.ensure_directories()?;

    // Initialize components
    let settings = Arc::new(SettingsStore::open(config.settings_path())?);
    let lock_code = Arc::new(LockCodeStore::open(config.lock_code_path())?);

    // Environment signals arrive as reports until a platform source is wired in
    let manual_environment = Arc::new(ManualEnvironment::default());
    let source: Arc<dyn EnvironmentSource> = manual_environment.clone();
    let monitor = Arc::new(EnvironmentMonitor::new(source));
    let updates = monitor.start().await?;

    if config.dev_mode {
        warn!("Dev mode: accepting environment and biometric reports over IPC");
    }

    let service = DeviceLockService::spawn(ServiceDeps {
        settings: Arc::clone(&settings),
        lock_code,
        environment: monitor.subscribe(),
        manual_environment: config.dev_mode.then(|| Arc::clone(&manual_environment)),
        clock: Arc::new(SystemClock),
        biometric_enabled: config.biometric_enabled,
    });

    // Follow environment changes in background
    let monitor_handle = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            if let Err(e) = monitor.follow(updates).await {
                error!("Environment monitor error: {}", e);
            }
        })
    };

    let ipc_server = IpcServer::new(config.ipc_socket_path.clone(), service.clone(), config.dev_mode);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    // Start IPC server
    let mut ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
        {
            error!("IPC server error: {}", e);
        }
    });

    info!("Daemon started successfully");

    // Wait for shutdown signal
    let ipc_running = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            true
        }
        _ = monitor_handle => {
            error!("Environment monitor exited unexpectedly");
            true
        }
        _ = &mut ipc_handle => {
            error!("IPC server exited unexpectedly");
            false
        }
    };

    info!("Daemon shutting down");

    if ipc_running {
        let _ = stop_tx.send(());
        let _ = ipc_handle.await;
    }
    service.shutdown().await;
    settings.shutdown()?;

    Ok(())
}
