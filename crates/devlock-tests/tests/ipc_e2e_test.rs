//! End-to-end tests over the IPC socket
//!
//! A real server on a temporary socket, driven through the CLI client.

mod common;

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use devlock_cli::{ClientError, DevlockClient};
use devlock_core::{
    AutomaticLocking, Challenge, EnvSignal, ErrorKind, LockState, PropertyChange, Signal,
    PROTOCOL_VERSION,
};
use devlock_daemon::ipc::{IpcClient, IpcRequest, IpcResponse, IpcServer};
use devlock_daemon::{LockSettings, SettingsUpdate};

use common::{in_use, Daemon, CODE};

struct Server {
    socket: PathBuf,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn serve(daemon: &Daemon, dev_mode: bool) -> Server {
    let socket = daemon.dir.path().join("devlock.sock");
    let server = IpcServer::new(socket.clone(), daemon.handle.clone(), dev_mode);
    let (stop, stopped) = oneshot::channel();

    let task = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });

    wait_for_socket(&socket).await;
    Server { socket, stop, task }
}

async fn wait_for_socket(socket: &Path) {
    let client = IpcClient::new(socket.to_path_buf());
    for _ in 0..200 {
        if client.ping().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not come up at {:?}", socket);
}

impl Server {
    async fn stop(self) {
        let _ = self.stop.send(());
        self.task.await.unwrap();
        assert!(!self.socket.exists());
    }
}

#[tokio::test]
async fn test_lock_code_lifecycle_over_ipc() {
    let daemon = Daemon::start(LockSettings::default(), None, in_use()).await;
    let server = serve(&daemon, false).await;
    let client = DevlockClient::with_socket_path(server.socket.clone());

    let info = client.ping().await.unwrap();
    assert_eq!(info.protocol, PROTOCOL_VERSION);

    // No code yet: locking is not in use
    let props = client.properties().await.unwrap();
    assert!(!props.enabled);
    assert!(!props.lock_code_set);
    assert!(matches!(
        client.lock().await,
        Err(ClientError::RequestFailed {
            kind: ErrorKind::AccessDenied,
            ..
        })
    ));

    // Too short for the default minimum length
    assert!(matches!(
        client.change_lock_code(None, "12").await,
        Err(ClientError::RequestFailed {
            kind: ErrorKind::InvalidArgument,
            ..
        })
    ));

    client.change_lock_code(None, CODE).await.unwrap();
    let props = client.properties().await.unwrap();
    assert!(props.enabled);
    assert!(props.lock_code_set);

    client.lock().await.unwrap();
    assert_eq!(client.properties().await.unwrap().state, LockState::Locked);

    assert!(matches!(
        client.unlock("13579").await,
        Err(ClientError::IncorrectCode {
            attempts_remaining: Some(4)
        })
    ));

    assert!(client.unlock(CODE).await.unwrap());
    assert_eq!(
        client.properties().await.unwrap().state,
        LockState::Unlocked
    );
    assert!(!client.unlock(CODE).await.unwrap());

    // Settings change authorized by the code
    client
        .update_settings(
            Challenge::new(vec![0xab; 16]),
            CODE,
            SettingsUpdate {
                automatic_locking: Some(AutomaticLocking::Immediate),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        client.properties().await.unwrap().automatic_locking,
        AutomaticLocking::Immediate
    );

    client.clear_lock_code(CODE).await.unwrap();
    let props = client.properties().await.unwrap();
    assert!(!props.enabled);
    assert_eq!(props.automatic_locking, AutomaticLocking::Disabled);

    server.stop().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_reports_require_dev_mode() {
    let daemon = Daemon::start(LockSettings::default(), Some(CODE), in_use()).await;
    let server = serve(&daemon, false).await;
    let client = DevlockClient::with_socket_path(server.socket.clone());

    assert!(matches!(
        client.report_environment(EnvSignal::Display, false).await,
        Err(ClientError::RequestFailed {
            kind: ErrorKind::NotSupported,
            ..
        })
    ));

    server.stop().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_session_receives_property_signals() {
    let settings = LockSettings {
        automatic_locking: AutomaticLocking::Immediate,
        ..LockSettings::default()
    };
    let daemon = Daemon::start(settings, Some(CODE), in_use()).await;
    let server = serve(&daemon, true).await;
    let client = DevlockClient::with_socket_path(server.socket.clone());

    assert!(client.unlock(CODE).await.unwrap());

    let mut watcher = client.session().await.unwrap();
    // A request round-trip guarantees the watcher is subscribed
    assert_eq!(
        watcher.properties().await.unwrap().state,
        LockState::Unlocked
    );

    client
        .report_environment(EnvSignal::Display, false)
        .await
        .unwrap();

    loop {
        let signal = tokio::time::timeout(Duration::from_secs(5), watcher.next_signal())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if signal == Signal::Property(PropertyChange::State(LockState::Locked)) {
            break;
        }
    }

    server.stop().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_failed_request_keeps_connection() {
    let daemon = Daemon::start(LockSettings::default(), None, in_use()).await;
    let server = serve(&daemon, false).await;

    let mut session = IpcClient::new(server.socket.clone()).session().await.unwrap();
    let response = session
        .request(&IpcRequest::SetInputActive { active: true })
        .await
        .unwrap();
    assert!(matches!(
        response,
        IpcResponse::Error {
            kind: ErrorKind::InvalidArgument,
            ..
        }
    ));

    // The connection stays usable
    assert!(matches!(
        session.request(&IpcRequest::Ping).await.unwrap(),
        IpcResponse::Pong { .. }
    ));

    server.stop().await;
    daemon.stop().await;
}
