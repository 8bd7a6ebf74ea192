//! Unix domain socket endpoint of the lock daemon

use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::error::{DaemonError, Result};

use super::connection::{DaemonConnector, DaemonListener, Peer};

/// Any local user may talk to the lock daemon; requests are authorized per
/// operation, not per socket.
const SOCKET_MODE: u32 = 0o666;

/// Listening socket of a running daemon
pub struct UnixListener {
    listener: tokio::net::UnixListener,
    socket_path: PathBuf,
}

#[async_trait]
impl DaemonListener for UnixListener {
    type Stream = UnixStream;

    async fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            // Two daemons would each hold their own lock state
            if UnixStream::connect(path).await.is_ok() {
                return Err(DaemonError::Ipc(format!(
                    "Another devlock daemon is serving {:?}",
                    path
                )));
            }
            info!("Removing stale socket {:?}", path);
            std::fs::remove_file(path)?;
        }

        let listener = tokio::net::UnixListener::bind(path)
            .map_err(|e| DaemonError::Ipc(format!("Failed to bind {:?}: {}", path, e)))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    async fn accept(&self) -> Result<(Self::Stream, Peer)> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| DaemonError::Ipc(format!("Accept failed: {}", e)))?;

        let peer = match stream.peer_cred() {
            Ok(cred) => Peer {
                uid: Some(cred.uid()),
                pid: cred.pid(),
            },
            Err(e) => {
                debug!("No peer credentials: {}", e);
                Peer::default()
            }
        };
        Ok((stream, peer))
    }

    async fn cleanup(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
            debug!("Removed socket {:?}", self.socket_path);
        }
        Ok(())
    }
}

/// Client side of the daemon socket
pub struct UnixConnector;

#[async_trait]
impl DaemonConnector for UnixConnector {
    type Stream = UnixStream;

    async fn connect(path: &Path) -> Result<Self::Stream> {
        UnixStream::connect(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                DaemonError::Ipc("Daemon not running".to_string())
            }
            _ => DaemonError::Ipc(format!("Failed to connect to {:?}: {}", path, e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_socket_is_world_writable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devlock.sock");
        let _listener = UnixListener::bind(&path).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SOCKET_MODE);
    }

    #[tokio::test]
    async fn test_live_socket_is_not_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devlock.sock");
        let first = UnixListener::bind(&path).await.unwrap();

        assert!(matches!(
            UnixListener::bind(&path).await,
            Err(DaemonError::Ipc(_))
        ));

        first.cleanup().await.unwrap();
        assert!(!path.exists());
        UnixListener::bind(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devlock.sock");

        // Bound and dropped without cleanup, as after a crash
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        UnixListener::bind(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_reports_peer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devlock.sock");
        let listener = UnixListener::bind(&path).await.unwrap();

        let _client = UnixConnector::connect(&path).await.unwrap();
        let (_stream, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.pid, Some(std::process::id() as i32));
    }

    #[tokio::test]
    async fn test_missing_socket_means_not_running() {
        let dir = tempdir().unwrap();
        let result = UnixConnector::connect(&dir.path().join("absent.sock")).await;
        assert!(matches!(result, Err(DaemonError::Ipc(msg)) if msg == "Daemon not running"));
    }
}
