//! Transport seam between the lock daemon and its clients
//!
//! The server only needs a listener that yields byte streams together with
//! whatever the platform can tell about the peer; clients only need to open
//! a stream to the daemon.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Process on the other end of a connection, as far as the platform knows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Peer {
    pub uid: Option<u32>,
    pub pid: Option<i32>,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.uid, self.pid) {
            (Some(uid), Some(pid)) => write!(f, "uid {} pid {}", uid, pid),
            (Some(uid), None) => write!(f, "uid {}", uid),
            _ => write!(f, "unknown peer"),
        }
    }
}

/// Where the daemon accepts lock clients
#[async_trait]
pub trait DaemonListener: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Claim the endpoint; fails if another daemon is still serving it
    async fn bind(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Wait for the next client
    async fn accept(&self) -> Result<(Self::Stream, Peer)>;

    /// Release the endpoint so clients see the daemon as stopped
    async fn cleanup(&self) -> Result<()>;
}

/// How clients reach the daemon
#[async_trait]
pub trait DaemonConnector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a connection; a missing or dead endpoint means the daemon is not running
    async fn connect(path: &Path) -> Result<Self::Stream>;
}

#[cfg(unix)]
pub use super::unix::{UnixConnector as PlatformConnector, UnixListener as PlatformListener};

/// Stream type of client connections
pub type ClientStream = <PlatformConnector as DaemonConnector>::Stream;
