//! IPC client implementation

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use devlock_core::Signal;

use crate::error::{DaemonError, Result};

use super::connection::{ClientStream, DaemonConnector, PlatformConnector};
use super::types::{IpcRequest, IpcResponse, ServerFrame};

/// One-shot IPC client for CLI use
///
/// Every request opens a fresh connection, so each one is a distinct client
/// to the daemon. Use [`IpcSession`] when requests and signals must share an
/// identity.
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create a new IPC client
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send a request and get a response
    pub async fn request(&self, request: &IpcRequest) -> Result<IpcResponse> {
        let mut session = IpcSession::connect(&self.socket_path).await?;
        session.request(request).await
    }

    /// Open a persistent session
    pub async fn session(&self) -> Result<IpcSession> {
        IpcSession::connect(&self.socket_path).await
    }

    /// Check if daemon is running
    pub async fn ping(&self) -> bool {
        matches!(
            self.request(&IpcRequest::Ping).await,
            Ok(IpcResponse::Pong { .. })
        )
    }
}

/// Persistent connection that receives signals between requests
pub struct IpcSession {
    reader: BufReader<ReadHalf<ClientStream>>,
    writer: WriteHalf<ClientStream>,
    signals: VecDeque<Signal>,
}

impl IpcSession {
    /// Connect to the daemon
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = PlatformConnector::connect(path).await?;
        let (reader, writer) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            signals: VecDeque::new(),
        })
    }

    /// Send a request and wait for its response
    ///
    /// Signals arriving in the meantime are queued for [`next_signal`](Self::next_signal).
    pub async fn request(&mut self, request: &IpcRequest) -> Result<IpcResponse> {
        let json = serde_json::to_string(request)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        loop {
            match self.read_frame().await? {
                Some(ServerFrame::Response(response)) => return Ok(response),
                Some(ServerFrame::Signal(signal)) => self.signals.push_back(signal),
                None => {
                    return Err(DaemonError::Ipc(
                        "Connection closed before response".to_string(),
                    ))
                }
            }
        }
    }

    /// Next signal, or None once the daemon closes the connection
    pub async fn next_signal(&mut self) -> Result<Option<Signal>> {
        if let Some(signal) = self.signals.pop_front() {
            return Ok(Some(signal));
        }

        match self.read_frame().await? {
            Some(ServerFrame::Signal(signal)) => Ok(Some(signal)),
            Some(ServerFrame::Response(response)) => Err(DaemonError::Ipc(format!(
                "Unexpected response without request: {:?}",
                response
            ))),
            None => Ok(None),
        }
    }

    async fn read_frame(&mut self) -> Result<Option<ServerFrame>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&line)?))
    }
}
