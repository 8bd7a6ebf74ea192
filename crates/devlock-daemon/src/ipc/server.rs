//! IPC server implementation

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use devlock_core::{ClientId, Error, ErrorKind, PROTOCOL_VERSION};

use crate::error::Result;
use crate::service::{Envelope, ServiceHandle};

use super::connection::{DaemonListener, PlatformListener};
use super::types::{IpcRequest, IpcResponse, ServerFrame};

/// Frames buffered per connection before the writer applies backpressure
const FRAME_QUEUE: usize = 64;

/// IPC server
pub struct IpcServer {
    /// Socket path
    socket_path: PathBuf,

    /// Handle to the lock service
    service: ServiceHandle,

    /// Accept environment and biometric reports from clients
    dev_mode: bool,

    next_client: Arc<AtomicU64>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(socket_path: PathBuf, service: ServiceHandle, dev_mode: bool) -> Self {
        Self {
            socket_path,
            service,
            dev_mode,
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start the IPC server
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then remove the socket
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = PlatformListener::bind(&self.socket_path).await?;
        info!("IPC server listening on {:?}", self.socket_path);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let client = ClientId::new(self.next_client.fetch_add(1, Ordering::Relaxed));
                        debug!("{} connected ({})", client, peer);
                        let service = self.service.clone();
                        let dev_mode = self.dev_mode;

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, client, service, dev_mode).await {
                                error!("Connection error for {}: {}", client, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                },
            }
        }

        listener.cleanup().await?;
        info!("IPC server stopped");
        Ok(())
    }
}

/// Handle a single IPC connection
async fn handle_connection<S>(
    stream: S,
    client: ClientId,
    service: ServiceHandle,
    dev_mode: bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);

    // Subscribe before reading so signals caused by the first request are seen
    let forwarder = tokio::spawn(forward_signals(client, service.subscribe(), frame_tx.clone()));
    let writer_task = tokio::spawn(write_frames(writer, frame_rx));

    let result = read_requests(reader, client, &service, dev_mode, &frame_tx).await;

    forwarder.abort();
    drop(frame_tx);
    service.disconnected(client).await;
    if let Ok(Err(e)) = writer_task.await {
        debug!("Writer for {} stopped: {}", client, e);
    }

    debug!("{} disconnected", client);
    result
}

async fn read_requests<R>(
    reader: R,
    client: ClientId,
    service: &ServiceHandle,
    dev_mode: bool,
    frames: &mpsc::Sender<ServerFrame>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Zeroizing::new(String::new());

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                debug!("Received IPC request from {}: {}", client, request.name());
                handle_request(request, client, service, dev_mode).await
            }
            Err(e) => IpcResponse::Error {
                kind: ErrorKind::InvalidArgument,
                message: format!("Invalid request: {}", e),
            },
        };

        if frames.send(ServerFrame::Response(response)).await.is_err() {
            break;
        }
        line.clear();
    }

    Ok(())
}

/// Handle a single request
async fn handle_request(
    request: IpcRequest,
    client: ClientId,
    service: &ServiceHandle,
    dev_mode: bool,
) -> IpcResponse {
    let result: Result<IpcResponse> = match request {
        IpcRequest::Ping => Ok(IpcResponse::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
        }),

        IpcRequest::GetProperties => service
            .properties()
            .await
            .map(|properties| IpcResponse::Properties { properties }),

        IpcRequest::Authenticate { challenge, methods } => service
            .authenticate(client, challenge, methods)
            .await
            .map(|()| IpcResponse::Ok),

        IpcRequest::EnterLockCode { code } => service
            .enter_code(client, Zeroizing::new(code))
            .await
            .map(|()| IpcResponse::Ok),

        IpcRequest::Cancel => service.cancel(client).await.map(|()| IpcResponse::Ok),

        IpcRequest::Unlock => service.unlock(client).await.map(|()| IpcResponse::Ok),

        IpcRequest::SetState { state } => {
            service.set_state(state).await.map(|()| IpcResponse::Ok)
        }

        IpcRequest::RegisterInput { purpose } => service
            .register_input(client, purpose)
            .await
            .map(IpcResponse::input_registered),

        IpcRequest::UnregisterInput => service
            .unregister_input(client)
            .await
            .map(|()| IpcResponse::Ok),

        IpcRequest::SetInputActive { active } => service
            .set_input_active(client, active)
            .await
            .map(|()| IpcResponse::Ok),

        IpcRequest::ChangeLockCode { current, new } => service
            .change_lock_code(current.map(Zeroizing::new), Zeroizing::new(new))
            .await
            .map(|()| IpcResponse::Ok),

        IpcRequest::ClearLockCode { current } => service
            .clear_lock_code(Zeroizing::new(current))
            .await
            .map(|()| IpcResponse::Ok),

        IpcRequest::UpdateSettings { token, settings } => service
            .update_settings(client, token, settings)
            .await
            .map(|()| IpcResponse::Ok),

        IpcRequest::ReportEnvironment { .. } | IpcRequest::ReportBiometric { .. }
            if !dev_mode =>
        {
            Err(Error::NotSupported("reports require dev mode".to_string()).into())
        }

        IpcRequest::ReportEnvironment { signal, value } => service
            .report_environment(signal, value)
            .await
            .map(|()| IpcResponse::Ok),

        IpcRequest::ReportBiometric { event } => service
            .report_biometric(event)
            .await
            .map(|()| IpcResponse::Ok),
    };

    result.unwrap_or_else(|e| {
        debug!("Request from {} failed: {}", client, e);
        IpcResponse::from_error(&e)
    })
}

/// Forward service signals addressed to `client`
async fn forward_signals(
    client: ClientId,
    mut signals: broadcast::Receiver<Envelope>,
    frames: mpsc::Sender<ServerFrame>,
) {
    loop {
        match signals.recv().await {
            Ok(envelope) if envelope.is_for(client) => {
                if frames.send(ServerFrame::Signal(envelope.signal)).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("{} missed {} signals", client, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::Receiver<ServerFrame>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        send_frame(&mut writer, &frame).await?;
    }
    Ok(())
}

/// Send a frame over the socket
async fn send_frame<W>(writer: &mut W, frame: &ServerFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(frame)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
