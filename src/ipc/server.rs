//! TCP IPC server: accept loop and per-connection handler.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{
    read_frame, write_frame, Frame, MSG_ERROR, MSG_REQUEST, MSG_RESPONSE, MSG_STREAM_CHUNK,
    MSG_STREAM_END,
};
use crate::ipc::router::{self, DispatchResponse};
use crate::orchestrator::Orchestrator;
use crate::types::IpcConfig;

/// IPC server wrapping the orchestrator.
#[derive(Debug)]
pub struct IpcServer {
    orchestrator: Arc<Orchestrator>,
    addr: SocketAddr,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
}

impl IpcServer {
    pub fn new(orchestrator: Arc<Orchestrator>, addr: SocketAddr, ipc_config: IpcConfig) -> Self {
        Self {
            orchestrator,
            addr,
            cancel: CancellationToken::new(),
            ipc_config,
        }
    }

    /// Bind and run the server until cancelled or a fatal error occurs.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener).await
    }

    /// Run the accept loop on an already bound listener.
    pub async fn serve_on(&self, listener: TcpListener) -> std::io::Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.ipc_config.max_connections));
        tracing::info!(
            "IPC server listening on {} (max_connections={})",
            listener.local_addr()?,
            self.ipc_config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("IPC server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    // Acquire connection permit (backpressure when at capacity).
                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.ipc_config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("IPC connection from {} (active={})",
                        peer,
                        self.ipc_config.max_connections - conn_semaphore.available_permits(),
                    );
                    let connection = Connection {
                        orchestrator: self.orchestrator.clone(),
                        cancel: self.cancel.clone(),
                        ipc_config: self.ipc_config.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = connection.run(stream, permit).await {
                            tracing::warn!("Connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled by [`IpcServer::shutdown`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct Connection {
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
}

impl Connection {
    /// Read frames → route → write responses, one request at a time.
    async fn run(
        self,
        stream: tokio::net::TcpStream,
        _permit: OwnedSemaphorePermit, // held for connection lifetime
    ) -> std::io::Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let read_timeout = Duration::from_secs(self.ipc_config.read_timeout_secs);
        let write_timeout = Duration::from_secs(self.ipc_config.write_timeout_secs);

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = tokio::time::timeout(read_timeout, read_frame(&mut reader, self.ipc_config.max_frame_bytes)) => {
                    match read {
                        Err(_elapsed) => {
                            tracing::debug!("Read timeout ({}s), dropping connection", self.ipc_config.read_timeout_secs);
                            break;
                        }
                        Ok(result) => match result? {
                            Some(frame) => frame,
                            None => break, // clean EOF
                        },
                    }
                }
            };

            if frame.msg_type != MSG_REQUEST {
                let reply = error_reply(
                    "",
                    "INVALID_ARGUMENT",
                    format!("Unexpected message type: 0x{:02X}", frame.msg_type),
                );
                timed_write(&mut writer, &Frame::encode(MSG_ERROR, &reply)?, write_timeout).await?;
                continue;
            }

            let request: Value = match frame.decode() {
                Ok(v) => v,
                Err(e) => {
                    let reply = error_reply("", "INVALID_ARGUMENT", e.to_string());
                    timed_write(&mut writer, &Frame::encode(MSG_ERROR, &reply)?, write_timeout).await?;
                    continue;
                }
            };

            let request_id = request.get("id").and_then(|v| v.as_str()).unwrap_or("");
            let service = request.get("service").and_then(|v| v.as_str()).unwrap_or("");
            let method = request.get("method").and_then(|v| v.as_str()).unwrap_or("");
            let body = request
                .get("body")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

            let result =
                router::route_request(&self.orchestrator, service, method, body, &self.ipc_config).await;

            match result {
                Ok(DispatchResponse::Single(response_body)) => {
                    let reply = json!({
                        "id": request_id,
                        "ok": true,
                        "body": response_body,
                    });
                    timed_write(&mut writer, &Frame::encode(MSG_RESPONSE, &reply)?, write_timeout).await?;
                }
                Ok(DispatchResponse::Stream(mut rx)) => {
                    // Stream chunks until the sender closes or the server stops
                    loop {
                        let chunk = tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            chunk = rx.recv() => match chunk {
                                Some(chunk) => chunk,
                                None => break,
                            },
                        };
                        let reply = json!({ "id": request_id, "body": chunk });
                        timed_write(&mut writer, &Frame::encode(MSG_STREAM_CHUNK, &reply)?, write_timeout)
                            .await?;
                    }
                    let end = json!({ "id": request_id });
                    timed_write(&mut writer, &Frame::encode(MSG_STREAM_END, &end)?, write_timeout).await?;
                }
                Err(e) => {
                    tracing::debug!(
                        "ipc_request_failed: service={}, method={}, error={}",
                        service,
                        method,
                        e
                    );
                    let reply = error_reply(request_id, e.to_ipc_error_code(), e.to_string());
                    timed_write(&mut writer, &Frame::encode(MSG_ERROR, &reply)?, write_timeout).await?;
                }
            }
        }

        Ok(())
    }
}

fn error_reply(request_id: &str, code: &str, message: String) -> Value {
    json!({
        "id": request_id,
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

/// Write a frame with a timeout. Returns an error if the write takes too long
/// (prevents slow consumers from holding connections indefinitely).
async fn timed_write<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, frame))
        .await
        .map_err(|_| {
            tracing::warn!("Write timeout ({}s), dropping connection", timeout.as_secs());
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}
