//! WebSocket server answering heartbeats from peers.
//!
//! Each accepted connection gets its own task that reads request envelopes,
//! dispatches them to the [`HeartbeatService`] and writes back responses.

use crate::message::{Frame, MAX_FRAME_SIZE};
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use peer_rpc::HeartbeatService;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream, accept_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

/// Server side of the heartbeat RPC.
///
/// Dropping the server aborts every connection it accepted.
pub struct HeartbeatServer {
    service: Arc<HeartbeatService>,
    /// Connection tasks indexed by conn_id
    connections: HashMap<String, JoinHandle<()>>,
    /// Counter for generating connection IDs
    next_conn_id: u64,
}

impl HeartbeatServer {
    pub fn new(service: Arc<HeartbeatService>) -> Self {
        Self {
            service,
            connections: HashMap::new(),
            next_conn_id: 1,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Heartbeat server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Take ownership of a new incoming connection (plain TCP, or a stream
    /// the caller already wrapped in TLS).
    ///
    /// The WebSocket upgrade happens on the connection's own task so a slow
    /// client cannot stall the accept loop.
    pub fn accept_connection<S>(&mut self, stream: S, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.connections.retain(|_, task| !task.is_finished());

        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;

        debug!("New connection from {} (conn_id: {})", addr, conn_id);

        let service = self.service.clone();
        let task_conn_id = conn_id.clone();
        let task = tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    // Port scans connect and close without a handshake
                    debug!("WebSocket upgrade failed for {}: {}", addr, e);
                    return;
                }
            };
            Self::serve_connection(task_conn_id, ws_stream, service).await;
        });

        self.connections.insert(conn_id, task);
    }

    /// Accept connections until the listener fails.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            self.accept_connection(stream, addr);
        }
    }

    /// Number of connections still being served.
    pub fn connection_count(&self) -> usize {
        self.connections
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    async fn serve_connection<S>(
        conn_id: String,
        ws_stream: WebSocketStream<S>,
        service: Arc<HeartbeatService>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();

        loop {
            let data = match read.next().await {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", conn_id);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("Connection {} closed", conn_id);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", conn_id, e);
                    break;
                }
            };

            if data.len() > MAX_FRAME_SIZE {
                warn!(
                    "Frame from {} exceeds max size ({} > {}), dropping",
                    conn_id,
                    data.len(),
                    MAX_FRAME_SIZE
                );
                continue;
            }

            let Some(Frame::Request { id, method, body }) = Frame::from_bytes(&data) else {
                warn!("Expected a request from {}, dropping frame", conn_id);
                continue;
            };

            let reply = match service.handle(&method, body) {
                Ok(result) => Frame::ok(id, result),
                Err(e) => {
                    debug!("Call {} from {} failed: {}", method, conn_id, e);
                    Frame::error(id, e.to_string())
                }
            };

            let text = match reply.to_text() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode response for {}: {}", conn_id, e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text.into())).await {
                debug!("Failed to answer {}: {}", conn_id, e);
                break;
            }
        }
    }
}

impl Drop for HeartbeatServer {
    fn drop(&mut self) {
        for task in self.connections.values() {
            task.abort();
        }
    }
}
