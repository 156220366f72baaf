//! Outgoing RPC connection over a WebSocket.
//!
//! The stream is split: a write task drains an outbound queue, a read task
//! routes responses back to the caller waiting on the matching request id.

use crate::message::{Frame, MAX_FRAME_SIZE};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use peer_rpc::{RpcConnection, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// Client-side WebSocket stream, plain or TLS.
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type CallResult = Result<Value, RpcError>;

/// Calls awaiting a response, by request id.
type PendingCalls = Mutex<HashMap<u64, oneshot::Sender<CallResult>>>;

/// State shared with the read task.
struct Shared {
    pending: PendingCalls,
    closed: AtomicBool,
}

impl Shared {
    /// Mark the connection closed and fail every waiting call.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }
}

/// A multiplexed RPC connection to one peer.
pub struct WsConnection {
    /// Peer address this connection was dialed to
    addr: String,
    /// Our end of the TCP connection
    local_addr: Option<SocketAddr>,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Message>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsConnection {
    /// Wrap an established WebSocket stream.
    ///
    /// Spawns the read and write tasks, so must be called inside a runtime.
    pub fn new(addr: String, ws_stream: ClientStream, local_addr: Option<SocketAddr>) -> Self {
        let (write, read) = ws_stream.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        // Exits once every sender is dropped or a close frame went out
        tokio::spawn(Self::write_loop(addr.clone(), write, outgoing_rx));
        let read_task = tokio::spawn(Self::read_loop(addr.clone(), read, shared.clone()));

        Self {
            addr,
            local_addr,
            next_id: AtomicU64::new(1),
            shared,
            outgoing,
            read_task: Mutex::new(Some(read_task)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn write_loop(
        addr: String,
        mut write: SplitSink<ClientStream, Message>,
        mut outgoing: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = outgoing.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                debug!("Write to {} failed: {}", addr, e);
                break;
            }
            if is_close {
                break;
            }
        }
    }

    /// Read loop that completes pending calls with their responses.
    async fn read_loop(addr: String, mut read: SplitStream<ClientStream>, shared: Arc<Shared>) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data.to_vec(),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", addr);
                            break;
                        }
                    };

                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            "Frame from {} exceeds max size ({} > {}), dropping",
                            addr,
                            data.len(),
                            MAX_FRAME_SIZE
                        );
                        continue;
                    }

                    match Frame::from_bytes(&data) {
                        Some(Frame::Response { id, result, error }) => {
                            let Some(tx) = shared.pending.lock().remove(&id) else {
                                debug!("Response from {} for unknown call {}", addr, id);
                                continue;
                            };
                            let outcome = match error {
                                Some(message) => Err(RpcError::Remote(message)),
                                None => Ok(result.unwrap_or(Value::Null)),
                            };
                            let _ = tx.send(outcome);
                        }
                        Some(Frame::Request { method, .. }) => {
                            warn!("Unexpected request {} from {}, ignoring", method, addr);
                        }
                        None => {
                            warn!("Malformed frame from {} ({} bytes)", addr, data.len());
                        }
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection to {} closed", addr);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", addr, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection to {} stream ended", addr);
                    break;
                }
            }
        }

        shared.shut();
    }
}

#[async_trait]
impl RpcConnection for WsConnection {
    fn local_addr(&self) -> Option<String> {
        self.local_addr.map(|addr| addr.to_string())
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let text = Frame::request(id, method, body).to_text()?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        // The read task sets `closed` before draining, so a call registered
        // after the drain sees the flag here.
        if self.is_closed() {
            self.shared.pending.lock().remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        if self.outgoing.send(Message::Text(text.into())).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(RpcError::SendFailed(format!("writer for {} has stopped", self.addr)));
        }

        rx.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing connection to {}", self.addr);

        let _ = self.outgoing.send(Message::Close(None));
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        self.shared.shut();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("addr", &self.addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
