//! Transport traits for dialing peers and issuing RPC calls.
//!
//! Implementations:
//! - WebSocket + JSON envelopes (peer-rpc-daemon)
//! - In-memory peers for tests ([`memory`])

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Failure to open a connection. Always retryable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Failure of a single RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Dial primitive: opens a connection to a peer address.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `addr` (host:port or an equivalent endpoint).
    async fn dial(&self, addr: &str) -> Result<Arc<dyn RpcConnection>, TransportError>;
}

/// An open connection capable of issuing RPC calls.
#[async_trait]
pub trait RpcConnection: Send + Sync {
    /// Our local address as observed on this connection.
    fn local_addr(&self) -> Option<String>;

    /// Issue `method` with a JSON body and wait for the peer's answer.
    ///
    /// Completes only when the peer answered or the connection failed.
    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError>;

    /// Release the connection. Pending calls fail with `ConnectionClosed`.
    fn close(&self);
}
