//! Heartbeat RPC messages and the serving side of the protocol.
//!
//! A heartbeat carries the caller's current offset estimate of the peer and
//! the caller's local address; the peer answers with its clock reading.

use crate::clock::Clock;
use crate::monitor::RemoteClockMonitor;
use crate::offset::RemoteOffset;
use crate::transport::{RpcConnection, RpcError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Method identifier of the heartbeat call.
pub const HEARTBEAT_METHOD: &str = "Heartbeat.Ping";

/// Heartbeat request sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    /// Opaque payload echoed back in `pong`
    #[serde(default)]
    pub ping: String,
    /// The caller's current offset estimate of the peer
    pub offset: RemoteOffset,
    /// The caller's local address on this connection
    pub addr: String,
}

/// Heartbeat response sent by the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(default)]
    pub pong: String,
    /// The peer's clock reading, nanoseconds since the Unix epoch
    pub server_time: i64,
}

/// Issue one heartbeat call on `conn`.
pub async fn ping(
    conn: &dyn RpcConnection,
    request: &PingRequest,
) -> Result<PingResponse, RpcError> {
    let body = serde_json::to_value(request)?;
    let reply = conn.call(HEARTBEAT_METHOD, body).await?;
    Ok(serde_json::from_value(reply)?)
}

/// Answers heartbeats from remote clients.
pub struct HeartbeatService {
    clock: Arc<dyn Clock>,
    monitor: Arc<dyn RemoteClockMonitor>,
}

impl HeartbeatService {
    pub fn new(clock: Arc<dyn Clock>, monitor: Arc<dyn RemoteClockMonitor>) -> Self {
        Self { clock, monitor }
    }

    /// Answer a heartbeat.
    ///
    /// The caller's estimate of our offset is recorded, inverted, as our
    /// estimate of the caller's offset.
    pub fn ping(&self, request: PingRequest) -> PingResponse {
        if !request.addr.is_empty() {
            self.monitor
                .update_offset(&request.addr, request.offset.reciprocal());
        }
        debug!("heartbeat from {}", request.addr);

        PingResponse {
            pong: request.ping,
            server_time: self.clock.now(),
        }
    }

    /// Dispatch a raw RPC call by method name.
    pub fn handle(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        if method != HEARTBEAT_METHOD {
            return Err(RpcError::Remote(format!("unknown method: {}", method)));
        }
        let request: PingRequest = serde_json::from_value(body)?;
        Ok(serde_json::to_value(self.ping(request))?)
    }
}
