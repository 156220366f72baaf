//! peer-rpc: Peer connections and clock-offset heartbeats for the node RPC fabric.
//!
//! This crate provides:
//! - A registry of deduplicated, shared connections to peer nodes
//! - Dialing with exponential backoff and a verifying first heartbeat
//! - A periodic heartbeat that doubles as a clock-offset measurement
//! - Transport, clock and offset-monitor trait abstractions

pub mod client;
pub mod clock;
pub mod context;
pub mod heartbeat;
pub mod monitor;
pub mod offset;
pub mod registry;
pub mod retry;
pub mod signal;
pub mod transport;

pub use client::{Client, ClientError, ConnectionState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{DEFAULT_HEARTBEAT_INTERVAL, RpcContext};
pub use heartbeat::{HEARTBEAT_METHOD, HeartbeatService, PingRequest, PingResponse};
pub use monitor::{OffsetTable, RemoteClockMonitor};
pub use offset::RemoteOffset;
pub use registry::ClientRegistry;
pub use retry::{Backoff, RetryOptions};
pub use signal::Signal;
pub use transport::{RpcConnection, RpcError, Transport, TransportError};
