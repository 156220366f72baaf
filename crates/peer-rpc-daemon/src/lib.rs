//! peer-rpc-daemon library: WebSocket transport and heartbeat server.
//!
//! The binary wires these into a `ClientRegistry`; integration tests use
//! them directly.

pub mod config;
pub mod connection;
pub mod message;
pub mod server;
pub mod transport;

// Re-export key types for convenience
pub use config::{Args, Config, ConfigError};
pub use connection::WsConnection;
pub use message::{Frame, MAX_FRAME_SIZE};
pub use server::HeartbeatServer;
pub use transport::WsTransport;
