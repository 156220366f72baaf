//! Collaborators shared by every client of a registry.

use crate::clock::Clock;
use crate::monitor::RemoteClockMonitor;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Injected collaborators for dialing and heartbeating peers.
#[derive(Clone)]
pub struct RpcContext {
    /// Dial primitive (TLS, if any, is configured inside the transport)
    pub transport: Arc<dyn Transport>,
    /// Local clock used for offset measurement
    pub clock: Arc<dyn Clock>,
    /// Receives every offset measurement, keyed by peer address
    pub monitor: Arc<dyn RemoteClockMonitor>,
    /// Interval between heartbeats; a heartbeat times out after twice this
    pub heartbeat_interval: Duration,
}

impl RpcContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        monitor: Arc<dyn RemoteClockMonitor>,
    ) -> Self {
        Self {
            transport,
            clock,
            monitor,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// How long a heartbeat may take before the peer is considered unhealthy.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}
