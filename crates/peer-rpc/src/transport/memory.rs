//! In-process transport for tests and simulations.
//!
//! Each registered address is served by a real [`HeartbeatService`] with its
//! own clock. Peers can be told to refuse dials, answer slowly or fail calls.

use super::{RpcConnection, RpcError, Transport, TransportError};
use crate::clock::ManualClock;
use crate::heartbeat::HeartbeatService;
use crate::monitor::OffsetTable;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A simulated peer node.
pub struct InMemoryPeer {
    clock: Arc<ManualClock>,
    offsets: Arc<OffsetTable>,
    service: HeartbeatService,
    refuse_dials: AtomicBool,
    fail_calls: AtomicBool,
    delay: Mutex<Duration>,
    dials: AtomicUsize,
    calls: AtomicUsize,
}

impl InMemoryPeer {
    /// Create a peer whose clock reads `now` nanoseconds.
    pub fn new(now: i64) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let offsets = Arc::new(OffsetTable::new());
        let service = HeartbeatService::new(clock.clone(), offsets.clone());

        Self {
            clock,
            offsets,
            service,
            refuse_dials: AtomicBool::new(false),
            fail_calls: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            dials: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// The peer's clock.
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Offsets this peer recorded from incoming heartbeats.
    pub fn offsets(&self) -> &OffsetTable {
        &self.offsets
    }

    pub fn set_refuse_dials(&self, refuse: bool) {
        self.refuse_dials.store(refuse, Ordering::SeqCst);
    }

    pub fn set_fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every call before it is answered.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Number of dial attempts made against this peer.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Number of calls answered or failed by this peer.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Transport that routes dials to registered [`InMemoryPeer`]s.
#[derive(Default)]
pub struct InMemoryTransport {
    peers: Mutex<HashMap<String, Arc<InMemoryPeer>>>,
    next_port: AtomicUsize,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer under `addr`, replacing any previous one.
    pub fn add_peer(&self, addr: &str, peer: Arc<InMemoryPeer>) {
        self.peers.lock().insert(addr.to_string(), peer);
    }

    pub fn peer(&self, addr: &str) -> Option<Arc<InMemoryPeer>> {
        self.peers.lock().get(addr).cloned()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn RpcConnection>, TransportError> {
        let peer = self
            .peer(addr)
            .ok_or_else(|| TransportError::Refused(format!("no peer at {}", addr)))?;

        peer.dials.fetch_add(1, Ordering::SeqCst);
        if peer.refuse_dials.load(Ordering::SeqCst) {
            return Err(TransportError::Refused(addr.to_string()));
        }

        let port = 40_000 + self.next_port.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryConnection {
            peer,
            local_addr: format!("memory:{}", port),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemoryConnection {
    peer: Arc<InMemoryPeer>,
    local_addr: String,
    closed: AtomicBool,
}

#[async_trait]
impl RpcConnection for InMemoryConnection {
    fn local_addr(&self) -> Option<String> {
        Some(self.local_addr.clone())
    }

    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionClosed);
        }

        let delay = *self.peer.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.peer.calls.fetch_add(1, Ordering::SeqCst);
        if self.peer.fail_calls.load(Ordering::SeqCst) {
            return Err(RpcError::Remote("peer failing calls".into()));
        }

        self.peer.service.handle(method, body)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
