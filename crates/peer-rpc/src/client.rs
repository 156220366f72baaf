//! Connection to a single peer.
//!
//! Each client is driven by one background task that:
//! 1. Dials the peer with exponential backoff
//! 2. Verifies the connection with one heartbeat before signalling ready
//! 3. Heartbeats on a fixed interval, measuring the peer's clock offset
//! 4. Closes the client (and leaves the registry) on the first failed heartbeat
//!
//! A closed client is never reused; the registry creates a fresh one on the
//! next request for the same address.

use crate::context::RpcContext;
use crate::heartbeat::{self, PingRequest};
use crate::offset::RemoteOffset;
use crate::registry::ClientMap;
use crate::retry::{Backoff, RetryOptions};
use crate::signal::Signal;
use crate::transport::{RpcConnection, RpcError, TransportError};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Dial failed: {0}")]
    Dial(#[from] TransportError),

    #[error("Heartbeat failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Not connected")]
    NotConnected,

    #[error("Client closed")]
    Closed,
}

/// Observable lifecycle phase of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; dialing or waiting to redial
    Dialing,
    /// Transport open, first heartbeat not yet answered
    Verifying,
    /// At least one heartbeat succeeded; heartbeating
    Ready,
    /// Permanently closed
    Closed,
}

/// Presence of the transport handle.
enum Link {
    NotConnected,
    Connected(Arc<dyn RpcConnection>),
    Closed,
}

struct ClientState {
    link: Link,
    local_addr: Option<String>,
    healthy: bool,
    offset: RemoteOffset,
}

/// A shared, self-maintaining connection to one peer address.
pub struct Client {
    addr: String,
    context: RpcContext,
    registry: Weak<ClientMap>,
    ready: Signal,
    closed: Signal,
    state: Mutex<ClientState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub(crate) fn new(addr: String, context: RpcContext, registry: Weak<ClientMap>) -> Self {
        Self {
            addr,
            context,
            registry,
            ready: Signal::new(),
            closed: Signal::new(),
            state: Mutex::new(ClientState {
                link: Link::NotConnected,
                local_addr: None,
                healthy: false,
                offset: RemoteOffset::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the background task driving this client.
    pub(crate) fn start(self: &Arc<Self>, opts: RetryOptions) {
        let opts = if opts.tag.is_empty() {
            opts.with_tag(format!("client {} connection", self.addr))
        } else {
            opts
        };
        let handle = tokio::spawn(Arc::clone(self).run(opts));
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    /// Remote address of the peer.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Our local address on the current transport, once established.
    pub fn local_addr(&self) -> Option<String> {
        self.state.lock().local_addr.clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state.lock().link, Link::Connected(_))
    }

    /// Whether the most recent heartbeat completed within the timeout.
    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state.lock().link, Link::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.lock().link {
            Link::Closed => ConnectionState::Closed,
            Link::Connected(_) if self.ready.is_fired() => ConnectionState::Ready,
            Link::Connected(_) => ConnectionState::Verifying,
            Link::NotConnected => ConnectionState::Dialing,
        }
    }

    /// Most recently measured offset of the peer's clock from ours.
    pub fn remote_offset(&self) -> RemoteOffset {
        self.state.lock().offset
    }

    /// Fires once the first heartbeat succeeded.
    pub fn ready(&self) -> &Signal {
        &self.ready
    }

    /// Fires once the client is closed.
    pub fn closed(&self) -> &Signal {
        &self.closed
    }

    /// Wait until the client is ready, or report that it closed first.
    pub async fn wait_ready(&self) -> Result<(), ClientError> {
        tokio::select! {
            biased;
            _ = self.ready.wait() => Ok(()),
            _ = self.closed.wait() => Err(ClientError::Closed),
        }
    }

    /// Close the client and remove it from its registry.
    ///
    /// Idempotent. Only removes the registry entry if it still points at
    /// this client. A heartbeat already in flight is not aborted; its
    /// result is discarded.
    pub fn close(&self) {
        let registry = self.registry.upgrade();
        let mut clients = registry.as_ref().map(|r| r.lock());

        let link = {
            let mut state = self.state.lock();
            if matches!(state.link, Link::Closed) {
                return;
            }
            state.healthy = false;
            std::mem::replace(&mut state.link, Link::Closed)
        };

        if let Some(clients) = clients.as_mut() {
            let is_current = clients
                .get(&self.addr)
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), self));
            if is_current {
                clients.remove(&self.addr);
            }
        }
        drop(clients);

        self.closed.fire();
        if let Link::Connected(conn) = link {
            conn.close();
        }
        info!("client {} closed", self.addr);
    }

    async fn run(self: Arc<Self>, opts: RetryOptions) {
        if self.connect(opts).await {
            self.heartbeat_loop().await;
        }
        debug!("client {} task exiting", self.addr);
    }

    /// Dial until one heartbeat succeeds. Returns false if the client closed.
    async fn connect(&self, opts: RetryOptions) -> bool {
        let mut backoff = Backoff::new(opts);

        loop {
            if self.is_closed() {
                return false;
            }

            match self.try_connect().await {
                Ok(()) => return self.mark_ready(),
                Err(e) => info!("{} failed an attempt: {}", backoff.options().tag, e),
            }

            let Some(delay) = backoff.next_delay() else {
                error!(
                    "client {} failed to connect after {} attempts",
                    self.addr,
                    backoff.attempts()
                );
                self.close();
                return false;
            };

            debug!("{} retrying in {:?}", backoff.options().tag, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.closed.wait() => return false,
            }
        }
    }

    /// Open a transport and verify it with one heartbeat.
    async fn try_connect(&self) -> Result<(), ClientError> {
        let conn = self.context.transport.dial(&self.addr).await?;

        {
            let mut state = self.state.lock();
            if matches!(state.link, Link::Closed) {
                drop(state);
                conn.close();
                return Err(ClientError::Closed);
            }
            state.local_addr = conn.local_addr();
            state.link = Link::Connected(conn);
        }

        if let Err(e) = self.heartbeat().await {
            self.disconnect();
            return Err(e);
        }
        Ok(())
    }

    /// Fire the ready signal unless the client closed meanwhile.
    fn mark_ready(&self) -> bool {
        let state = self.state.lock();
        if !matches!(state.link, Link::Connected(_)) {
            return false;
        }
        // Fired under the state lock so a concurrent close cannot slip in
        // between the check and the signal.
        self.ready.fire();
        drop(state);

        info!("client {} connected", self.addr);
        true
    }

    /// Drop the current transport without closing the client.
    fn disconnect(&self) {
        let conn = {
            let mut state = self.state.lock();
            if !matches!(state.link, Link::Connected(_)) {
                return;
            }
            state.healthy = false;
            state.local_addr = None;
            std::mem::replace(&mut state.link, Link::NotConnected)
        };

        if let Link::Connected(conn) = conn {
            conn.close();
        }
    }

    /// Heartbeat every interval until a heartbeat fails or the client closes.
    async fn heartbeat_loop(&self) {
        info!("client {} starting heartbeat", self.addr);
        let interval = self.context.heartbeat_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.closed.wait() => break,
            }

            if let Err(e) = self.heartbeat().await {
                if !self.is_closed() {
                    info!("client {} heartbeat failed: {}; recycling...", self.addr, e);
                    self.close();
                }
                break;
            }
        }
    }

    /// Send a single heartbeat and record the measured offset.
    ///
    /// If no answer arrives within twice the heartbeat interval the client
    /// is marked unhealthy and the offset becomes infinite, but the call is
    /// still awaited and its outcome decides the result of the round.
    /// A call that completes with an error fails the round without recording
    /// an offset or touching health, since there is no server time to use.
    async fn heartbeat(&self) -> Result<(), ClientError> {
        let (conn, request) = {
            let state = self.state.lock();
            let conn = match &state.link {
                Link::Connected(conn) => Arc::clone(conn),
                Link::NotConnected => return Err(ClientError::NotConnected),
                Link::Closed => return Err(ClientError::Closed),
            };
            let request = PingRequest {
                ping: String::new(),
                offset: state.offset,
                addr: state.local_addr.clone().unwrap_or_default(),
            };
            (conn, request)
        };

        let clock = &self.context.clock;
        let timeout = self.context.heartbeat_timeout();
        let send_time = clock.now();
        let call = heartbeat::ping(conn.as_ref(), &request);
        tokio::pin!(call);

        match tokio::time::timeout(timeout, &mut call).await {
            Ok(result) => {
                let response = result?;
                let receive_time = clock.now();
                let offset = RemoteOffset::measure(send_time, receive_time, response.server_time);
                debug!("client {} heartbeat: {:?}", self.addr, offset);
                self.record_offset(offset, true);
                Ok(())
            }
            Err(_) => {
                self.record_offset(RemoteOffset::infinite(clock.now()), false);
                warn!("client {} unhealthy after {:?}", self.addr, timeout);
                call.await?;
                Ok(())
            }
        }
    }

    fn record_offset(&self, offset: RemoteOffset, healthy: bool) {
        {
            let mut state = self.state.lock();
            if matches!(state.link, Link::Closed) {
                return;
            }
            state.healthy = healthy;
            state.offset = offset;
        }
        self.context.monitor.update_offset(&self.addr, offset);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}
