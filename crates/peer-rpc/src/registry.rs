//! Registry of peer clients, one per address.
//!
//! Any number of callers may ask for a client to the same address; the first
//! request creates it and starts its background task, every later request
//! gets the same client back until it closes and leaves the registry.

use crate::client::Client;
use crate::context::RpcContext;
use crate::retry::RetryOptions;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Address -> live client. Held only for lookups, inserts and removals.
pub(crate) type ClientMap = Mutex<HashMap<String, Arc<Client>>>;

/// Process-wide set of deduplicated peer clients.
///
/// Cheap to clone; clones share the same clients. Must be used from within
/// a tokio runtime since new clients spawn their background task.
#[derive(Clone)]
pub struct ClientRegistry {
    clients: Arc<ClientMap>,
    context: RpcContext,
}

impl ClientRegistry {
    pub fn new(context: RpcContext) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            context,
        }
    }

    /// Return the live client for `addr`, creating it if there is none.
    ///
    /// The returned client may still be dialing; use
    /// [`Client::wait_ready`] or [`Client::ready`] to observe readiness.
    /// `opts` only applies when a new client is created.
    pub fn get_or_create(&self, addr: &str, opts: Option<RetryOptions>) -> Arc<Client> {
        let client = {
            let mut clients = self.clients.lock();
            if let Some(existing) = clients.get(addr) {
                return Arc::clone(existing);
            }

            let client = Arc::new(Client::new(
                addr.to_string(),
                self.context.clone(),
                Arc::downgrade(&self.clients),
            ));
            clients.insert(addr.to_string(), Arc::clone(&client));
            client
        };

        debug!("created client for {}", addr);
        client.start(opts.unwrap_or_default());
        client
    }

    /// The live client for `addr`, if any.
    pub fn get(&self, addr: &str) -> Option<Arc<Client>> {
        self.clients.lock().get(addr).cloned()
    }

    /// Addresses with a live client, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<_> = self.clients.lock().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Close every live client.
    pub fn close_all(&self) -> Vec<Arc<Client>> {
        let clients: Vec<_> = self.clients.lock().values().cloned().collect();
        for client in &clients {
            client.close();
        }
        clients
    }

    /// Close every live client and wait for their background tasks to exit.
    ///
    /// A heartbeat in flight is allowed to finish first, so this can take up
    /// to twice the heartbeat interval.
    pub async fn shutdown(&self) {
        for client in self.close_all() {
            if let Some(task) = client.take_task() {
                let _ = task.await;
            }
        }
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("addresses", &self.addresses())
            .finish()
    }
}
