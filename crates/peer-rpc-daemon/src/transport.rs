//! Dialing peers over WebSocket, optionally wrapped in TLS.

use crate::connection::WsConnection;
use async_trait::async_trait;
use peer_rpc::{RpcConnection, Transport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{Connector, MaybeTlsStream, connect_async_tls_with_config};
use tracing::debug;

/// [`Transport`] that opens `ws://` (or `wss://` when TLS is configured)
/// connections to `host:port` addresses.
#[derive(Clone, Default)]
pub struct WsTransport {
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl WsTransport {
    /// Plaintext transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that verifies peers with the given TLS configuration.
    pub fn with_tls(config: Arc<rustls::ClientConfig>) -> Self {
        Self { tls: Some(config) }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    fn url(&self, addr: &str) -> String {
        let scheme = if self.is_tls() { "wss" } else { "ws" };
        format!("{}://{}", scheme, addr)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn RpcConnection>, TransportError> {
        let url = self.url(addr);
        debug!("Dialing {}", url);

        let connector = self.tls.clone().map(Connector::Rustls);
        let (ws_stream, _response) =
            connect_async_tls_with_config(url.as_str(), None, false, connector)
                .await
                .map_err(|e| dial_error(addr, e))?;

        let local_addr = local_addr_of(ws_stream.get_ref());
        Ok(Arc::new(WsConnection::new(addr.to_string(), ws_stream, local_addr)))
    }
}

fn local_addr_of(stream: &MaybeTlsStream<TcpStream>) -> Option<SocketAddr> {
    match stream {
        MaybeTlsStream::Plain(tcp) => tcp.local_addr().ok(),
        MaybeTlsStream::Rustls(tls) => tls.get_ref().0.local_addr().ok(),
        _ => None,
    }
}

fn dial_error(addr: &str, e: WsError) -> TransportError {
    match e {
        WsError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::Refused(addr.to_string())
        }
        WsError::Io(e) => TransportError::Io(e),
        WsError::Tls(e) => TransportError::Tls(e.to_string()),
        WsError::Url(e) => TransportError::InvalidAddress(format!("{}: {}", addr, e)),
        other => TransportError::Other(other.to_string()),
    }
}
