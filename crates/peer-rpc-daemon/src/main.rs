//! peer-rpc-daemon: keeps heartbeat connections to a set of peers and
//! reports their health and clock offsets.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use peer_rpc::{
    ClientRegistry, Clock, HeartbeatService, OffsetTable, RpcContext, SystemClock, Transport,
};
use peer_rpc_daemon::{Args, Config, HeartbeatServer, WsTransport};

/// Log the state of every configured peer.
///
/// Peers whose client was recycled get a fresh one here.
fn report_peers(registry: &ClientRegistry, config: &Config, offsets: &OffsetTable) {
    for peer in &config.peers {
        let client = registry.get_or_create(peer, Some(config.retry.clone()));
        let offset = client.remote_offset();

        if client.is_healthy() {
            info!(
                "peer {} healthy: offset={}ns error={}ns",
                peer, offset.offset, offset.error
            );
        } else if offset.is_infinite() {
            warn!("peer {} unhealthy: heartbeat timed out", peer);
        } else {
            info!("peer {} not healthy ({:?})", peer, client.state());
        }
    }

    for (addr, offset) in offsets.snapshot() {
        debug!(
            "offset table: {} offset={}ns error={}ns",
            addr, offset.offset, offset.error
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,peer_rpc=debug,peer_rpc_daemon=debug"
    } else {
        "info,peer_rpc=info,peer_rpc_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_args(args)?;

    info!("Starting peer-rpc-daemon");
    info!("Listen address: {}", config.listen);
    info!(
        "Heartbeat interval: {:?}, peers: {:?}, tls: {}",
        config.heartbeat_interval,
        config.peers,
        config.tls.is_some()
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let offsets = Arc::new(OffsetTable::new());

    let transport: Arc<dyn Transport> = match &config.tls {
        Some(tls) => Arc::new(WsTransport::with_tls(tls.clone())),
        None => Arc::new(WsTransport::new()),
    };
    let context = RpcContext::new(transport, clock.clone(), offsets.clone())
        .with_heartbeat_interval(config.heartbeat_interval);
    let registry = ClientRegistry::new(context);

    let service = Arc::new(HeartbeatService::new(clock, offsets.clone()));
    let listener = HeartbeatServer::bind(&config.listen).await?;
    let mut server = HeartbeatServer::new(service);

    for peer in &config.peers {
        registry.get_or_create(peer, Some(config.retry.clone()));
    }

    info!("Daemon running. Press Ctrl+C to stop.");

    let mut report = tokio::time::interval(config.report_interval);
    // The first tick completes immediately
    report.tick().await;

    // Main event loop
    loop {
        tokio::select! {
            // Accept new heartbeat connections
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => server.accept_connection(stream, addr),
                    Err(e) => warn!("Failed to accept connection: {}", e),
                }
            }

            _ = report.tick() => {
                report_peers(&registry, &config, &offsets);
                debug!("serving {} inbound connections", server.connection_count());
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Closing {} peer clients", registry.len());
    registry.shutdown().await;
    drop(server);

    info!("Shutting down");
    Ok(())
}
