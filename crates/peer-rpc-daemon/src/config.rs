use clap::Parser;
use peer_rpc::RetryOptions;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "peer-rpc-daemon")]
#[command(about = "Peer heartbeat and clock-offset daemon")]
pub struct Args {
    /// Address to listen on for incoming heartbeats
    #[arg(short, long, default_value = "127.0.0.1:26257")]
    pub listen: String,

    /// Peer address (host:port) to keep a connection to; repeatable
    #[arg(short, long = "peer")]
    pub peers: Vec<String>,

    /// Interval between heartbeats in milliseconds
    #[arg(long, default_value_t = 3000)]
    pub heartbeat_interval_ms: u64,

    /// Dial attempts before a peer is given up on (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_attempts: u32,

    /// PEM bundle of trusted CAs; enables TLS when set
    #[arg(long)]
    pub tls_ca: Option<PathBuf>,

    /// Seconds between peer status reports
    #[arg(long, default_value_t = 10)]
    pub report_interval_secs: u64,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub peers: Vec<String>,
    pub heartbeat_interval: Duration,
    /// Retry options for every peer connection
    pub retry: RetryOptions,
    /// Client TLS configuration (None = plaintext)
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub report_interval: Duration,
    pub verbose: bool,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if args.report_interval_secs == 0 {
            return Err(ConfigError::ZeroReportInterval);
        }

        let mut peers = Vec::with_capacity(args.peers.len());
        for peer in args.peers {
            validate_peer(&peer)?;
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }

        let tls = args.tls_ca.as_deref().map(load_tls_config).transpose()?;

        Ok(Self {
            listen: args.listen,
            peers,
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            retry: RetryOptions {
                max_attempts: args.max_attempts,
                ..RetryOptions::default()
            },
            tls,
            report_interval: Duration::from_secs(args.report_interval_secs),
            verbose: args.verbose,
        })
    }
}

/// Peers must be `host:port` with a numeric port.
fn validate_peer(peer: &str) -> Result<(), ConfigError> {
    match peer.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(ConfigError::InvalidPeer(peer.to_string())),
    }
}

/// Read every certificate in a PEM bundle into a root store.
pub fn load_roots(path: &Path) -> Result<rustls::RootCertStore, ConfigError> {
    let pem_error = |source| ConfigError::Pem {
        path: path.to_path_buf(),
        source,
    };

    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(path).map_err(pem_error)? {
        roots.add(cert.map_err(pem_error)?)?;
    }
    if roots.is_empty() {
        return Err(ConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(roots)
}

/// Build a client TLS configuration trusting the CAs in a PEM bundle.
pub fn load_tls_config(path: &Path) -> Result<Arc<rustls::ClientConfig>, ConfigError> {
    let roots = load_roots(path)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeatInterval,

    #[error("report interval must be greater than zero")]
    ZeroReportInterval,

    #[error("invalid peer address {0:?} (expected host:port)")]
    InvalidPeer(String),

    #[error("failed to read CA bundle {path:?}: {source}")]
    Pem {
        path: PathBuf,
        source: rustls::pki_types::pem::Error,
    },

    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}
