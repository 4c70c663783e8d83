//! Connection settings for a JetStream client

use std::path::PathBuf;
use std::time::Duration;

/// Default NATS client name reported to the server
pub const DEFAULT_CLIENT_NAME: &str = "jetstream-controller";

/// Everything needed to open an authenticated NATS connection.
///
/// Two configs compare equal exactly when they would produce the same
/// connection, which lets callers detect that a cached connection is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Name reported in the CONNECT handshake
    pub client_name: String,
    /// Server URLs (`nats://`, `tls://`)
    pub servers: Vec<String>,
    /// User credentials file (JWT + seed)
    pub credentials_file: Option<PathBuf>,
    /// NKey seed file
    pub nkey_seed_file: Option<PathBuf>,
    /// Client certificate for mutual TLS
    pub tls_client_cert: Option<PathBuf>,
    /// Client private key for mutual TLS
    pub tls_client_key: Option<PathBuf>,
    /// Trusted root CA bundles
    pub tls_root_cas: Vec<PathBuf>,
    /// TLS handshake before the NATS INFO exchange
    pub tls_first: bool,
    /// Timeout for a single API request
    pub request_timeout: Duration,
}

impl ConnectionConfig {
    /// Plain connection to the given servers
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            servers,
            credentials_file: None,
            nkey_seed_file: None,
            tls_client_cert: None,
            tls_client_key: None,
            tls_root_cas: Vec::new(),
            tls_first: false,
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Comma-joined server list for log messages
    pub fn servers_display(&self) -> String {
        self.servers.join(",")
    }
}
