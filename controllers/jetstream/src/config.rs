//! Command-line and environment configuration.
//!
//! Flags are parsed with clap and then validated into an immutable
//! [`ControllerConfig`] that the rest of the controller reads.

use crate::error::ControllerError;
use clap::{Parser, ValueEnum};
use jetstream_client::ConnectionConfig;
use jetstream_client::config::DEFAULT_CLIENT_NAME;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// JetStream controller for Kubernetes
#[derive(Debug, Clone, Parser)]
#[command(name = "jetstream-controller", version, about)]
pub struct Args {
    /// Restrict the controller to one namespace (all namespaces when empty)
    #[arg(long, env = "NAMESPACE", default_value = "")]
    pub namespace: String,

    /// NATS user credentials file for the global connection
    #[arg(long, env = "NATS_CREDS")]
    pub creds: Option<PathBuf>,

    /// NATS NKey seed file for the global connection
    #[arg(long, env = "NATS_NKEY")]
    pub nkey: Option<PathBuf>,

    /// Client certificate for mutual TLS
    #[arg(long, env = "NATS_TLS_CERT")]
    pub tlscert: Option<PathBuf>,

    /// Client private key for mutual TLS
    #[arg(long, env = "NATS_TLS_KEY")]
    pub tlskey: Option<PathBuf>,

    /// Trusted root CA bundle (repeatable)
    #[arg(long, env = "NATS_TLS_CA", value_delimiter = ',')]
    pub tlsca: Vec<PathBuf>,

    /// Perform the TLS handshake before the NATS protocol exchange
    #[arg(long, env = "NATS_TLS_FIRST")]
    pub tlsfirst: bool,

    /// NATS server URLs, comma separated
    #[arg(short = 's', long = "server", env = "NATS_SERVER", value_delimiter = ',')]
    pub servers: Vec<String>,

    /// Take connection details from Account objects only
    #[arg(long, env = "CRD_CONNECT")]
    pub crd_connect: bool,

    /// Interval between full passes of the legacy loop
    #[arg(long, env = "CLEANUP_PERIOD", default_value = "30s", value_parser = humantime::parse_duration)]
    pub cleanup_period: Duration,

    /// Compute and report changes without touching the broker or the API server
    #[arg(long, env = "READ_ONLY")]
    pub read_only: bool,

    /// Directory for materialized credentials (temporary when empty)
    #[arg(long, env = "CACHE_DIR", default_value = "")]
    pub cache_dir: String,

    /// Use the watch-driven managed loop instead of the legacy loop
    #[arg(long, env = "CONTROL_LOOP")]
    pub control_loop: bool,

    /// Resync period of the managed loop
    #[arg(long, env = "SYNC_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub sync_interval: Duration,

    /// Concurrent reconciliation workers
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Bind address of the health endpoints
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    pub health_addr: SocketAddr,

    /// Elect a leader before reconciling (managed loop only)
    #[arg(long, env = "LEADER_ELECTION", default_value_t = true, action = clap::ArgAction::Set)]
    pub leader_election: bool,

    /// Lease used for leader election
    #[arg(long, env = "LEASE_NAME", default_value = "jetstream-controller-leader")]
    pub lease_name: String,

    /// Namespace of the election lease (POD_NAMESPACE, then `default`)
    #[arg(long, env = "LEASE_NAMESPACE")]
    pub lease_namespace: Option<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Leader election settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub duration: Duration,
    pub grace: Duration,
}

/// Validated controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace filter, `None` watches all namespaces
    pub namespace: Option<String>,
    /// Global connection, `None` with `--crd-connect` and no servers
    pub global: Option<ConnectionConfig>,
    /// Objects connect only through Accounts (legacy loop only)
    pub crd_connect: bool,
    pub cleanup_period: Duration,
    pub read_only: bool,
    /// Credential cache directory, `None` for a temporary one
    pub cache_dir: Option<PathBuf>,
    pub control_loop: bool,
    pub sync_interval: Duration,
    pub workers: usize,
    pub health_addr: SocketAddr,
    /// Leader election, `None` when disabled
    pub lease: Option<LeaseConfig>,
}

impl Args {
    /// Check flag combinations and build the controller configuration
    pub fn validate(self) -> Result<ControllerConfig, ControllerError> {
        if self.servers.is_empty() && !self.crd_connect {
            return Err(ControllerError::Config(
                "no NATS server given: pass --server or enable --crd-connect".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ControllerError::Config("--workers must be at least 1".to_string()));
        }
        if self.cleanup_period.is_zero() {
            return Err(ControllerError::Config("--cleanup-period must be positive".to_string()));
        }
        if self.sync_interval.is_zero() {
            return Err(ControllerError::Config("--sync-interval must be positive".to_string()));
        }
        if self.tlscert.is_some() != self.tlskey.is_some() {
            return Err(ControllerError::Config(
                "--tlscert and --tlskey must be given together".to_string(),
            ));
        }
        if self.creds.is_some() && self.nkey.is_some() {
            return Err(ControllerError::Config(
                "--creds and --nkey are mutually exclusive".to_string(),
            ));
        }

        let global = (!self.servers.is_empty()).then(|| ConnectionConfig {
            credentials_file: self.creds.clone(),
            nkey_seed_file: self.nkey.clone(),
            tls_client_cert: self.tlscert.clone(),
            tls_client_key: self.tlskey.clone(),
            tls_root_cas: self.tlsca.clone(),
            tls_first: self.tlsfirst,
            ..ConnectionConfig::new(self.servers.clone())
        });

        let lease = (self.control_loop && self.leader_election).then(|| {
            let namespace = self
                .lease_namespace
                .clone()
                .or_else(|| std::env::var("POD_NAMESPACE").ok())
                .unwrap_or_else(|| "default".to_string());
            let identity = std::env::var("POD_NAME")
                .unwrap_or_else(|_| format!("{}-{}", DEFAULT_CLIENT_NAME, uuid::Uuid::new_v4()));
            LeaseConfig {
                name: self.lease_name.clone(),
                namespace,
                identity,
                duration: Duration::from_secs(15),
                grace: Duration::from_secs(2),
            }
        });

        Ok(ControllerConfig {
            namespace: Some(self.namespace).filter(|n| !n.is_empty()),
            global,
            crd_connect: self.crd_connect && !self.control_loop,
            cleanup_period: self.cleanup_period,
            read_only: self.read_only,
            cache_dir: Some(self.cache_dir).filter(|d| !d.is_empty()).map(PathBuf::from),
            control_loop: self.control_loop,
            sync_interval: self.sync_interval,
            workers: self.workers,
            health_addr: self.health_addr,
            lease,
        })
    }
}
