//! Broker connection management.
//!
//! Every reconciliation domain (the process-wide global connection, or one
//! Account object) owns at most one live connection. Concurrent callers for
//! the same domain wait on the domain's slot, so only one of them connects.

use crate::error::ControllerError;
use crate::health::HealthState;
use async_trait::async_trait;
use jetstream_client::{ConnectionConfig, JetStreamClient, JetStreamClientTrait, JetStreamError};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Connect attempts before credentials are considered rejected
pub const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Shared handle to a broker connection
pub type ConnectionHandle = Arc<dyn JetStreamClientTrait>;

/// Scope a connection belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionDomain {
    /// Connection configured by process flags
    Global,
    /// Connection described by an Account object
    Account { namespace: String, name: String },
}

impl ConnectionDomain {
    /// Domain of the Account object `namespace/name`
    pub fn account(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ConnectionDomain::Account {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ConnectionDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDomain::Global => write!(f, "global"),
            ConnectionDomain::Account { namespace, name } => write!(f, "account {}/{}", namespace, name),
        }
    }
}

/// Opens broker connections; replaced by a double in tests
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<ConnectionHandle, JetStreamError>;
}

/// Connector backed by a real NATS connection
#[derive(Debug, Default, Clone, Copy)]
pub struct NatsConnector;

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<ConnectionHandle, JetStreamError> {
        let client = JetStreamClient::connect(config).await?;
        Ok(Arc::new(client))
    }
}

enum Slot {
    Empty,
    Connected {
        config: ConnectionConfig,
        client: ConnectionHandle,
    },
    Rejected {
        config: ConnectionConfig,
        message: String,
    },
}

/// Owns one connection per [`ConnectionDomain`]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<ConnectionDomain, Arc<tokio::sync::Mutex<Slot>>>>,
    health: Arc<HealthState>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("domains", &self.domains())
            .finish_non_exhaustive()
    }
}

fn same_client(a: &ConnectionHandle, b: &ConnectionHandle) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

impl ConnectionManager {
    /// Create a manager that flips `health` ready on the first successful connect
    pub fn new(connector: Arc<dyn Connector>, health: Arc<HealthState>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
            health,
        }
    }

    fn slot(&self, domain: &ConnectionDomain) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Slot::Empty)))
            .clone()
    }

    /// Domains that currently have a slot
    pub fn domains(&self) -> Vec<ConnectionDomain> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut domains: Vec<_> = slots.keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Get the live connection for `domain`, connecting if needed.
    ///
    /// A cached connection is reused while its configuration is unchanged.
    /// Rejected credentials fail fast until the configuration changes.
    pub async fn acquire(
        &self,
        domain: &ConnectionDomain,
        config: &ConnectionConfig,
    ) -> Result<ConnectionHandle, ControllerError> {
        let slot = self.slot(domain);
        let mut slot = slot.lock().await;

        match &*slot {
            Slot::Connected { config: current, client } if current == config => {
                return Ok(Arc::clone(client));
            }
            Slot::Rejected { config: current, message } if current == config => {
                return Err(ControllerError::Auth(message.clone()));
            }
            Slot::Connected { .. } | Slot::Rejected { .. } => {
                info!("Connection settings for {} changed, reconnecting", domain);
            }
            Slot::Empty => {}
        }
        *slot = Slot::Empty;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect(config).await {
                Ok(client) => {
                    info!("Connected to {} for {}", config.servers_display(), domain);
                    *slot = Slot::Connected {
                        config: config.clone(),
                        client: Arc::clone(&client),
                    };
                    self.health.set_ready();
                    return Ok(client);
                }
                Err(e) if e.is_auth() => {
                    if attempt >= MAX_AUTH_ATTEMPTS {
                        error!(
                            "Credentials for {} rejected after {} attempts: {}",
                            domain, attempt, e
                        );
                        let message = e.to_string();
                        *slot = Slot::Rejected {
                            config: config.clone(),
                            message: message.clone(),
                        };
                        return Err(ControllerError::Auth(message));
                    }
                    warn!("Authentication for {} failed (attempt {}): {}", domain, attempt, e);
                }
                Err(e) => {
                    warn!("Failed to connect to {} for {}: {}", config.servers_display(), domain, e);
                    return Err(ControllerError::Network(e.to_string()));
                }
            }
        }
    }

    /// Run `f` with a live connection, reconnecting once if the connection broke
    pub async fn with_handle<T, F, Fut>(
        &self,
        domain: &ConnectionDomain,
        config: &ConnectionConfig,
        f: F,
    ) -> Result<T, ControllerError>
    where
        F: Fn(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T, JetStreamError>>,
    {
        let client = self.acquire(domain, config).await?;
        match f(Arc::clone(&client)).await {
            Err(e) if e.is_connection_error() => {
                warn!("Connection for {} looks broken ({}), reconnecting once", domain, e);
                self.invalidate(domain, &client).await;
                let client = self.acquire(domain, config).await?;
                f(client).await.map_err(ControllerError::from)
            }
            result => result.map_err(ControllerError::from),
        }
    }

    /// Drop `client` from `domain` if it is still the cached connection
    pub async fn invalidate(&self, domain: &ConnectionDomain, client: &ConnectionHandle) {
        let slot = self.slot(domain);
        let mut slot = slot.lock().await;
        if let Slot::Connected { client: current, .. } = &*slot
            && same_client(current, client)
        {
            debug!("Dropping stale connection for {}", domain);
            *slot = Slot::Empty;
        }
    }

    /// Forget `domain` entirely (Account deleted)
    pub fn release(&self, domain: &ConnectionDomain) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.remove(domain).is_some() {
            info!("Released connection for {}", domain);
        }
    }

    /// Close every connection
    pub fn shutdown(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let count = slots.len();
        slots.clear();
        info!("Closed {} broker connection(s)", count);
    }
}
