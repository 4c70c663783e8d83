//! Controller-specific error types.
//!
//! Broker errors arrive as [`JetStreamError`] and are classified by the engine;
//! this enum covers everything the controller itself can fail with, and gives
//! each failure a machine-readable reason for status conditions.

use jetstream_client::JetStreamError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the JetStream Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Invalid flags or environment; fatal at startup
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Broker rejected the credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Broker unreachable
    #[error("Network error: {0}")]
    Network(String),

    /// Optimistic concurrency failure writing to the Kubernetes API
    #[error("Conflict writing {0}")]
    Conflict(String),

    /// An immutable broker field differs from the spec
    #[error("Unsupported change: {0}")]
    UnsupportedChange(String),

    /// Some, but not all, broker operations were applied
    #[error("Partial apply: {applied} of {total} operations applied: {message}")]
    PartialApply {
        /// Operations that succeeded
        applied: usize,
        /// Operations planned
        total: usize,
        /// Error from the failing operation
        message: String,
    },

    /// Secret or credential material could not be prepared
    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// JetStream API error
    #[error("JetStream error: {0}")]
    JetStream(#[from] JetStreamError),

    /// Object (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error (credential cache)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Leader election failed or leadership was lost
    #[error("Leader election: {0}")]
    LeaderElection(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Map a Kubernetes write error, turning HTTP 409 into [`ControllerError::Conflict`]
    pub fn from_write(err: KubeError, what: &str) -> Self {
        match &err {
            KubeError::Api(status) if status.code == 409 => ControllerError::Conflict(what.to_string()),
            _ => ControllerError::Kube(err),
        }
    }

    /// Credentials were rejected by the broker
    pub fn is_auth(&self) -> bool {
        match self {
            ControllerError::Auth(_) => true,
            ControllerError::JetStream(e) => e.is_auth(),
            _ => false,
        }
    }

    /// Broker could not be reached
    pub fn is_network(&self) -> bool {
        match self {
            ControllerError::Network(_) => true,
            ControllerError::JetStream(e) => e.is_connection_error(),
            _ => false,
        }
    }

}
