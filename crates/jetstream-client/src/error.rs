//! JetStream client errors

use thiserror::Error;

/// JetStream error code for "stream not found"
pub const ERR_STREAM_NOT_FOUND: u16 = 10059;

/// JetStream error code for "consumer not found"
pub const ERR_CONSUMER_NOT_FOUND: u16 = 10014;

/// JetStream error code for "JetStream not enabled for account"
pub const ERR_JETSTREAM_NOT_ENABLED: u16 = 10039;

/// Errors that can occur when talking to the JetStream API
#[derive(Debug, Error)]
pub enum JetStreamError {
    /// Could not reach the servers or the connection dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// The request went out but no reply arrived in time
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Credentials, NKey or TLS identity rejected by the server
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The JetStream API answered with an error
    #[error("JetStream API error {code} ({err_code}): {description}")]
    Api {
        /// HTTP-like status code (400, 404, 500, 503, ...)
        code: u16,
        /// JetStream-specific error code
        err_code: u16,
        /// Server-provided description
        description: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading credential or TLS files failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid client-side request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The broker cannot perform the requested change
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl JetStreamError {
    /// The resource does not exist on the broker
    pub fn is_not_found(&self) -> bool {
        match self {
            JetStreamError::Api { code, err_code, .. } => {
                *code == 404 || *err_code == ERR_STREAM_NOT_FOUND || *err_code == ERR_CONSUMER_NOT_FOUND
            }
            _ => false,
        }
    }

    /// The server refused our identity
    pub fn is_auth(&self) -> bool {
        matches!(self, JetStreamError::Authentication(_))
    }

    /// Transport-level failure; the same request may succeed on a fresh connection
    pub fn is_connection_error(&self) -> bool {
        matches!(self, JetStreamError::Connection(_) | JetStreamError::Timeout(_))
    }

    /// JetStream is not enabled for the connected account
    pub fn is_jetstream_disabled(&self) -> bool {
        matches!(self, JetStreamError::Api { err_code, .. } if *err_code == ERR_JETSTREAM_NOT_ENABLED)
    }
}
