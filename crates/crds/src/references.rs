//! Secret references for Account connection settings
//!
//! Account objects never carry credentials inline. They point at Kubernetes
//! Secrets in their own namespace, and the controller materializes the
//! referenced keys as files before connecting.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a Secret in the same namespace as the referencing object
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the Secret
    pub name: String,
}

/// NATS user credentials (JWT + NKey seed) stored in a Secret
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredsSecret {
    /// Secret holding the credentials file
    pub secret: SecretReference,

    /// Key inside the Secret whose value is the `.creds` file
    pub file: String,
}

/// TLS material stored in a Secret
///
/// Each field names a key in the Secret. `client_cert` and `client_key` must be
/// set together for mutual TLS.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecret {
    /// Secret holding the TLS files
    pub secret: SecretReference,

    /// Key of the client certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,

    /// Key of the client private key (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,

    /// Keys of trusted root CA bundles (PEM)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub root_cas: Vec<String>,
}

impl SecretReference {
    /// Create a reference to the named Secret
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
