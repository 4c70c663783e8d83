//! Account CRD
//!
//! An Account is a connection domain: it names the NATS servers and the
//! credentials used for every Stream, Consumer and StreamTemplate that
//! references it, and optionally pins the JetStream limits the account is
//! expected to have.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::ResourceStatus;
use crate::references::{CredsSecret, TlsSecret};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "jetstream.nats.io",
    version = "v1beta2",
    kind = "Account",
    namespaced,
    status = "ResourceStatus",
    shortname = "jsa"
)]
#[serde(rename_all = "camelCase")]
pub struct AccountSpec {
    /// Broker-side account name (defaults to metadata.name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// NATS server URLs; falls back to the controller's global servers when empty
    #[serde(default)]
    pub servers: Vec<String>,

    /// User credentials file stored in a Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creds: Option<CredsSecret>,

    /// TLS material stored in a Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSecret>,

    /// Perform the TLS handshake before the NATS protocol handshake
    #[serde(default)]
    pub tls_first: bool,

    /// Expected JetStream limits for the account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<AccountLimitsSpec>,
}

/// JetStream resource limits. Unset fields are not managed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountLimitsSpec {
    /// Maximum memory storage in bytes (-1 for unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<i64>,

    /// Maximum file storage in bytes (-1 for unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_storage: Option<i64>,

    /// Maximum number of streams (-1 for unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_streams: Option<i64>,

    /// Maximum number of consumers (-1 for unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consumers: Option<i64>,
}

impl Account {
    /// Name of the account on the broker
    pub fn broker_name(&self) -> String {
        self.spec
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.metadata.name.clone().unwrap_or_default())
    }
}
