//! StreamTemplate CRD
//!
//! Stream templates make the broker create streams on demand for subjects
//! matching the template. The broker offers no update for templates, so every
//! field is fixed after creation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::ResourceStatus;
use crate::stream::StreamSettings;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "jetstream.nats.io",
    version = "v1beta2",
    kind = "StreamTemplate",
    namespaced,
    status = "ResourceStatus",
    shortname = "jst"
)]
#[serde(rename_all = "camelCase")]
pub struct StreamTemplateSpec {
    /// Broker-side template name (defaults to metadata.name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Maximum number of streams the template may create
    pub max_streams: u32,

    /// Settings applied to every stream created from the template
    pub stream: StreamSettings,

    /// Name of the Account object used to connect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Leave the broker template in place when this object is deleted
    #[serde(default)]
    pub prevent_delete: bool,
}

impl StreamTemplate {
    /// Name of the template on the broker
    pub fn broker_name(&self) -> String {
        self.spec
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.metadata.name.clone().unwrap_or_default())
    }
}
