//! Stream CRD
//!
//! Declares a JetStream stream. Durations (`maxAge`, `duplicateWindow`) are
//! human-readable strings such as `"24h"` or `"2m"`. Optional numeric limits
//! that are left unset keep whatever the broker defaults to and are not
//! compared during drift detection.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::ResourceStatus;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "jetstream.nats.io",
    version = "v1beta2",
    kind = "Stream",
    namespaced,
    status = "ResourceStatus",
    shortname = "jss"
)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    /// Broker-side stream name (defaults to metadata.name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Stream settings
    #[serde(flatten)]
    pub config: StreamSettings,

    /// Name of the Account object used to connect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Leave the broker stream in place when this object is deleted
    #[serde(default)]
    pub prevent_delete: bool,

    /// Never push spec changes to the broker after creation
    #[serde(default)]
    pub prevent_update: bool,
}

/// Stream settings shared by Stream and StreamTemplate
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Subjects the stream captures
    #[serde(default)]
    pub subjects: Vec<String>,

    /// Message retention policy
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Storage backend
    #[serde(default)]
    pub storage: StorageType,

    /// Number of replicas in a clustered deployment
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Maximum number of consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consumers: Option<i64>,

    /// Maximum number of messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msgs: Option<i64>,

    /// Maximum total size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<i64>,

    /// Maximum message age, e.g. "24h"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,

    /// Maximum size of a single message in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msg_size: Option<i32>,

    /// Maximum messages kept per subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msgs_per_subject: Option<i64>,

    /// What to do when limits are reached
    #[serde(default)]
    pub discard: DiscardPolicy,

    /// Window for duplicate detection, e.g. "2m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_window: Option<String>,

    /// Disable publish acknowledgements
    #[serde(default)]
    pub no_ack: bool,

    /// Disallow deleting individual messages
    #[serde(default)]
    pub deny_delete: bool,

    /// Disallow purging the stream
    #[serde(default)]
    pub deny_purge: bool,

    /// Allow rollup headers
    #[serde(default)]
    pub allow_rollup: bool,

    /// Allow direct get
    #[serde(default)]
    pub allow_direct: bool,
}

fn default_replicas() -> u32 {
    1
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            description: None,
            subjects: Vec::new(),
            retention: RetentionPolicy::default(),
            storage: StorageType::default(),
            replicas: default_replicas(),
            max_consumers: None,
            max_msgs: None,
            max_bytes: None,
            max_age: None,
            max_msg_size: None,
            max_msgs_per_subject: None,
            discard: DiscardPolicy::default(),
            duplicate_window: None,
            no_ack: false,
            deny_delete: false,
            deny_purge: false,
            allow_rollup: false,
            allow_direct: false,
        }
    }
}

/// Message retention policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep messages until limits are hit
    #[default]
    Limits,
    /// Keep messages while there is consumer interest
    Interest,
    /// Remove messages once acknowledged
    #[serde(alias = "workQueue")]
    WorkQueue,
}

/// Storage backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// File storage
    #[default]
    File,
    /// Memory storage
    Memory,
}

/// Discard behaviour once limits are reached
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Drop the oldest messages
    #[default]
    Old,
    /// Reject new messages
    New,
}

impl Stream {
    /// Name of the stream on the broker
    pub fn broker_name(&self) -> String {
        self.spec
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.metadata.name.clone().unwrap_or_default())
    }
}
