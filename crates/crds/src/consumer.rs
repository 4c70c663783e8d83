//! Consumer CRD
//!
//! Declares a durable JetStream consumer on a stream. A consumer with a
//! `deliverSubject` is push-based, otherwise pull-based.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::ResourceStatus;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "jetstream.nats.io",
    version = "v1beta2",
    kind = "Consumer",
    namespaced,
    status = "ResourceStatus",
    shortname = "jsc"
)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSpec {
    /// Broker-side name of the stream this consumer reads from
    pub stream_name: String,

    /// Durable name (defaults to metadata.name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Where delivery starts
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,

    /// Start sequence for `byStartSequence`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,

    /// Start time (RFC 3339) for `byStartTime`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_time: Option<String>,

    /// Acknowledgement mode
    #[serde(default)]
    pub ack_policy: AckPolicy,

    /// How long to wait for an ack before redelivery, e.g. "30s"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait: Option<String>,

    /// Maximum delivery attempts (-1 for unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,

    /// Only deliver messages matching this subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,

    /// Replay speed
    #[serde(default)]
    pub replay_policy: ReplayPolicy,

    /// Percentage of acks to sample, e.g. "100%"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_freq: Option<String>,

    /// Delivery rate limit in bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_bps: Option<u64>,

    /// Maximum outstanding unacknowledged messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,

    /// Maximum outstanding pull requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting: Option<i64>,

    /// Subject to push messages to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,

    /// Queue group for push delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_group: Option<String>,

    /// Deliver only headers
    #[serde(default)]
    pub headers_only: bool,

    /// Redelivery backoff durations, e.g. ["1s", "5s"]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backoff: Vec<String>,

    /// Consumer replicas (0 inherits from the stream)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,

    /// Name of the Account object used to connect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Leave the broker consumer in place when this object is deleted
    #[serde(default)]
    pub prevent_delete: bool,

    /// Never push spec changes to the broker after creation
    #[serde(default)]
    pub prevent_update: bool,
}

/// Where a consumer starts delivering
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeliverPolicy {
    /// From the first message
    #[default]
    All,
    /// From the last message
    Last,
    /// Only new messages
    New,
    /// From `optStartSeq`
    ByStartSequence,
    /// From `optStartTime`
    ByStartTime,
    /// Last message for each subject
    LastPerSubject,
}

/// Acknowledgement mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Every message must be acked
    #[default]
    Explicit,
    /// Acking a message acks all before it
    All,
    /// No acks
    None,
}

/// Replay speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// As fast as possible
    #[default]
    Instant,
    /// At the original publish rate
    Original,
}

impl Consumer {
    /// Durable name of the consumer on the broker
    pub fn broker_name(&self) -> String {
        self.spec
            .durable_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.metadata.name.clone().unwrap_or_default())
    }
}
