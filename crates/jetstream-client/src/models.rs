//! JetStream API data models
//!
//! Wire shapes of the JetStream JSON API. Durations are integer nanoseconds
//! and optional fields follow the server's omit-when-empty conventions, so a
//! config read back from the server compares equal to the one we sent when
//! nothing drifted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Error object embedded in failed API responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP-like status code
    pub code: u16,
    /// JetStream error code
    #[serde(default)]
    pub err_code: u16,
    /// Server description
    #[serde(default)]
    pub description: String,
}

/// Every API reply is either an error envelope or the payload
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiResponse<T> {
    /// `{"error": {...}}`
    Err {
        /// Error details
        error: ApiError,
    },
    /// Successful payload
    Ok(T),
}

/// Reply to delete requests
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteResponse {
    /// Whether the server deleted the resource
    #[serde(default)]
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// JetStream limits for an account (-1 is unlimited)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountLimits {
    /// Memory storage in bytes
    #[serde(default = "unlimited")]
    pub max_memory: i64,
    /// File storage in bytes
    #[serde(default = "unlimited")]
    pub max_storage: i64,
    /// Number of streams
    #[serde(default = "unlimited")]
    pub max_streams: i64,
    /// Number of consumers
    #[serde(default = "unlimited")]
    pub max_consumers: i64,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            max_memory: -1,
            max_storage: -1,
            max_streams: -1,
            max_consumers: -1,
        }
    }
}

fn unlimited() -> i64 {
    -1
}

/// Reply to `$JS.API.INFO`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountInfo {
    /// Memory in use
    #[serde(default)]
    pub memory: u64,
    /// File storage in use
    #[serde(default)]
    pub storage: u64,
    /// Number of streams
    #[serde(default)]
    pub streams: u64,
    /// Number of consumers
    #[serde(default)]
    pub consumers: u64,
    /// Configured limits
    #[serde(default)]
    pub limits: AccountLimits,
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Stream retention policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep until limits are hit
    #[default]
    Limits,
    /// Keep while consumers are interested
    Interest,
    /// Remove on ack
    WorkQueue,
}

/// Stream storage backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// File storage
    #[default]
    File,
    /// Memory storage
    Memory,
}

/// Discard policy when limits are reached
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Drop oldest
    #[default]
    Old,
    /// Reject new
    New,
}

/// Stream configuration as sent to and returned by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream name
    pub name: String,
    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Captured subjects
    pub subjects: Vec<String>,
    /// Retention policy
    pub retention: RetentionPolicy,
    /// Maximum consumers
    pub max_consumers: i64,
    /// Maximum messages
    pub max_msgs: i64,
    /// Maximum bytes
    pub max_bytes: i64,
    /// Maximum age in nanoseconds (0 is unlimited)
    pub max_age: i64,
    /// Maximum messages per subject
    pub max_msgs_per_subject: i64,
    /// Maximum single message size
    pub max_msg_size: i32,
    /// Storage backend
    pub storage: StorageType,
    /// Discard policy
    pub discard: DiscardPolicy,
    /// Replica count
    pub num_replicas: u32,
    /// Duplicate detection window in nanoseconds
    pub duplicate_window: i64,
    /// Disable publish acks
    pub no_ack: bool,
    /// Disallow message deletes
    pub deny_delete: bool,
    /// Disallow purges
    pub deny_purge: bool,
    /// Allow rollup headers
    pub allow_rollup_hdrs: bool,
    /// Allow direct get
    pub allow_direct: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            subjects: Vec::new(),
            retention: RetentionPolicy::Limits,
            max_consumers: -1,
            max_msgs: -1,
            max_bytes: -1,
            max_age: 0,
            max_msgs_per_subject: -1,
            max_msg_size: -1,
            storage: StorageType::File,
            discard: DiscardPolicy::Old,
            num_replicas: 1,
            duplicate_window: 0,
            no_ack: false,
            deny_delete: false,
            deny_purge: false,
            allow_rollup_hdrs: false,
            allow_direct: false,
        }
    }
}

/// Live stream counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StreamState {
    /// Stored messages
    pub messages: u64,
    /// Stored bytes
    pub bytes: u64,
    /// Attached consumers
    pub consumer_count: u64,
}

/// Reply to stream INFO/CREATE/UPDATE
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamInfo {
    /// Effective configuration
    pub config: StreamConfig,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Current state
    #[serde(default)]
    pub state: StreamState,
}

// ---------------------------------------------------------------------------
// Consumers
// ---------------------------------------------------------------------------

/// Consumer start position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the beginning
    #[default]
    All,
    /// Last message
    Last,
    /// New messages only
    New,
    /// From a sequence
    ByStartSequence,
    /// From a time
    ByStartTime,
    /// Last per subject
    LastPerSubject,
}

/// Consumer ack mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// No acks
    None,
    /// Cumulative acks
    All,
    /// Per-message acks
    #[default]
    Explicit,
}

/// Consumer replay speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// Fast as possible
    #[default]
    Instant,
    /// Original timing
    Original,
}

/// Consumer configuration as sent to and returned by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Durable name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Start position
    pub deliver_policy: DeliverPolicy,
    /// Start sequence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    /// Start time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_start_time: Option<DateTime<Utc>>,
    /// Ack mode
    pub ack_policy: AckPolicy,
    /// Ack wait in nanoseconds
    #[serde(skip_serializing_if = "is_zero")]
    pub ack_wait: i64,
    /// Maximum deliveries
    #[serde(skip_serializing_if = "is_zero")]
    pub max_deliver: i64,
    /// Subject filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    /// Replay speed
    pub replay_policy: ReplayPolicy,
    /// Ack sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_freq: Option<String>,
    /// Rate limit in bits per second
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub rate_limit_bps: u64,
    /// Maximum pending acks
    #[serde(skip_serializing_if = "is_zero")]
    pub max_ack_pending: i64,
    /// Maximum waiting pulls
    #[serde(skip_serializing_if = "is_zero")]
    pub max_waiting: i64,
    /// Push subject
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    /// Push queue group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver_group: Option<String>,
    /// Headers only
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub headers_only: bool,
    /// Redelivery backoff in nanoseconds
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backoff: Vec<i64>,
    /// Replica count (0 inherits from the stream)
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub num_replicas: u32,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// Reply to consumer INFO/CREATE
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Stream the consumer belongs to
    pub stream_name: String,
    /// Consumer name
    pub name: String,
    /// Effective configuration
    pub config: ConsumerConfig,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Messages pending delivery
    #[serde(default)]
    pub num_pending: u64,
}

/// Request body for `$JS.API.CONSUMER.CREATE`
#[derive(Debug, Clone, Serialize)]
pub struct CreateConsumerRequest<'a> {
    /// Target stream
    pub stream_name: &'a str,
    /// Consumer configuration
    pub config: &'a ConsumerConfig,
    /// "create" or "update"
    pub action: &'static str,
}

// ---------------------------------------------------------------------------
// Stream templates
// ---------------------------------------------------------------------------

/// Stream template definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StreamTemplateConfig {
    /// Template name
    pub name: String,
    /// Config for generated streams
    pub config: StreamConfig,
    /// Stream limit
    pub max_streams: u32,
}

/// Reply to template INFO/CREATE
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamTemplateInfo {
    /// Template configuration
    pub config: StreamTemplateConfig,
    /// Streams created from the template
    #[serde(default)]
    pub streams: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_error_envelope() {
        let raw = r#"{"type":"io.nats.jetstream.api.v1.stream_info_response","error":{"code":404,"err_code":10059,"description":"stream not found"}}"#;
        let resp: ApiResponse<StreamInfo> = serde_json::from_str(raw).unwrap();
        match resp {
            ApiResponse::Err { error } => {
                assert_eq!(error.code, 404);
                assert_eq!(error.err_code, 10059);
            }
            ApiResponse::Ok(_) => panic!("expected error envelope"),
        }
    }

    #[test]
    fn test_stream_info_parses_server_reply() {
        let raw = r#"{
            "type": "io.nats.jetstream.api.v1.stream_create_response",
            "config": {
                "name": "ORDERS",
                "subjects": ["orders.>"],
                "retention": "limits",
                "max_consumers": -1,
                "max_msgs": -1,
                "max_bytes": -1,
                "max_age": 0,
                "max_msgs_per_subject": -1,
                "max_msg_size": -1,
                "discard": "old",
                "storage": "file",
                "num_replicas": 3,
                "duplicate_window": 120000000000,
                "sealed": false,
                "allow_direct": false
            },
            "created": "2024-05-01T10:00:00.000000000Z",
            "state": {"messages": 0, "bytes": 0, "first_seq": 0, "consumer_count": 0}
        }"#;
        let resp: ApiResponse<StreamInfo> = serde_json::from_str(raw).unwrap();
        let ApiResponse::Ok(info) = resp else {
            panic!("expected stream info");
        };
        assert_eq!(info.config.name, "ORDERS");
        assert_eq!(info.config.num_replicas, 3);
        assert_eq!(info.config.duplicate_window, 120_000_000_000);
        assert!(info.config.description.is_none());
    }

    #[test]
    fn test_consumer_config_omits_unset_fields() {
        let config = ConsumerConfig {
            durable_name: Some("processor".to_string()),
            ..ConsumerConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["durable_name"], "processor");
        assert_eq!(json["deliver_policy"], "all");
        assert_eq!(json["ack_policy"], "explicit");
        assert!(json.get("ack_wait").is_none());
        assert!(json.get("deliver_subject").is_none());
    }

    #[test]
    fn test_deliver_policy_wire_names() {
        assert_eq!(
            serde_json::to_value(DeliverPolicy::ByStartSequence).unwrap(),
            "by_start_sequence"
        );
        assert_eq!(
            serde_json::to_value(RetentionPolicy::WorkQueue).unwrap(),
            "workqueue"
        );
    }
}
