//! JetStreamClient trait for mocking
//!
//! This trait abstracts the JetStream management API so the controller can be
//! unit tested against an in-memory broker. The concrete `JetStreamClient`
//! implements it over NATS request/reply.
//!
//! `get_*` calls return `Ok(None)` for resources that do not exist and
//! `delete_*` calls return `Ok(false)` when there was nothing to delete, so
//! callers never need to inspect error codes for the absent case.

use crate::error::JetStreamError;
use crate::models::*;

/// Trait for JetStream management operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait JetStreamClientTrait: Send + Sync {
    /// Servers this client is connected to
    fn servers(&self) -> &[String];

    /// Whether the underlying connection is currently up
    fn is_connected(&self) -> bool;

    // Accounts
    async fn get_account(&self, name: &str) -> Result<Option<AccountInfo>, JetStreamError>;
    async fn create_account(&self, name: &str, limits: &AccountLimits) -> Result<AccountInfo, JetStreamError>;
    async fn update_account(&self, name: &str, limits: &AccountLimits) -> Result<AccountInfo, JetStreamError>;
    async fn delete_account(&self, name: &str) -> Result<bool, JetStreamError>;

    // Streams
    async fn get_stream(&self, name: &str) -> Result<Option<StreamInfo>, JetStreamError>;
    async fn create_stream(&self, config: &StreamConfig) -> Result<StreamInfo, JetStreamError>;
    async fn update_stream(&self, config: &StreamConfig) -> Result<StreamInfo, JetStreamError>;
    async fn delete_stream(&self, name: &str) -> Result<bool, JetStreamError>;

    // Consumers
    async fn get_consumer(&self, stream: &str, name: &str) -> Result<Option<ConsumerInfo>, JetStreamError>;
    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo, JetStreamError>;
    async fn update_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo, JetStreamError>;
    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<bool, JetStreamError>;

    // Stream templates
    async fn get_stream_template(&self, name: &str) -> Result<Option<StreamTemplateInfo>, JetStreamError>;
    async fn create_stream_template(&self, config: &StreamTemplateConfig) -> Result<StreamTemplateInfo, JetStreamError>;
    async fn delete_stream_template(&self, name: &str) -> Result<bool, JetStreamError>;
}
