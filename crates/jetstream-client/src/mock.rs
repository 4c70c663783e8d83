//! Mock JetStreamClient for unit testing
//!
//! This module provides an in-memory implementation of JetStreamClientTrait
//! that behaves like a single JetStream server: it fills in server-side
//! defaults, rejects conflicting creates and reports missing resources the way
//! the real API does. Every call is recorded, and failures can be queued per
//! operation to exercise error paths.

use crate::error::{ERR_CONSUMER_NOT_FOUND, ERR_STREAM_NOT_FOUND, JetStreamError};
use crate::jetstream_trait::JetStreamClientTrait;
use crate::models::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Default duplicate window the server applies (2 minutes)
const DEFAULT_DUPLICATE_WINDOW: i64 = 120_000_000_000;
/// Default ack wait the server applies (30 seconds)
const DEFAULT_ACK_WAIT: i64 = 30_000_000_000;

/// Operations the mock records and can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    GetAccount,
    CreateAccount,
    UpdateAccount,
    DeleteAccount,
    GetStream,
    CreateStream,
    UpdateStream,
    DeleteStream,
    GetConsumer,
    CreateConsumer,
    UpdateConsumer,
    DeleteConsumer,
    GetStreamTemplate,
    CreateStreamTemplate,
    DeleteStreamTemplate,
}

impl MockOp {
    /// Whether the operation changes broker state
    pub fn is_mutation(self) -> bool {
        !matches!(
            self,
            MockOp::GetAccount | MockOp::GetStream | MockOp::GetConsumer | MockOp::GetStreamTemplate
        )
    }
}

/// Failure to inject into the next call of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Transport failure
    Connection,
    /// Request timed out
    Timeout,
    /// Credentials rejected
    Authentication,
    /// API error reply
    Api {
        /// HTTP-like code
        code: u16,
        /// JetStream code
        err_code: u16,
        /// Description
        description: String,
    },
}

impl MockFailure {
    fn into_error(self, target: &str) -> JetStreamError {
        match self {
            MockFailure::Connection => JetStreamError::Connection(format!("connection reset while handling {}", target)),
            MockFailure::Timeout => JetStreamError::Timeout(target.to_string()),
            MockFailure::Authentication => JetStreamError::Authentication("authorization violation".to_string()),
            MockFailure::Api { code, err_code, description } => JetStreamError::Api { code, err_code, description },
        }
    }
}

/// Mock JetStreamClient for testing
///
/// Clones share the same in-memory broker.
#[derive(Clone, Debug)]
pub struct MockJetStreamClient {
    servers: Vec<String>,
    accounts: Arc<Mutex<HashMap<String, AccountInfo>>>,
    streams: Arc<Mutex<HashMap<String, StreamInfo>>>,
    consumers: Arc<Mutex<HashMap<(String, String), ConsumerInfo>>>,
    templates: Arc<Mutex<HashMap<String, StreamTemplateInfo>>>,
    calls: Arc<Mutex<Vec<(MockOp, String)>>>,
    failures: Arc<Mutex<HashMap<MockOp, VecDeque<MockFailure>>>>,
    connected: Arc<AtomicBool>,
}

impl Default for MockJetStreamClient {
    fn default() -> Self {
        Self::new("nats://mock:4222")
    }
}

impl MockJetStreamClient {
    /// Create a new empty mock broker
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            servers: vec![server.into()],
            accounts: Arc::new(Mutex::new(HashMap::new())),
            streams: Arc::new(Mutex::new(HashMap::new())),
            consumers: Arc::new(Mutex::new(HashMap::new())),
            templates: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Add an account to the mock store (for test setup)
    pub fn add_account(&self, name: &str, limits: AccountLimits) {
        self.accounts.lock().unwrap().insert(
            name.to_string(),
            AccountInfo {
                limits,
                ..AccountInfo::default()
            },
        );
    }

    /// Add a stream to the mock store (for test setup), bypassing defaults
    pub fn add_stream(&self, config: StreamConfig) {
        self.streams.lock().unwrap().insert(
            config.name.clone(),
            StreamInfo {
                config,
                created: None,
                state: StreamState::default(),
            },
        );
    }

    /// Add a consumer to the mock store (for test setup), bypassing defaults
    pub fn add_consumer(&self, stream: &str, config: ConsumerConfig) {
        let name = config.durable_name.clone().unwrap_or_default();
        self.consumers.lock().unwrap().insert(
            (stream.to_string(), name.clone()),
            ConsumerInfo {
                stream_name: stream.to_string(),
                name,
                config,
                created: None,
                num_pending: 0,
            },
        );
    }

    /// Current stream config, if present
    pub fn stream(&self, name: &str) -> Option<StreamConfig> {
        self.streams.lock().unwrap().get(name).map(|s| s.config.clone())
    }

    /// Current consumer config, if present
    pub fn consumer(&self, stream: &str, name: &str) -> Option<ConsumerConfig> {
        self.consumers
            .lock()
            .unwrap()
            .get(&(stream.to_string(), name.to_string()))
            .map(|c| c.config.clone())
    }

    /// Current account info, if present
    pub fn account(&self, name: &str) -> Option<AccountInfo> {
        self.accounts.lock().unwrap().get(name).cloned()
    }

    /// Current template, if present
    pub fn stream_template(&self, name: &str) -> Option<StreamTemplateConfig> {
        self.templates.lock().unwrap().get(name).map(|t| t.config.clone())
    }

    /// Queue a failure for the next call of `op`
    pub fn fail_next(&self, op: MockOp, failure: MockFailure) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    /// Simulate the connection going up or down
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// All recorded calls, oldest first
    pub fn calls(&self) -> Vec<(MockOp, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls of `op`
    pub fn call_count(&self, op: MockOp) -> usize {
        self.calls.lock().unwrap().iter().filter(|(o, _)| *o == op).count()
    }

    /// Number of recorded create/update/delete calls
    pub fn mutation_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o.is_mutation())
            .count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Record the call and return a queued failure, if any
    fn enter(&self, op: MockOp, target: &str) -> Result<(), JetStreamError> {
        self.calls.lock().unwrap().push((op, target.to_string()));
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MockFailure::Connection.into_error(target));
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(failure) => Err(failure.into_error(target)),
            None => Ok(()),
        }
    }

    fn stream_defaults(mut config: StreamConfig) -> StreamConfig {
        if config.duplicate_window == 0 {
            config.duplicate_window = DEFAULT_DUPLICATE_WINDOW;
        }
        if config.num_replicas == 0 {
            config.num_replicas = 1;
        }
        config
    }

    fn consumer_defaults(mut config: ConsumerConfig) -> ConsumerConfig {
        if config.ack_wait == 0 {
            config.ack_wait = DEFAULT_ACK_WAIT;
        }
        if config.max_deliver == 0 {
            config.max_deliver = -1;
        }
        if config.max_ack_pending == 0 && config.ack_policy != AckPolicy::None {
            config.max_ack_pending = 1000;
        }
        if config.max_waiting == 0 && config.deliver_subject.is_none() {
            config.max_waiting = 512;
        }
        config
    }
}

fn api_error(code: u16, err_code: u16, description: impl Into<String>) -> JetStreamError {
    JetStreamError::Api {
        code,
        err_code,
        description: description.into(),
    }
}

#[async_trait::async_trait]
impl JetStreamClientTrait for MockJetStreamClient {
    fn servers(&self) -> &[String] {
        &self.servers
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_account(&self, name: &str) -> Result<Option<AccountInfo>, JetStreamError> {
        self.enter(MockOp::GetAccount, name)?;
        Ok(self.accounts.lock().unwrap().get(name).cloned())
    }

    async fn create_account(&self, name: &str, limits: &AccountLimits) -> Result<AccountInfo, JetStreamError> {
        self.enter(MockOp::CreateAccount, name)?;
        let mut accounts = self.accounts.lock().unwrap();
        let info = accounts.entry(name.to_string()).or_insert_with(|| AccountInfo {
            limits: *limits,
            ..AccountInfo::default()
        });
        Ok(info.clone())
    }

    async fn update_account(&self, name: &str, limits: &AccountLimits) -> Result<AccountInfo, JetStreamError> {
        self.enter(MockOp::UpdateAccount, name)?;
        let mut accounts = self.accounts.lock().unwrap();
        let info = accounts
            .get_mut(name)
            .ok_or_else(|| api_error(404, 0, format!("account {} not found", name)))?;
        info.limits = *limits;
        Ok(info.clone())
    }

    async fn delete_account(&self, name: &str) -> Result<bool, JetStreamError> {
        self.enter(MockOp::DeleteAccount, name)?;
        Ok(self.accounts.lock().unwrap().remove(name).is_some())
    }

    async fn get_stream(&self, name: &str) -> Result<Option<StreamInfo>, JetStreamError> {
        self.enter(MockOp::GetStream, name)?;
        Ok(self.streams.lock().unwrap().get(name).cloned())
    }

    async fn create_stream(&self, config: &StreamConfig) -> Result<StreamInfo, JetStreamError> {
        self.enter(MockOp::CreateStream, &config.name)?;
        let config = Self::stream_defaults(config.clone());
        let mut streams = self.streams.lock().unwrap();
        if let Some(existing) = streams.get(&config.name) {
            if existing.config == config {
                return Ok(existing.clone());
            }
            return Err(api_error(400, 10058, "stream name already in use with a different configuration"));
        }
        let info = StreamInfo {
            config,
            created: Some(chrono::Utc::now()),
            state: StreamState::default(),
        };
        streams.insert(info.config.name.clone(), info.clone());
        Ok(info)
    }

    async fn update_stream(&self, config: &StreamConfig) -> Result<StreamInfo, JetStreamError> {
        self.enter(MockOp::UpdateStream, &config.name)?;
        let config = Self::stream_defaults(config.clone());
        let mut streams = self.streams.lock().unwrap();
        let existing = streams
            .get_mut(&config.name)
            .ok_or_else(|| api_error(404, ERR_STREAM_NOT_FOUND, "stream not found"))?;
        if existing.config.storage != config.storage {
            return Err(api_error(500, 10052, "stream configuration update can not change storage type"));
        }
        existing.config = config;
        Ok(existing.clone())
    }

    async fn delete_stream(&self, name: &str) -> Result<bool, JetStreamError> {
        self.enter(MockOp::DeleteStream, name)?;
        let removed = self.streams.lock().unwrap().remove(name).is_some();
        if removed {
            self.consumers.lock().unwrap().retain(|(stream, _), _| stream != name);
        }
        Ok(removed)
    }

    async fn get_consumer(&self, stream: &str, name: &str) -> Result<Option<ConsumerInfo>, JetStreamError> {
        self.enter(MockOp::GetConsumer, &format!("{}/{}", stream, name))?;
        if !self.streams.lock().unwrap().contains_key(stream) {
            return Err(api_error(404, ERR_STREAM_NOT_FOUND, "stream not found"));
        }
        Ok(self
            .consumers
            .lock()
            .unwrap()
            .get(&(stream.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo, JetStreamError> {
        let name = config.durable_name.clone().unwrap_or_default();
        self.enter(MockOp::CreateConsumer, &format!("{}/{}", stream, name))?;
        if !self.streams.lock().unwrap().contains_key(stream) {
            return Err(api_error(404, ERR_STREAM_NOT_FOUND, "stream not found"));
        }
        let config = Self::consumer_defaults(config.clone());
        let key = (stream.to_string(), name.clone());
        let mut consumers = self.consumers.lock().unwrap();
        if let Some(existing) = consumers.get(&key) {
            if existing.config == config {
                return Ok(existing.clone());
            }
            return Err(api_error(400, 10148, "consumer already exists"));
        }
        let info = ConsumerInfo {
            stream_name: stream.to_string(),
            name,
            config,
            created: Some(chrono::Utc::now()),
            num_pending: 0,
        };
        consumers.insert(key, info.clone());
        Ok(info)
    }

    async fn update_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo, JetStreamError> {
        let name = config.durable_name.clone().unwrap_or_default();
        self.enter(MockOp::UpdateConsumer, &format!("{}/{}", stream, name))?;
        let config = Self::consumer_defaults(config.clone());
        let mut consumers = self.consumers.lock().unwrap();
        let existing = consumers
            .get_mut(&(stream.to_string(), name))
            .ok_or_else(|| api_error(404, ERR_CONSUMER_NOT_FOUND, "consumer not found"))?;
        existing.config = config;
        Ok(existing.clone())
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<bool, JetStreamError> {
        self.enter(MockOp::DeleteConsumer, &format!("{}/{}", stream, name))?;
        Ok(self
            .consumers
            .lock()
            .unwrap()
            .remove(&(stream.to_string(), name.to_string()))
            .is_some())
    }

    async fn get_stream_template(&self, name: &str) -> Result<Option<StreamTemplateInfo>, JetStreamError> {
        self.enter(MockOp::GetStreamTemplate, name)?;
        Ok(self.templates.lock().unwrap().get(name).cloned())
    }

    async fn create_stream_template(&self, config: &StreamTemplateConfig) -> Result<StreamTemplateInfo, JetStreamError> {
        self.enter(MockOp::CreateStreamTemplate, &config.name)?;
        let mut config = config.clone();
        config.config = Self::stream_defaults(config.config);
        let mut templates = self.templates.lock().unwrap();
        if let Some(existing) = templates.get(&config.name) {
            if existing.config == config {
                return Ok(existing.clone());
            }
            return Err(api_error(400, 0, "template with name already exists"));
        }
        let info = StreamTemplateInfo {
            config,
            streams: Vec::new(),
        };
        templates.insert(info.config.name.clone(), info.clone());
        Ok(info)
    }

    async fn delete_stream_template(&self, name: &str) -> Result<bool, JetStreamError> {
        self.enter(MockOp::DeleteStreamTemplate, name)?;
        Ok(self.templates.lock().unwrap().remove(name).is_some())
    }
}
