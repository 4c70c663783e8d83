//! Test utilities for unit testing reconcilers and the engine
//!
//! This module provides helpers for creating test objects, an in-memory
//! stand-in for the Kubernetes API and a fully wired [`Engine`] over a mock
//! broker.

use crate::cache::{CachedObject, ObjectCache};
use crate::connection::{ConnectionHandle, ConnectionManager, Connector};
use crate::credentials::{CredentialStore, SecretReader};
use crate::engine::{Engine, EngineSettings, ReconcileReport};
use crate::error::ControllerError;
use crate::health::HealthState;
use crate::reconciler::{ReconcileKey, ResourceKind};
use crate::writer::ObjectWriter;
use async_trait::async_trait;
use crds::*;
use jetstream_client::{ConnectionConfig, JetStreamError, MockJetStreamClient};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn test_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        generation: Some(1),
        resource_version: Some("1".to_string()),
        ..Default::default()
    }
}

/// Helper to create a test Account that connects through the global servers
pub fn create_test_account(name: &str, namespace: &str) -> Account {
    Account {
        metadata: test_meta(name, namespace),
        spec: AccountSpec {
            name: None,
            servers: Vec::new(),
            creds: None,
            tls: None,
            tls_first: false,
            limits: None,
        },
        status: None,
    }
}

/// Helper to create a test Stream listening on `<name>.>`
pub fn create_test_stream(name: &str, namespace: &str) -> Stream {
    Stream {
        metadata: test_meta(name, namespace),
        spec: StreamSpec {
            name: None,
            config: StreamSettings {
                subjects: vec![format!("{}.>", name)],
                ..StreamSettings::default()
            },
            account: None,
            prevent_delete: false,
            prevent_update: false,
        },
        status: None,
    }
}

/// Helper to create a test Consumer on `stream`
pub fn create_test_consumer(name: &str, namespace: &str, stream: &str) -> Consumer {
    Consumer {
        metadata: test_meta(name, namespace),
        spec: ConsumerSpec {
            stream_name: stream.to_string(),
            durable_name: None,
            description: None,
            deliver_policy: DeliverPolicy::default(),
            opt_start_seq: None,
            opt_start_time: None,
            ack_policy: AckPolicy::default(),
            ack_wait: None,
            max_deliver: None,
            filter_subject: None,
            replay_policy: ReplayPolicy::default(),
            sample_freq: None,
            rate_limit_bps: None,
            max_ack_pending: None,
            max_waiting: None,
            deliver_subject: None,
            deliver_group: None,
            headers_only: false,
            backoff: Vec::new(),
            replicas: None,
            account: None,
            prevent_delete: false,
            prevent_update: false,
        },
        status: None,
    }
}

/// Helper to create a test StreamTemplate allowing 10 streams
pub fn create_test_template(name: &str, namespace: &str) -> StreamTemplate {
    StreamTemplate {
        metadata: test_meta(name, namespace),
        spec: StreamTemplateSpec {
            name: None,
            max_streams: 10,
            stream: StreamSettings {
                subjects: vec![format!("{}.*", name)],
                ..StreamSettings::default()
            },
            account: None,
            prevent_delete: false,
        },
        status: None,
    }
}

/// Mark an object as being deleted by the API server
pub fn mark_deleting(meta: &mut ObjectMeta) {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    meta.deletion_timestamp =
        Some(serde_json::from_value::<Time>(Value::String(now)).expect("valid timestamp"));
}

/// Give `account` a Ready condition with the given status
pub fn with_ready(mut account: Account, status: ConditionStatus) -> Account {
    let mut resource_status = ResourceStatus::default();
    resource_status.set_condition(Condition::ready(status, "Test", "set by test"), chrono::Utc::now());
    account.status = Some(resource_status);
    account
}

/// Connector handing out clones of one mock broker
#[derive(Clone)]
pub struct MockConnector {
    broker: MockJetStreamClient,
    connects: Arc<AtomicUsize>,
    reject_auth: Arc<AtomicBool>,
    network_failures: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(broker: MockJetStreamClient) -> Self {
        Self {
            broker,
            connects: Arc::new(AtomicUsize::new(0)),
            reject_auth: Arc::new(AtomicBool::new(false)),
            network_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connect attempts so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Reject every connect with an authorization error
    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Fail the next `count` connects with a network error
    pub fn fail_network(&self, count: usize) {
        self.network_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<ConnectionHandle, JetStreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(JetStreamError::Authentication("authorization violation".to_string()));
        }
        let pending = self.network_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.network_failures.store(pending - 1, Ordering::SeqCst);
            return Err(JetStreamError::Connection("connection refused".to_string()));
        }
        Ok(Arc::new(self.broker.clone()))
    }
}

/// In-memory Secrets
#[derive(Clone, Default)]
pub struct StaticSecrets {
    data: Arc<Mutex<HashMap<(String, String, String), Vec<u8>>>>,
}

impl StaticSecrets {
    pub fn insert(&self, namespace: &str, name: &str, key: &str, value: &[u8]) {
        self.data.lock().unwrap().insert(
            (namespace.to_string(), name.to_string(), key.to_string()),
            value.to_vec(),
        );
    }
}

#[async_trait]
impl SecretReader for StaticSecrets {
    async fn read(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, ControllerError> {
        self.data
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ControllerError::Credentials(format!("secret {}/{} has no key {}", namespace, name, key)))
    }
}

/// [`ObjectWriter`] over the object cache, behaving like the API server:
/// stale resource versions conflict, and an object being deleted disappears
/// once its last finalizer is removed.
pub struct MemoryWriter {
    cache: Arc<ObjectCache>,
    status_writes: AtomicUsize,
    finalizer_writes: AtomicUsize,
    conflicts: AtomicUsize,
}

impl MemoryWriter {
    pub fn new(cache: Arc<ObjectCache>) -> Self {
        Self {
            cache,
            status_writes: AtomicUsize::new(0),
            finalizer_writes: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
        }
    }

    /// Answer the next `count` writes with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn finalizer_writes(&self) -> usize {
        self.finalizer_writes.load(Ordering::SeqCst)
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn write<K>(
        &self,
        key: &ReconcileKey,
        resource_version: Option<&str>,
        edit: impl FnOnce(&mut K) + Send,
    ) -> Result<Value, ControllerError>
    where
        K: CachedObject + Serialize,
    {
        if self.take_conflict() {
            return Err(ControllerError::Conflict(key.to_string()));
        }
        let Some(current) = self.cache.get::<K>(&key.namespace, &key.name) else {
            return Err(ControllerError::Conflict(key.to_string()));
        };
        if resource_version.is_some() && resource_version != current.meta().resource_version.as_deref() {
            return Err(ControllerError::Conflict(key.to_string()));
        }

        let mut obj = (*current).clone();
        edit(&mut obj);
        let next = obj
            .meta()
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        obj.meta_mut().resource_version = Some(next.to_string());

        let value = serde_json::to_value(&obj)?;
        if obj.meta().deletion_timestamp.is_some() && obj.finalizers().is_empty() {
            self.cache.remove::<K>(&key.namespace, &key.name).await;
        } else {
            self.cache.apply(obj).await;
        }
        Ok(value)
    }

    async fn fetch_typed<K: CachedObject + Serialize>(
        &self,
        key: &ReconcileKey,
    ) -> Result<Option<Value>, ControllerError> {
        Ok(self
            .cache
            .get::<K>(&key.namespace, &key.name)
            .map(|obj| serde_json::to_value(&*obj))
            .transpose()?)
    }
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn fetch(&self, key: &ReconcileKey) -> Result<Option<Value>, ControllerError> {
        match key.kind {
            ResourceKind::Account => self.fetch_typed::<Account>(key).await,
            ResourceKind::Stream => self.fetch_typed::<Stream>(key).await,
            ResourceKind::Consumer => self.fetch_typed::<Consumer>(key).await,
            ResourceKind::StreamTemplate => self.fetch_typed::<StreamTemplate>(key).await,
        }
    }

    async fn patch_status(
        &self,
        key: &ReconcileKey,
        resource_version: Option<&str>,
        status: &ResourceStatus,
    ) -> Result<Value, ControllerError> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let status = status.clone();
        match key.kind {
            ResourceKind::Account => {
                self.write::<Account>(key, resource_version, |o| o.status = Some(status))
                    .await
            }
            ResourceKind::Stream => {
                self.write::<Stream>(key, resource_version, |o| o.status = Some(status))
                    .await
            }
            ResourceKind::Consumer => {
                self.write::<Consumer>(key, resource_version, |o| o.status = Some(status))
                    .await
            }
            ResourceKind::StreamTemplate => {
                self.write::<StreamTemplate>(key, resource_version, |o| o.status = Some(status))
                    .await
            }
        }
    }

    async fn patch_finalizers(
        &self,
        key: &ReconcileKey,
        resource_version: Option<&str>,
        finalizers: &[String],
    ) -> Result<Value, ControllerError> {
        self.finalizer_writes.fetch_add(1, Ordering::SeqCst);
        let finalizers = (!finalizers.is_empty()).then(|| finalizers.to_vec());
        match key.kind {
            ResourceKind::Account => {
                self.write::<Account>(key, resource_version, |o| o.meta_mut().finalizers = finalizers)
                    .await
            }
            ResourceKind::Stream => {
                self.write::<Stream>(key, resource_version, |o| o.meta_mut().finalizers = finalizers)
                    .await
            }
            ResourceKind::Consumer => {
                self.write::<Consumer>(key, resource_version, |o| o.meta_mut().finalizers = finalizers)
                    .await
            }
            ResourceKind::StreamTemplate => {
                self.write::<StreamTemplate>(key, resource_version, |o| o.meta_mut().finalizers = finalizers)
                    .await
            }
        }
    }
}

/// An engine wired to a mock broker and an in-memory API server
pub struct TestHarness {
    pub broker: MockJetStreamClient,
    pub connector: MockConnector,
    pub cache: Arc<ObjectCache>,
    pub writer: Arc<MemoryWriter>,
    pub secrets: StaticSecrets,
    pub engine: Arc<Engine>,
    _cache_dir: tempfile::TempDir,
}

impl TestHarness {
    /// Harness with a global connection to the mock broker
    pub fn new() -> Self {
        Self::with_settings(Self::global_settings())
    }

    /// Default settings plus a global connection
    pub fn global_settings() -> EngineSettings {
        EngineSettings {
            global: Some(ConnectionConfig::new(vec!["nats://mock:4222".to_string()])),
            ..EngineSettings::default()
        }
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let broker = MockJetStreamClient::default();
        let connector = MockConnector::new(broker.clone());
        let cache = Arc::new(ObjectCache::new());
        let writer = Arc::new(MemoryWriter::new(Arc::clone(&cache)));
        let secrets = StaticSecrets::default();
        let cache_dir = tempfile::tempdir().unwrap();
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(connector.clone()),
            Arc::new(HealthState::default()),
        ));
        let credentials = Arc::new(CredentialStore::new(Arc::new(secrets.clone()), cache_dir.path()));
        let engine = Arc::new(Engine::new(
            Arc::clone(&cache),
            connections,
            Arc::clone(&writer) as Arc<dyn ObjectWriter>,
            credentials,
            settings,
        ));
        Self {
            broker,
            connector,
            cache,
            writer,
            secrets,
            engine,
            _cache_dir: cache_dir,
        }
    }

    /// Put an object into the in-memory API server
    pub async fn add<K: CachedObject>(&self, obj: K) {
        self.cache.apply(obj).await;
    }

    /// Current copy of an object
    pub fn get<K: CachedObject>(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.cache.get::<K>(namespace, name)
    }

    /// Simulate `kubectl delete`: set the deletion marker, or remove the
    /// object right away when it carries no finalizers
    pub async fn delete<K: CachedObject>(&self, namespace: &str, name: &str) {
        let Some(current) = self.cache.get::<K>(namespace, name) else {
            return;
        };
        if current.finalizers().is_empty() {
            self.cache.remove::<K>(namespace, name).await;
            return;
        }
        let mut obj = (*current).clone();
        mark_deleting(obj.meta_mut());
        self.cache.apply(obj).await;
    }

    pub async fn reconcile(&self, kind: ResourceKind, namespace: &str, name: &str) -> ReconcileReport {
        self.engine
            .reconcile(&ReconcileKey::new(kind, namespace, name))
            .await
            .unwrap()
    }
}

/// Ready condition of a cached object
pub fn ready_condition<K: CachedObject>(obj: &K) -> Option<Condition> {
    obj.status().and_then(|s| s.condition(CONDITION_READY)).cloned()
}
