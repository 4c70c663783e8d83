//! Diff/apply engine
//!
//! `reconcile(key)` is the single entry point both control loops use:
//!
//! 1. Look the object up in the cache (gone means its deletion completed)
//! 2. Finalize it if it is being deleted
//! 3. Resolve its connection (global or Account) and read broker state
//! 4. Diff, gate creates on Ready parents and apply the operations in order
//! 5. Record the outcome as the Ready condition
//!
//! Reconciles of one key are serialized; different keys run concurrently.

use crate::backoff::BackoffTracker;
use crate::cache::{CachedObject, ObjectCache};
use crate::connection::{ConnectionDomain, ConnectionManager};
use crate::credentials::CredentialStore;
use crate::error::ControllerError;
use crate::finalizer;
use crate::reconciler::{
    AccountReconciler, ConsumerReconciler, DiffError, Operation, ReconcileKey, ResourceKind, ResourceReconciler,
    StreamReconciler, StreamTemplateReconciler,
};
use crate::status::{self, *};
use crate::writer::ObjectWriter;
use chrono::Utc;
use crds::{Account, Condition, ConditionStatus, Consumer, JetStreamResource, ResourceStatus, Stream, StreamTemplate};
use jetstream_client::{ConnectionConfig, JetStreamError};
use kube::Resource;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::{debug, info, instrument, warn};

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Compute and report, never write
    pub read_only: bool,
    /// Retry delay while a parent is not Ready or an Account is missing
    pub parent_wait: Duration,
    /// Retry delay while an Account still has dependents
    pub dependents_wait: Duration,
    /// Refetch-and-retry attempts after a write conflict
    pub max_conflict_retries: u32,
    /// Global connection settings
    pub global: Option<ConnectionConfig>,
    /// Connect only with Account settings, never through `global`
    pub crd_connect: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            read_only: false,
            parent_wait: Duration::from_secs(5),
            dependents_wait: Duration::from_secs(10),
            max_conflict_retries: 3,
            global: None,
            crd_connect: false,
        }
    }
}

/// When a key should be reconciled again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// At the next periodic resync
    Resync,
    /// After the given delay
    After(Duration),
    /// Never, unless the object changes
    Done,
}

/// Outcome of one reconcile
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub key: ReconcileKey,
    /// Broker mutations applied (or, read-only, that would be applied)
    pub operations: Vec<Operation>,
    pub requeue: Requeue,
    /// Ready condition recorded, if any
    pub condition: Option<Condition>,
}

impl ReconcileReport {
    fn done(key: &ReconcileKey) -> Self {
        Self {
            key: key.clone(),
            operations: Vec::new(),
            requeue: Requeue::Done,
            condition: None,
        }
    }

    /// Reason of the recorded condition
    pub fn reason(&self) -> Option<&str> {
        self.condition.as_ref().map(|c| c.reason.as_str())
    }
}

/// What read-only mode would have done for one key
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunReport {
    pub key: ReconcileKey,
    pub operations: Vec<Operation>,
    pub status: Option<ResourceStatus>,
}

/// Per-key mutual exclusion
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<ReconcileKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn entry(&self, key: &ReconcileKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &ReconcileKey) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Exclusive access to `key` if nobody holds it
    pub fn try_lock(&self, key: &ReconcileKey) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }

    /// Drop bookkeeping for a key nobody holds
    fn forget(&self, key: &ReconcileKey) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}

/// Where an object's broker operations go
pub(crate) enum Target {
    Connect {
        domain: ConnectionDomain,
        config: ConnectionConfig,
    },
    Blocked {
        reason: &'static str,
        message: String,
        requeue: Requeue,
    },
}

/// The reconciliation engine shared by both control loops
pub struct Engine {
    pub(crate) cache: Arc<ObjectCache>,
    pub(crate) connections: Arc<ConnectionManager>,
    pub(crate) writer: Arc<dyn ObjectWriter>,
    pub(crate) credentials: Arc<CredentialStore>,
    pub(crate) backoff: BackoffTracker,
    pub(crate) locks: KeyLocks,
    dry_run: broadcast::Sender<DryRunReport>,
    pub(crate) settings: EngineSettings,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("cache", &self.cache)
            .field("connections", &self.connections)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        cache: Arc<ObjectCache>,
        connections: Arc<ConnectionManager>,
        writer: Arc<dyn ObjectWriter>,
        credentials: Arc<CredentialStore>,
        settings: EngineSettings,
    ) -> Self {
        let (dry_run, _) = broadcast::channel(256);
        Self {
            cache,
            connections,
            writer,
            credentials,
            backoff: BackoffTracker::default(),
            locks: KeyLocks::default(),
            dry_run,
            settings,
        }
    }

    /// The object cache the engine reads
    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    /// Per-key locks held during reconciles
    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Receive what read-only mode would have done
    pub fn dry_run_reports(&self) -> broadcast::Receiver<DryRunReport> {
        self.dry_run.subscribe()
    }

    /// Delay before retrying a key whose reconcile returned an error
    pub fn retry_delay(&self, key: &ReconcileKey) -> Duration {
        self.backoff.next(key)
    }

    /// Bring one object in line with the broker
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<ReconcileReport, ControllerError> {
        match key.kind {
            ResourceKind::Account => self.reconcile_kind::<AccountReconciler>(key).await,
            ResourceKind::Stream => self.reconcile_kind::<StreamReconciler>(key).await,
            ResourceKind::Consumer => self.reconcile_kind::<ConsumerReconciler>(key).await,
            ResourceKind::StreamTemplate => self.reconcile_kind::<StreamTemplateReconciler>(key).await,
        }
    }

    async fn reconcile_kind<R: ResourceReconciler>(
        &self,
        key: &ReconcileKey,
    ) -> Result<ReconcileReport, ControllerError> {
        let guard = self.locks.lock(key).await;
        let Some(obj) = self.cache.get::<R::Object>(&key.namespace, &key.name) else {
            debug!("{} is gone, nothing to do", key);
            self.backoff.reset(key);
            drop(guard);
            self.locks.forget(key);
            return Ok(ReconcileReport::done(key));
        };

        if obj.meta().deletion_timestamp.is_some() {
            return finalizer::finalize::<R>(self, key, obj).await;
        }
        self.sync::<R>(key, obj).await
    }

    async fn sync<R: ResourceReconciler>(
        &self,
        key: &ReconcileKey,
        obj: Arc<R::Object>,
    ) -> Result<ReconcileReport, ControllerError> {
        let (domain, config) = match self.resolve_target(key, obj.account()).await {
            Target::Connect { domain, config } => (domain, config),
            Target::Blocked {
                reason,
                message,
                requeue,
            } => {
                return self
                    .record::<R>(key, &obj, Vec::new(), ConditionStatus::False, reason, message, requeue)
                    .await;
            }
        };

        let target = &*obj;
        let observed = match self
            .connections
            .with_handle(&domain, &config, move |client| async move {
                R::observe(client.as_ref(), target).await
            })
            .await
        {
            Ok(observed) => observed,
            Err(e) => return self.broker_failure::<R>(key, &obj, e, Vec::new(), 0).await,
        };

        let ops = match R::diff(&obj, observed.as_ref()) {
            Ok(ops) => ops,
            Err(DiffError::UnsupportedChange(fields)) => {
                let err = ControllerError::UnsupportedChange(fields.join(", "));
                warn!("{}: {}", key, err);
                return self
                    .record::<R>(
                        key,
                        &obj,
                        Vec::new(),
                        ConditionStatus::False,
                        REASON_UNSUPPORTED_CHANGE,
                        err.to_string(),
                        Requeue::Resync,
                    )
                    .await;
            }
            Err(DiffError::InvalidSpec(message)) => {
                warn!("{}: invalid spec: {}", key, message);
                return self
                    .record::<R>(
                        key,
                        &obj,
                        Vec::new(),
                        ConditionStatus::False,
                        REASON_INVALID_SPEC,
                        message,
                        Requeue::Resync,
                    )
                    .await;
            }
        };

        let mut prevented = Vec::new();
        let mut mutations = Vec::new();
        for op in ops.into_iter().filter(Operation::is_mutation) {
            match op {
                Operation::Update(fields) if obj.prevent_update() => prevented.extend(fields),
                op => mutations.push(op),
            }
        }
        if !prevented.is_empty() {
            info!("{} drifted ({}) but preventUpdate is set", key, prevented.join(", "));
        }

        if mutations.contains(&Operation::Create)
            && let Some(parent) = R::parents(&self.cache, &obj).into_iter().find(|p| !self.is_ready(p))
        {
            debug!("{} waits for {}", key, parent);
            return self
                .record::<R>(
                    key,
                    &obj,
                    Vec::new(),
                    ConditionStatus::False,
                    REASON_WAITING_FOR_PARENT,
                    format!("waiting for {} to become ready", parent),
                    Requeue::After(self.settings.parent_wait),
                )
                .await;
        }

        let current = obj.status().and_then(|s| s.condition(crds::CONDITION_READY));
        let (reason, message) = success_condition(key.kind, current, &mutations, &prevented);
        if self.settings.read_only {
            if !mutations.is_empty() {
                info!(
                    "Read-only: would apply [{}] to {}",
                    mutations.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                    key
                );
            }
            return self
                .record::<R>(key, &obj, mutations, ConditionStatus::True, reason, message, Requeue::Resync)
                .await;
        }

        let obj = finalizer::ensure_finalizer::<R>(self, key, obj).await?;

        let total = mutations.len();
        let target = &*obj;
        let observed_ref = observed.as_ref();
        for (applied, op) in mutations.iter().enumerate() {
            let result = self
                .connections
                .with_handle(&domain, &config, move |client| async move {
                    R::apply(client.as_ref(), target, observed_ref, op).await
                })
                .await;
            if let Err(e) = result {
                let done = mutations[..applied].to_vec();
                return self.broker_failure::<R>(key, &obj, e, done, total).await;
            }
        }

        self.backoff.reset(key);
        if !mutations.is_empty() {
            info!("Reconciled {}: {}", key, message);
        }
        self.record::<R>(key, &obj, mutations, ConditionStatus::True, reason, message, Requeue::Resync)
            .await
    }

    /// Connection an object's operations use
    pub(crate) async fn resolve_target(&self, key: &ReconcileKey, account_ref: Option<&str>) -> Target {
        let global = self.settings.global.as_ref().filter(|_| !self.settings.crd_connect);
        let account_name = match key.kind {
            ResourceKind::Account => Some(key.name.as_str()),
            _ => account_ref,
        };

        let Some(account_name) = account_name else {
            return match global {
                Some(config) => Target::Connect {
                    domain: ConnectionDomain::Global,
                    config: config.clone(),
                },
                None => Target::Blocked {
                    reason: REASON_NO_CONNECTION_CONFIG,
                    message: "no account referenced and no global connection configured".to_string(),
                    requeue: Requeue::Resync,
                },
            };
        };

        let Some(account) = self.cache.get::<Account>(&key.namespace, account_name) else {
            return Target::Blocked {
                reason: REASON_ACCOUNT_NOT_FOUND,
                message: format!("account {} not found in namespace {}", account_name, key.namespace),
                requeue: Requeue::After(self.settings.parent_wait),
            };
        };

        match self
            .credentials
            .account_config(&account, global)
            .await
        {
            Ok(Some(config)) if Some(&config) == global => Target::Connect {
                domain: ConnectionDomain::Global,
                config,
            },
            Ok(Some(config)) => Target::Connect {
                domain: ConnectionDomain::account(&key.namespace, account_name),
                config,
            },
            Ok(None) => Target::Blocked {
                reason: REASON_NO_CONNECTION_CONFIG,
                message: format!(
                    "account {} lists no servers and no global connection is configured",
                    account_name
                ),
                requeue: Requeue::Resync,
            },
            Err(e) => Target::Blocked {
                reason: REASON_CREDENTIALS_UNAVAILABLE,
                message: e.to_string(),
                requeue: Requeue::After(self.backoff.next(key)),
            },
        }
    }

    /// Whether the object behind `key` reports Ready=True
    pub(crate) fn is_ready(&self, key: &ReconcileKey) -> bool {
        fn ready<K: CachedObject>(cache: &ObjectCache, key: &ReconcileKey) -> bool {
            cache
                .get::<K>(&key.namespace, &key.name)
                .and_then(|o| o.status().map(ResourceStatus::is_ready))
                .unwrap_or(false)
        }
        match key.kind {
            ResourceKind::Account => ready::<Account>(&self.cache, key),
            ResourceKind::Stream => ready::<Stream>(&self.cache, key),
            ResourceKind::Consumer => ready::<Consumer>(&self.cache, key),
            ResourceKind::StreamTemplate => ready::<StreamTemplate>(&self.cache, key),
        }
    }

    /// Classify a broker error into a requeue and, except for outages, a condition
    pub(crate) async fn broker_failure<R: ResourceReconciler>(
        &self,
        key: &ReconcileKey,
        obj: &Arc<R::Object>,
        err: ControllerError,
        applied: Vec<Operation>,
        total: usize,
    ) -> Result<ReconcileReport, ControllerError> {
        if err.is_network() && applied.is_empty() {
            let delay = self.backoff.next(key);
            warn!("Broker unreachable for {}: {}; retrying in {:?}", key, err, delay);
            return Ok(ReconcileReport {
                key: key.clone(),
                operations: Vec::new(),
                requeue: Requeue::After(delay),
                condition: None,
            });
        }

        let (reason, message, requeue) = if err.is_auth() {
            (REASON_AUTHENTICATION_FAILED, err.to_string(), Requeue::Resync)
        } else if let ControllerError::JetStream(JetStreamError::Unsupported(msg)) = &err {
            (REASON_UNSUPPORTED_CHANGE, msg.clone(), Requeue::Resync)
        } else if !applied.is_empty() {
            let partial = ControllerError::PartialApply {
                applied: applied.len(),
                total,
                message: err.to_string(),
            };
            (REASON_PARTIAL_APPLY, partial.to_string(), Requeue::After(self.backoff.next(key)))
        } else {
            (REASON_APPLY_FAILED, err.to_string(), Requeue::After(self.backoff.next(key)))
        };
        warn!("Reconcile of {} failed ({}): {}", key, reason, message);
        self.record::<R>(key, obj, applied, ConditionStatus::False, reason, message, requeue)
            .await
    }

    /// Record the Ready condition (or publish it in read-only mode) and build the report
    #[allow(clippy::too_many_arguments, reason = "condition fields are passed individually")]
    pub(crate) async fn record<R: ResourceReconciler>(
        &self,
        key: &ReconcileKey,
        obj: &Arc<R::Object>,
        operations: Vec<Operation>,
        ready: ConditionStatus,
        reason: impl Into<String> + Send,
        message: String,
        requeue: Requeue,
    ) -> Result<ReconcileReport, ControllerError> {
        let condition = Condition::ready(ready, reason, message);
        if self.settings.read_only {
            let report = DryRunReport {
                key: key.clone(),
                operations: operations.clone(),
                status: status::next_status(
                    obj.status(),
                    obj.meta().generation,
                    condition.clone(),
                    Utc::now(),
                ),
            };
            // No receivers is fine
            let _ = self.dry_run.send(report);
        } else {
            self.write_condition::<R>(key, obj, condition.clone()).await?;
        }
        Ok(ReconcileReport {
            key: key.clone(),
            operations,
            requeue,
            condition: Some(condition),
        })
    }

    async fn write_condition<R: ResourceReconciler>(
        &self,
        key: &ReconcileKey,
        obj: &Arc<R::Object>,
        condition: Condition,
    ) -> Result<(), ControllerError> {
        let mut current = Arc::clone(obj);
        let mut attempt = 0;
        loop {
            let Some(status) = status::next_status(
                current.status(),
                current.meta().generation,
                condition.clone(),
                Utc::now(),
            ) else {
                return Ok(());
            };
            match self
                .writer
                .patch_status(key, current.meta().resource_version.as_deref(), &status)
                .await
            {
                Ok(value) => {
                    let updated: R::Object = serde_json::from_value(value)?;
                    self.cache.apply(updated).await;
                    return Ok(());
                }
                Err(ControllerError::Conflict(what)) if attempt < self.settings.max_conflict_retries => {
                    attempt += 1;
                    debug!("Status write for {} conflicted, refetching (attempt {})", what, attempt);
                    match self.refetch::<R>(key).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reload an object after a conflict, updating the cache
    pub(crate) async fn refetch<R: ResourceReconciler>(
        &self,
        key: &ReconcileKey,
    ) -> Result<Option<Arc<R::Object>>, ControllerError> {
        let Some(value) = self.writer.fetch(key).await? else {
            return Ok(None);
        };
        let fresh: R::Object = serde_json::from_value(value)?;
        self.cache.apply(fresh.clone()).await;
        Ok(Some(Arc::new(fresh)))
    }
}

/// Ready=True reason and message after a successful sync.
///
/// A sync that changed nothing keeps the reason of the previous successful one.
fn success_condition(
    kind: ResourceKind,
    current: Option<&Condition>,
    mutations: &[Operation],
    prevented: &[&'static str],
) -> (String, String) {
    if mutations.is_empty()
        && prevented.is_empty()
        && let Some(ready) = current.filter(|c| {
            c.status == ConditionStatus::True
                && [REASON_CREATED, REASON_UPDATED, REASON_SYNCED].contains(&c.reason.as_str())
        })
    {
        return (ready.reason.clone(), ready.message.clone());
    }
    if mutations.contains(&Operation::Create) {
        return (REASON_CREATED.to_string(), format!("{} created", kind));
    }
    let updated: Vec<&str> = mutations
        .iter()
        .filter_map(|op| match op {
            Operation::Update(fields) => Some(fields.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect();
    if !updated.is_empty() {
        return (REASON_UPDATED.to_string(), format!("updated {}", updated.join(", ")));
    }
    if !prevented.is_empty() {
        return (
            REASON_UPDATE_PREVENTED.to_string(),
            format!("drift in {} not applied: preventUpdate is set", prevented.join(", ")),
        );
    }
    (REASON_SYNCED.to_string(), format!("{} is in sync", kind))
}
