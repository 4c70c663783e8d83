//! Local object cache.
//!
//! A namespace-and-name indexed, read-only snapshot of every JetStream object
//! the controller can see. It is written only by the change feed (and by the
//! engine echoing back its own status writes) and hands objects out as
//! shared `Arc`s.
//!
//! Subscribers receive one [`ChangeEvent`] per meaningful change. Updates
//! that leave both `metadata.generation` and the deletion marker alone
//! (status and finalizer writes) are stored without notifying anyone, so the
//! controller's own writes do not retrigger reconciliation.

use crate::error::ControllerError;
use crate::reconciler::{ReconcileKey, ResourceKind};
use crds::{Account, Consumer, JetStreamResource, Stream, StreamTemplate};
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// What happened to a cached object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// Notification sent to cache subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: ReconcileKey,
    pub kind: ChangeKind,
}

/// A JetStream kind that lives in the cache
pub trait CachedObject:
    Resource<DynamicType = ()> + JetStreamResource + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Kind tag used in reconcile keys
    const KIND: ResourceKind;

    /// The store holding this kind
    fn store(cache: &ObjectCache) -> &Store<Self>;
}

macro_rules! cached_object {
    ($ty:ty, $kind:expr, $field:ident) => {
        impl CachedObject for $ty {
            const KIND: ResourceKind = $kind;

            fn store(cache: &ObjectCache) -> &Store<Self> {
                &cache.$field
            }
        }
    };
}

cached_object!(Account, ResourceKind::Account, accounts);
cached_object!(Stream, ResourceKind::Stream, streams);
cached_object!(Consumer, ResourceKind::Consumer, consumers);
cached_object!(StreamTemplate, ResourceKind::StreamTemplate, templates);

/// Label equality selector (`app=orders,tier!=test`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<(String, String, bool)>,
}

impl LabelSelector {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// Whether `labels` satisfy every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|(key, value, equal)| {
            let found = labels.get(key).is_some_and(|v| v == value);
            found == *equal
        })
    }
}

impl FromStr for LabelSelector {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value, equal) = if let Some((k, v)) = term.split_once("!=") {
                (k, v, false)
            } else if let Some((k, v)) = term.split_once("==") {
                (k, v, true)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, v, true)
            } else {
                return Err(ControllerError::Config(format!("invalid label selector term {:?}", term)));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(ControllerError::Config(format!("invalid label selector term {:?}", term)));
            }
            requirements.push((key.to_string(), value.trim().to_string(), equal));
        }
        Ok(Self { requirements })
    }
}

type ObjectRef = (String, String);

/// Objects of one kind, indexed by (namespace, name)
pub struct Store<K> {
    objects: RwLock<HashMap<ObjectRef, Arc<K>>>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: CachedObject> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("len", &self.len()).finish()
    }
}

impl<K: CachedObject> Store<K> {
    /// Get one object
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    /// Snapshot of the objects in `namespace` (all namespaces for `None`) matching `selector`
    pub fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<Arc<K>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|n| n == ns))
            .filter(|(_, obj)| selector.matches(obj.labels()))
            .map(|(_, obj)| Arc::clone(obj))
            .collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&self) -> Vec<ObjectRef> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects.keys().cloned().collect()
    }

    fn insert(&self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = (obj.namespace().unwrap_or_default(), obj.name_any());
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(key, obj)
    }

    fn remove(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.remove(&(namespace.to_string(), name.to_string()))
    }
}

/// Shared snapshot of all JetStream objects
#[derive(Default)]
pub struct ObjectCache {
    accounts: Store<Account>,
    streams: Store<Stream>,
    consumers: Store<Consumer>,
    templates: Store<StreamTemplate>,
    subscribers: Mutex<Vec<mpsc::Sender<ChangeEvent>>>,
}

impl fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("accounts", &self.accounts)
            .field("streams", &self.streams)
            .field("consumers", &self.consumers)
            .field("templates", &self.templates)
            .finish_non_exhaustive()
    }
}

fn key_of<K: CachedObject>(obj: &K) -> ReconcileKey {
    ReconcileKey::new(K::KIND, obj.namespace().unwrap_or_default(), obj.name_any())
}

fn is_meaningful_update<K: CachedObject>(old: &K, new: &K) -> bool {
    old.meta().generation != new.meta().generation
        || old.meta().deletion_timestamp.is_some() != new.meta().deletion_timestamp.is_some()
}

/// Whether `candidate` carries a later state of the object than `cached`.
///
/// Resource versions are only compared when both parse as integers.
fn is_newer<K: CachedObject>(candidate: &K, cached: &K) -> bool {
    let (new, old) = (candidate.meta(), cached.meta());
    if new.generation.unwrap_or(0) != old.generation.unwrap_or(0) {
        return new.generation.unwrap_or(0) > old.generation.unwrap_or(0);
    }
    if new.deletion_timestamp.is_some() && old.deletion_timestamp.is_none() {
        return true;
    }
    let version = |meta: &kube::api::ObjectMeta| {
        meta.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok())
    };
    matches!((version(new), version(old)), (Some(new), Some(old)) if new > old)
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts store
    pub fn accounts(&self) -> &Store<Account> {
        &self.accounts
    }

    /// Streams store
    pub fn streams(&self) -> &Store<Stream> {
        &self.streams
    }

    /// Consumers store
    pub fn consumers(&self) -> &Store<Consumer> {
        &self.consumers
    }

    /// StreamTemplates store
    pub fn templates(&self) -> &Store<StreamTemplate> {
        &self.templates
    }

    /// Get an object of kind `K`
    pub fn get<K: CachedObject>(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        K::store(self).get(namespace, name)
    }

    /// Register for change notifications on a bounded channel.
    ///
    /// Senders wait when the channel is full, so events are never dropped
    /// and arrive in the order they were applied.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    async fn notify(&self, event: ChangeEvent) {
        trace!("Cache event {:?} for {}", event.kind, event.key);
        let subscribers: Vec<_> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut closed = false;
        for tx in subscribers {
            if tx.send(event.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|tx| !tx.is_closed());
        }
    }

    /// Store a new or changed object, notifying subscribers if it matters
    pub async fn apply<K: CachedObject>(&self, obj: K) {
        let key = key_of(&obj);
        let obj = Arc::new(obj);
        let kind = match K::store(self).insert(Arc::clone(&obj)) {
            None => Some(ChangeKind::Added),
            Some(old) if is_meaningful_update(old.as_ref(), obj.as_ref()) => Some(ChangeKind::Updated),
            Some(_) => None,
        };
        match kind {
            Some(kind) => self.notify(ChangeEvent { key, kind }).await,
            None => debug!("Cached {} without notification", key),
        }
    }

    /// Store `obj` unless the cached copy is at least as new.
    ///
    /// Returns true when `obj` was stored.
    pub async fn apply_if_newer<K: CachedObject>(&self, obj: K) -> bool {
        let cached = K::store(self).get(&obj.namespace().unwrap_or_default(), &obj.name_any());
        let newer = cached.is_none_or(|cached| is_newer(&obj, &*cached));
        if newer {
            self.apply(obj).await;
        }
        newer
    }

    /// Remove an object that no longer exists in the API
    pub async fn remove<K: CachedObject>(&self, namespace: &str, name: &str) {
        if K::store(self).remove(namespace, name).is_some() {
            let key = ReconcileKey::new(K::KIND, namespace, name);
            self.notify(ChangeEvent {
                key,
                kind: ChangeKind::Deleted,
            })
            .await;
        }
    }

    /// Replace every object of kind `K` after a (re)list.
    ///
    /// Objects missing from `objects` are pruned and reported as deleted.
    pub async fn replace_all<K: CachedObject>(&self, objects: Vec<K>) {
        let listed: HashSet<ObjectRef> = objects
            .iter()
            .map(|o| (o.namespace().unwrap_or_default(), o.name_any()))
            .collect();
        for (namespace, name) in K::store(self).keys() {
            if !listed.contains(&(namespace.clone(), name.clone())) {
                self.remove::<K>(&namespace, &name).await;
            }
        }
        for obj in objects {
            self.apply(obj).await;
        }
    }

    /// Every cached key, Accounts first, then Streams, Consumers and StreamTemplates
    pub fn keys_in_order(&self) -> Vec<ReconcileKey> {
        fn collect<K: CachedObject>(store: &Store<K>, out: &mut Vec<ReconcileKey>) {
            out.extend(
                store
                    .keys()
                    .into_iter()
                    .map(|(ns, name)| ReconcileKey::new(K::KIND, ns, name)),
            );
        }
        let mut keys = Vec::new();
        collect(&self.accounts, &mut keys);
        collect(&self.streams, &mut keys);
        collect(&self.consumers, &mut keys);
        collect(&self.templates, &mut keys);
        keys.sort();
        keys
    }

    /// Stream object in `namespace` managing the broker stream `broker_name`
    pub fn find_stream(&self, namespace: &str, broker_name: &str) -> Option<Arc<Stream>> {
        self.streams
            .list(Some(namespace), &LabelSelector::everything())
            .into_iter()
            .find(|s| s.broker_name() == broker_name)
    }

    /// Streams, Consumers and StreamTemplates in `namespace` that reference Account `account`
    pub fn account_dependents(&self, namespace: &str, account: &str) -> Vec<ReconcileKey> {
        fn collect<K: CachedObject>(store: &Store<K>, namespace: &str, account: &str, out: &mut Vec<ReconcileKey>) {
            out.extend(
                store
                    .list(Some(namespace), &LabelSelector::everything())
                    .iter()
                    .filter(|o| o.account() == Some(account))
                    .map(|o| key_of(o.as_ref())),
            );
        }
        let mut keys = Vec::new();
        collect(&self.streams, namespace, account, &mut keys);
        collect(&self.consumers, namespace, account, &mut keys);
        collect(&self.templates, namespace, account, &mut keys);
        keys.sort();
        keys
    }

}
