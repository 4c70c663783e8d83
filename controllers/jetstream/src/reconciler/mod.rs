//! Resource reconcilers
//!
//! One reconciler per JetStream kind. Each is a set of associated functions
//! over (desired object, observed broker state): `observe` reads the broker,
//! `diff` decides what to do and `apply` executes a single operation. The
//! engine drives them generically through [`ResourceReconciler`].
//!
//! Drift detection only looks at fields the user actually set, so defaults
//! filled in by the server never count as drift.

pub mod account;
pub mod consumer;
pub mod stream;
pub mod stream_template;


pub use account::AccountReconciler;
pub use consumer::ConsumerReconciler;
pub use stream::StreamReconciler;
pub use stream_template::StreamTemplateReconciler;

use crate::cache::{CachedObject, ObjectCache};
use async_trait::async_trait;
use jetstream_client::{JetStreamClientTrait, JetStreamError};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use thiserror::Error;

/// The closed set of reconciled kinds, ordered by dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Account,
    Stream,
    Consumer,
    StreamTemplate,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Account => "Account",
            ResourceKind::Stream => "Stream",
            ResourceKind::Consumer => "Consumer",
            ResourceKind::StreamTemplate => "StreamTemplate",
        };
        f.write_str(name)
    }
}

/// Identity of one object to reconcile
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A single broker operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create,
    /// Update restricted to the listed (camelCase) spec fields
    Update(Vec<&'static str>),
    Delete,
    NoOp,
}

impl Operation {
    /// Whether the operation changes broker state
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::NoOp)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => f.write_str("Create"),
            Operation::Update(fields) => write!(f, "Update({})", fields.join(", ")),
            Operation::Delete => f.write_str("Delete"),
            Operation::NoOp => f.write_str("NoOp"),
        }
    }
}

/// Why a diff could not produce operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    /// Immutable fields differ from the broker
    #[error("immutable fields cannot be changed: {}", .0.join(", "))]
    UnsupportedChange(Vec<&'static str>),

    /// The spec cannot be turned into a broker configuration
    #[error("{0}")]
    InvalidSpec(String),
}

/// Per-kind reconciliation logic
#[async_trait]
pub trait ResourceReconciler: Send + Sync + 'static {
    /// Custom resource reconciled
    type Object: CachedObject + Serialize + DeserializeOwned;
    /// Broker-side state
    type Observed: fmt::Debug + Send + Sync;

    /// Objects that must be Ready before this one may be created
    fn parents(cache: &ObjectCache, obj: &Self::Object) -> Vec<ReconcileKey>;

    /// Objects that must be gone before this one may be deleted
    fn dependents(_cache: &ObjectCache, _obj: &Self::Object) -> Vec<ReconcileKey> {
        Vec::new()
    }

    /// Read the live broker state, `None` when absent
    async fn observe(
        client: &dyn JetStreamClientTrait,
        obj: &Self::Object,
    ) -> Result<Option<Self::Observed>, JetStreamError>;

    /// Operations that converge the broker on the object
    fn diff(obj: &Self::Object, observed: Option<&Self::Observed>) -> Result<Vec<Operation>, DiffError>;

    /// Execute one operation
    async fn apply(
        client: &dyn JetStreamClientTrait,
        obj: &Self::Object,
        observed: Option<&Self::Observed>,
        op: &Operation,
    ) -> Result<(), JetStreamError>;
}

/// Shared handling of the two cases every kind treats alike.
///
/// Returns `Some(ops)` when the object is being deleted or is absent from
/// the broker, `None` when the caller has to compare fields.
pub(crate) fn lifecycle_ops<K: Resource, O>(obj: &K, observed: Option<&O>) -> Option<Vec<Operation>> {
    match (obj.meta().deletion_timestamp.is_some(), observed.is_some()) {
        (true, true) => Some(vec![Operation::Delete]),
        (true, false) => Some(vec![Operation::NoOp]),
        (false, false) => Some(vec![Operation::Create]),
        (false, true) => None,
    }
}

/// Split changed fields into an Update, or fail on an immutable one
pub(crate) fn update_or_reject(
    changed: Vec<&'static str>,
    immutable: &[&'static str],
) -> Result<Vec<Operation>, DiffError> {
    let rejected: Vec<_> = changed
        .iter()
        .copied()
        .filter(|f| immutable.contains(f))
        .collect();
    if !rejected.is_empty() {
        return Err(DiffError::UnsupportedChange(rejected));
    }
    if changed.is_empty() {
        Ok(vec![Operation::NoOp])
    } else {
        Ok(vec![Operation::Update(changed)])
    }
}

/// Parse a human-readable duration (`"90s"`, `"1h 30m"`) into nanoseconds
pub(crate) fn parse_nanos(field: &str, value: &str) -> Result<i64, DiffError> {
    let duration = humantime::parse_duration(value)
        .map_err(|e| DiffError::InvalidSpec(format!("{}: invalid duration {:?}: {}", field, value, e)))?;
    i64::try_from(duration.as_nanos())
        .map_err(|_| DiffError::InvalidSpec(format!("{}: duration {:?} is too long", field, value)))
}

/// Push `name` when the two values differ
pub(crate) fn track<T: PartialEq>(changed: &mut Vec<&'static str>, name: &'static str, a: &T, b: &T) {
    if a != b {
        changed.push(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_order_follows_dependencies() {
        let mut kinds = vec![
            ResourceKind::StreamTemplate,
            ResourceKind::Consumer,
            ResourceKind::Account,
            ResourceKind::Stream,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Account,
                ResourceKind::Stream,
                ResourceKind::Consumer,
                ResourceKind::StreamTemplate,
            ]
        );
    }

    #[test]
    fn test_key_display() {
        let key = ReconcileKey::new(ResourceKind::Consumer, "default", "c1");
        assert_eq!(key.to_string(), "Consumer default/c1");
    }

    #[test]
    fn test_update_or_reject() {
        assert_eq!(update_or_reject(vec![], &["storage"]).unwrap(), vec![Operation::NoOp]);
        assert_eq!(
            update_or_reject(vec!["subjects"], &["storage"]).unwrap(),
            vec![Operation::Update(vec!["subjects"])]
        );
        assert_eq!(
            update_or_reject(vec!["subjects", "storage"], &["storage"]).unwrap_err(),
            DiffError::UnsupportedChange(vec!["storage"])
        );
    }

    #[test]
    fn test_parse_nanos() {
        assert_eq!(parse_nanos("maxAge", "1h").unwrap(), 3_600_000_000_000);
        assert_eq!(parse_nanos("ackWait", "1m 30s").unwrap(), 90_000_000_000);
        assert!(matches!(parse_nanos("maxAge", "soon"), Err(DiffError::InvalidSpec(_))));
    }
}
