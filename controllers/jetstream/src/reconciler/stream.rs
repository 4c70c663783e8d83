//! Stream reconciler
//!
//! `storage` and `retention` cannot change once a stream exists; every other
//! field the user sets is updated in place.

use super::{
    DiffError, Operation, ReconcileKey, ResourceKind, ResourceReconciler, lifecycle_ops, parse_nanos, track,
    update_or_reject,
};
use crate::cache::ObjectCache;
use async_trait::async_trait;
use crds::{Stream, StreamSettings};
use jetstream_client::{JetStreamClientTrait, JetStreamError, StreamConfig, StreamInfo};
use kube::ResourceExt;
use tracing::info;

/// Fields the broker refuses to change on an existing stream
pub const IMMUTABLE_FIELDS: &[&str] = &["storage", "retention"];

/// Reconciler for [`Stream`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamReconciler;

pub(crate) fn retention(policy: crds::RetentionPolicy) -> jetstream_client::RetentionPolicy {
    match policy {
        crds::RetentionPolicy::Limits => jetstream_client::RetentionPolicy::Limits,
        crds::RetentionPolicy::Interest => jetstream_client::RetentionPolicy::Interest,
        crds::RetentionPolicy::WorkQueue => jetstream_client::RetentionPolicy::WorkQueue,
    }
}

pub(crate) fn storage(storage: crds::StorageType) -> jetstream_client::StorageType {
    match storage {
        crds::StorageType::File => jetstream_client::StorageType::File,
        crds::StorageType::Memory => jetstream_client::StorageType::Memory,
    }
}

pub(crate) fn discard(policy: crds::DiscardPolicy) -> jetstream_client::DiscardPolicy {
    match policy {
        crds::DiscardPolicy::Old => jetstream_client::DiscardPolicy::Old,
        crds::DiscardPolicy::New => jetstream_client::DiscardPolicy::New,
    }
}

/// Write every field set in `settings` into `config`.
///
/// Unset optional fields keep whatever `config` already holds, which is the
/// broker default for a new stream and the live value for an existing one.
pub(crate) fn overlay(settings: &StreamSettings, config: &mut StreamConfig) -> Result<(), DiffError> {
    if let Some(description) = &settings.description {
        config.description = Some(description.clone());
    }
    if !settings.subjects.is_empty() {
        config.subjects = settings.subjects.clone();
    }
    config.retention = retention(settings.retention);
    config.storage = storage(settings.storage);
    config.num_replicas = settings.replicas.max(1);
    if let Some(v) = settings.max_consumers {
        config.max_consumers = v;
    }
    if let Some(v) = settings.max_msgs {
        config.max_msgs = v;
    }
    if let Some(v) = settings.max_bytes {
        config.max_bytes = v;
    }
    if let Some(v) = &settings.max_age {
        config.max_age = parse_nanos("maxAge", v)?;
    }
    if let Some(v) = settings.max_msg_size {
        config.max_msg_size = v;
    }
    if let Some(v) = settings.max_msgs_per_subject {
        config.max_msgs_per_subject = v;
    }
    config.discard = discard(settings.discard);
    if let Some(v) = &settings.duplicate_window {
        config.duplicate_window = parse_nanos("duplicateWindow", v)?;
    }
    config.no_ack = settings.no_ack;
    config.deny_delete = settings.deny_delete;
    config.deny_purge = settings.deny_purge;
    config.allow_rollup_hdrs = settings.allow_rollup;
    config.allow_direct = settings.allow_direct;
    Ok(())
}

/// Spec fields (camelCase) whose broker values differ
pub(crate) fn changed_fields(live: &StreamConfig, wanted: &StreamConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    track(&mut changed, "description", &live.description, &wanted.description);
    track(&mut changed, "subjects", &live.subjects, &wanted.subjects);
    track(&mut changed, "retention", &live.retention, &wanted.retention);
    track(&mut changed, "storage", &live.storage, &wanted.storage);
    track(&mut changed, "replicas", &live.num_replicas, &wanted.num_replicas);
    track(&mut changed, "maxConsumers", &live.max_consumers, &wanted.max_consumers);
    track(&mut changed, "maxMsgs", &live.max_msgs, &wanted.max_msgs);
    track(&mut changed, "maxBytes", &live.max_bytes, &wanted.max_bytes);
    track(&mut changed, "maxAge", &live.max_age, &wanted.max_age);
    track(&mut changed, "maxMsgSize", &live.max_msg_size, &wanted.max_msg_size);
    track(&mut changed, "maxMsgsPerSubject", &live.max_msgs_per_subject, &wanted.max_msgs_per_subject);
    track(&mut changed, "discard", &live.discard, &wanted.discard);
    track(&mut changed, "duplicateWindow", &live.duplicate_window, &wanted.duplicate_window);
    track(&mut changed, "noAck", &live.no_ack, &wanted.no_ack);
    track(&mut changed, "denyDelete", &live.deny_delete, &wanted.deny_delete);
    track(&mut changed, "denyPurge", &live.deny_purge, &wanted.deny_purge);
    track(&mut changed, "allowRollup", &live.allow_rollup_hdrs, &wanted.allow_rollup_hdrs);
    track(&mut changed, "allowDirect", &live.allow_direct, &wanted.allow_direct);
    changed
}

/// Configuration for a new stream
pub(crate) fn desired_config(name: String, settings: &StreamSettings) -> Result<StreamConfig, DiffError> {
    if name.is_empty() {
        return Err(DiffError::InvalidSpec("stream name is empty".to_string()));
    }
    let mut config = StreamConfig {
        name,
        ..StreamConfig::default()
    };
    overlay(settings, &mut config)?;
    Ok(config)
}

#[async_trait]
impl ResourceReconciler for StreamReconciler {
    type Object = Stream;
    type Observed = StreamInfo;

    fn parents(_cache: &ObjectCache, obj: &Stream) -> Vec<ReconcileKey> {
        crds::JetStreamResource::account(obj)
            .map(|account| {
                ReconcileKey::new(ResourceKind::Account, obj.namespace().unwrap_or_default(), account)
            })
            .into_iter()
            .collect()
    }

    async fn observe(
        client: &dyn JetStreamClientTrait,
        obj: &Stream,
    ) -> Result<Option<StreamInfo>, JetStreamError> {
        client.get_stream(&obj.broker_name()).await
    }

    fn diff(obj: &Stream, observed: Option<&StreamInfo>) -> Result<Vec<Operation>, DiffError> {
        if let Some(ops) = lifecycle_ops(obj, observed) {
            if ops == [Operation::Create] {
                desired_config(obj.broker_name(), &obj.spec.config)?;
            }
            return Ok(ops);
        }
        let Some(info) = observed else {
            return Ok(vec![Operation::NoOp]);
        };

        let mut wanted = info.config.clone();
        overlay(&obj.spec.config, &mut wanted)?;
        update_or_reject(changed_fields(&info.config, &wanted), IMMUTABLE_FIELDS)
    }

    async fn apply(
        client: &dyn JetStreamClientTrait,
        obj: &Stream,
        observed: Option<&StreamInfo>,
        op: &Operation,
    ) -> Result<(), JetStreamError> {
        let name = obj.broker_name();
        match op {
            Operation::Create => {
                let config = desired_config(name.clone(), &obj.spec.config)
                    .map_err(|e| JetStreamError::InvalidRequest(e.to_string()))?;
                client.create_stream(&config).await?;
                info!("Created stream {}", name);
            }
            Operation::Update(fields) => {
                let mut config = match observed {
                    Some(info) => info.config.clone(),
                    None => StreamConfig {
                        name: name.clone(),
                        ..StreamConfig::default()
                    },
                };
                overlay(&obj.spec.config, &mut config)
                    .map_err(|e| JetStreamError::InvalidRequest(e.to_string()))?;
                client.update_stream(&config).await?;
                info!("Updated stream {} ({})", name, fields.join(", "));
            }
            Operation::Delete => {
                if client.delete_stream(&name).await? {
                    info!("Deleted stream {}", name);
                }
            }
            Operation::NoOp => {}
        }
        Ok(())
    }
}
