//! Consumer reconciler
//!
//! Consumers are always durable; the durable name comes from
//! `spec.durableName` or the object name. A consumer waits for the Stream
//! object managing its stream (when there is one) to become Ready before it
//! is created.

use super::{
    DiffError, Operation, ReconcileKey, ResourceKind, ResourceReconciler, lifecycle_ops, parse_nanos, track,
    update_or_reject,
};
use crate::cache::ObjectCache;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crds::{Consumer, ConsumerSpec, JetStreamResource};
use jetstream_client::{ConsumerConfig, ConsumerInfo, JetStreamClientTrait, JetStreamError};
use kube::ResourceExt;
use tracing::info;

/// Fields the broker refuses to change on an existing consumer
pub const IMMUTABLE_FIELDS: &[&str] = &[
    "durableName",
    "deliverPolicy",
    "optStartSeq",
    "optStartTime",
    "ackPolicy",
    "replayPolicy",
    "deliverGroup",
];

/// Reconciler for [`Consumer`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerReconciler;

fn deliver_policy(policy: crds::DeliverPolicy) -> jetstream_client::DeliverPolicy {
    match policy {
        crds::DeliverPolicy::All => jetstream_client::DeliverPolicy::All,
        crds::DeliverPolicy::Last => jetstream_client::DeliverPolicy::Last,
        crds::DeliverPolicy::New => jetstream_client::DeliverPolicy::New,
        crds::DeliverPolicy::ByStartSequence => jetstream_client::DeliverPolicy::ByStartSequence,
        crds::DeliverPolicy::ByStartTime => jetstream_client::DeliverPolicy::ByStartTime,
        crds::DeliverPolicy::LastPerSubject => jetstream_client::DeliverPolicy::LastPerSubject,
    }
}

fn ack_policy(policy: crds::AckPolicy) -> jetstream_client::AckPolicy {
    match policy {
        crds::AckPolicy::Explicit => jetstream_client::AckPolicy::Explicit,
        crds::AckPolicy::All => jetstream_client::AckPolicy::All,
        crds::AckPolicy::None => jetstream_client::AckPolicy::None,
    }
}

fn replay_policy(policy: crds::ReplayPolicy) -> jetstream_client::ReplayPolicy {
    match policy {
        crds::ReplayPolicy::Instant => jetstream_client::ReplayPolicy::Instant,
        crds::ReplayPolicy::Original => jetstream_client::ReplayPolicy::Original,
    }
}

fn validate(spec: &ConsumerSpec) -> Result<(), DiffError> {
    if spec.stream_name.is_empty() {
        return Err(DiffError::InvalidSpec("streamName is required".to_string()));
    }
    match spec.deliver_policy {
        crds::DeliverPolicy::ByStartSequence if spec.opt_start_seq.is_none() => Err(DiffError::InvalidSpec(
            "deliverPolicy byStartSequence requires optStartSeq".to_string(),
        )),
        crds::DeliverPolicy::ByStartTime if spec.opt_start_time.is_none() => Err(DiffError::InvalidSpec(
            "deliverPolicy byStartTime requires optStartTime".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Write every field set in `spec` into `config`
pub(crate) fn overlay(spec: &ConsumerSpec, durable: &str, config: &mut ConsumerConfig) -> Result<(), DiffError> {
    validate(spec)?;
    config.durable_name = Some(durable.to_string());
    if let Some(description) = &spec.description {
        config.description = Some(description.clone());
    }
    config.deliver_policy = deliver_policy(spec.deliver_policy);
    if let Some(seq) = spec.opt_start_seq {
        config.opt_start_seq = Some(seq);
    }
    if let Some(time) = &spec.opt_start_time {
        let parsed = DateTime::parse_from_rfc3339(time)
            .map_err(|e| DiffError::InvalidSpec(format!("optStartTime: {:?} is not RFC 3339: {}", time, e)))?;
        config.opt_start_time = Some(parsed.with_timezone(&Utc));
    }
    config.ack_policy = ack_policy(spec.ack_policy);
    if let Some(wait) = &spec.ack_wait {
        config.ack_wait = parse_nanos("ackWait", wait)?;
    }
    if let Some(v) = spec.max_deliver {
        config.max_deliver = v;
    }
    if let Some(subject) = &spec.filter_subject {
        config.filter_subject = Some(subject.clone());
    }
    config.replay_policy = replay_policy(spec.replay_policy);
    if let Some(freq) = &spec.sample_freq {
        config.sample_freq = Some(freq.clone());
    }
    if let Some(v) = spec.rate_limit_bps {
        config.rate_limit_bps = v;
    }
    if let Some(v) = spec.max_ack_pending {
        config.max_ack_pending = v;
    }
    if let Some(v) = spec.max_waiting {
        config.max_waiting = v;
    }
    if let Some(subject) = &spec.deliver_subject {
        config.deliver_subject = Some(subject.clone());
    }
    if let Some(group) = &spec.deliver_group {
        config.deliver_group = Some(group.clone());
    }
    config.headers_only = spec.headers_only;
    if !spec.backoff.is_empty() {
        config.backoff = spec
            .backoff
            .iter()
            .map(|b| parse_nanos("backoff", b))
            .collect::<Result<_, _>>()?;
    }
    if let Some(replicas) = spec.replicas {
        config.num_replicas = replicas;
    }
    Ok(())
}

/// Spec fields (camelCase) whose broker values differ
pub(crate) fn changed_fields(live: &ConsumerConfig, wanted: &ConsumerConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    track(&mut changed, "durableName", &live.durable_name, &wanted.durable_name);
    track(&mut changed, "description", &live.description, &wanted.description);
    track(&mut changed, "deliverPolicy", &live.deliver_policy, &wanted.deliver_policy);
    track(&mut changed, "optStartSeq", &live.opt_start_seq, &wanted.opt_start_seq);
    track(&mut changed, "optStartTime", &live.opt_start_time, &wanted.opt_start_time);
    track(&mut changed, "ackPolicy", &live.ack_policy, &wanted.ack_policy);
    track(&mut changed, "ackWait", &live.ack_wait, &wanted.ack_wait);
    track(&mut changed, "maxDeliver", &live.max_deliver, &wanted.max_deliver);
    track(&mut changed, "filterSubject", &live.filter_subject, &wanted.filter_subject);
    track(&mut changed, "replayPolicy", &live.replay_policy, &wanted.replay_policy);
    track(&mut changed, "sampleFreq", &live.sample_freq, &wanted.sample_freq);
    track(&mut changed, "rateLimitBps", &live.rate_limit_bps, &wanted.rate_limit_bps);
    track(&mut changed, "maxAckPending", &live.max_ack_pending, &wanted.max_ack_pending);
    track(&mut changed, "maxWaiting", &live.max_waiting, &wanted.max_waiting);
    track(&mut changed, "deliverSubject", &live.deliver_subject, &wanted.deliver_subject);
    track(&mut changed, "deliverGroup", &live.deliver_group, &wanted.deliver_group);
    track(&mut changed, "headersOnly", &live.headers_only, &wanted.headers_only);
    track(&mut changed, "backoff", &live.backoff, &wanted.backoff);
    track(&mut changed, "replicas", &live.num_replicas, &wanted.num_replicas);
    changed
}

fn invalid(e: DiffError) -> JetStreamError {
    JetStreamError::InvalidRequest(e.to_string())
}

#[async_trait]
impl ResourceReconciler for ConsumerReconciler {
    type Object = Consumer;
    type Observed = ConsumerInfo;

    fn parents(cache: &ObjectCache, obj: &Consumer) -> Vec<ReconcileKey> {
        let namespace = obj.namespace().unwrap_or_default();
        let mut parents = Vec::new();
        if let Some(account) = obj.account() {
            parents.push(ReconcileKey::new(ResourceKind::Account, namespace.clone(), account));
        }
        if let Some(stream) = cache.find_stream(&namespace, &obj.spec.stream_name) {
            parents.push(ReconcileKey::new(ResourceKind::Stream, namespace, stream.name_any()));
        }
        parents
    }

    async fn observe(
        client: &dyn JetStreamClientTrait,
        obj: &Consumer,
    ) -> Result<Option<ConsumerInfo>, JetStreamError> {
        match client.get_consumer(&obj.spec.stream_name, &obj.broker_name()).await {
            // A missing stream means the consumer is gone too
            Err(e) if e.is_not_found() => Ok(None),
            result => result,
        }
    }

    fn diff(obj: &Consumer, observed: Option<&ConsumerInfo>) -> Result<Vec<Operation>, DiffError> {
        if let Some(ops) = lifecycle_ops(obj, observed) {
            if ops == [Operation::Create] {
                overlay(&obj.spec, &obj.broker_name(), &mut ConsumerConfig::default())?;
            }
            return Ok(ops);
        }
        let Some(info) = observed else {
            return Ok(vec![Operation::NoOp]);
        };

        let mut wanted = info.config.clone();
        overlay(&obj.spec, &obj.broker_name(), &mut wanted)?;
        update_or_reject(changed_fields(&info.config, &wanted), IMMUTABLE_FIELDS)
    }

    async fn apply(
        client: &dyn JetStreamClientTrait,
        obj: &Consumer,
        observed: Option<&ConsumerInfo>,
        op: &Operation,
    ) -> Result<(), JetStreamError> {
        let name = obj.broker_name();
        let stream = &obj.spec.stream_name;
        match op {
            Operation::Create => {
                let mut config = ConsumerConfig::default();
                overlay(&obj.spec, &name, &mut config).map_err(invalid)?;
                client.create_consumer(stream, &config).await?;
                info!("Created consumer {} on stream {}", name, stream);
            }
            Operation::Update(fields) => {
                let mut config = observed.map(|o| o.config.clone()).unwrap_or_default();
                overlay(&obj.spec, &name, &mut config).map_err(invalid)?;
                client.update_consumer(stream, &config).await?;
                info!("Updated consumer {} on stream {} ({})", name, stream, fields.join(", "));
            }
            Operation::Delete => match client.delete_consumer(stream, &name).await {
                Ok(true) => info!("Deleted consumer {} on stream {}", name, stream),
                Ok(false) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            },
            Operation::NoOp => {}
        }
        Ok(())
    }
}
