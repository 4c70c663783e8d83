//! Engine tests over a mock broker and an in-memory API server

use crate::engine::{EngineSettings, Requeue};
use crate::reconciler::{Operation, ReconcileKey, ResourceKind, StreamReconciler};
use crate::status::*;
use crate::test_utils::*;
use crds::{Account, ConditionStatus, FINALIZER, Stream};
use jetstream_client::{JetStreamClientTrait, JetStreamError, MockFailure, MockOp, StorageType};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "default";

async fn created_stream(h: &TestHarness, stream: Stream) -> String {
    let name = stream.name_any();
    h.add(stream).await;
    let report = h.reconcile(ResourceKind::Stream, NS, &name).await;
    assert_eq!(report.reason(), Some(REASON_CREATED));
    name
}

fn set_live_subjects(h: &TestHarness, stream: &str, subjects: &[&str]) {
    let mut live = h.broker.stream(stream).unwrap();
    live.subjects = subjects.iter().map(ToString::to_string).collect();
    h.broker.add_stream(live);
}

#[tokio::test]
async fn test_create_adds_finalizer_and_ready_condition() {
    let h = TestHarness::new();
    h.add(create_test_stream("s1", NS)).await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.operations, vec![Operation::Create]);
    assert_eq!(report.requeue, Requeue::Resync);
    assert!(h.broker.stream("s1").is_some());

    let stored = h.get::<Stream>(NS, "s1").unwrap();
    assert!(stored.finalizers().iter().any(|f| f == FINALIZER));
    let ready = ready_condition(stored.as_ref()).unwrap();
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.reason, REASON_CREATED);
    assert_eq!(stored.status.as_ref().unwrap().observed_generation, Some(1));
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = TestHarness::new();
    created_stream(&h, create_test_stream("s1", NS)).await;
    let mutations = h.broker.mutation_count();
    let writes = h.writer.status_writes();

    for _ in 0..2 {
        let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
        assert!(report.operations.is_empty());
        assert_eq!(report.reason(), Some(REASON_CREATED), "converged sync keeps the reason");
    }
    assert_eq!(h.broker.mutation_count(), mutations, "no broker mutations once converged");
    assert_eq!(h.writer.status_writes(), writes, "unchanged status is not rewritten");
}

#[tokio::test]
async fn test_drift_fix_then_converged_sync_keeps_updated() {
    let h = TestHarness::new();
    created_stream(&h, create_test_stream("s1", NS)).await;
    set_live_subjects(&h, "s1", &["drifted.>"]);

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_UPDATED));

    let writes = h.writer.status_writes();
    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert!(report.operations.is_empty());
    assert_eq!(report.reason(), Some(REASON_UPDATED));
    assert_eq!(h.writer.status_writes(), writes);
}

#[tokio::test]
async fn test_children_wait_for_ready_parents() {
    let h = TestHarness::new();
    let account = create_test_account("acct-a", NS);
    let mut stream = create_test_stream("s1", NS);
    stream.spec.account = Some("acct-a".to_string());
    let mut consumer = create_test_consumer("c1", NS, "s1");
    consumer.spec.account = Some("acct-a".to_string());
    h.add(account).await;
    h.add(stream).await;
    h.add(consumer).await;

    // Children first: nothing may be created before the Account is Ready
    let report = h.reconcile(ResourceKind::Consumer, NS, "c1").await;
    assert_eq!(report.reason(), Some(REASON_WAITING_FOR_PARENT));
    assert_eq!(report.requeue, Requeue::After(EngineSettings::default().parent_wait));
    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_WAITING_FOR_PARENT));
    assert_eq!(h.broker.mutation_count(), 0);

    assert_eq!(
        h.reconcile(ResourceKind::Account, NS, "acct-a").await.reason(),
        Some(REASON_CREATED)
    );
    // Stream still missing on the broker, so the Consumer keeps waiting on it
    let report = h.reconcile(ResourceKind::Consumer, NS, "c1").await;
    assert!(report.condition.unwrap().message.contains("Stream default/s1"));

    assert_eq!(h.reconcile(ResourceKind::Stream, NS, "s1").await.reason(), Some(REASON_CREATED));
    assert_eq!(h.reconcile(ResourceKind::Consumer, NS, "c1").await.reason(), Some(REASON_CREATED));
    assert!(h.broker.consumer("s1", "c1").is_some());
}

#[tokio::test]
async fn test_one_reconcile_per_key_at_a_time() {
    let h = TestHarness::new();
    h.add(create_test_stream("s1", NS)).await;
    let key = ReconcileKey::new(ResourceKind::Stream, NS, "s1");

    let guard = h.engine.locks().lock(&key).await;
    let engine = Arc::clone(&h.engine);
    let task_key = key.clone();
    let task = tokio::spawn(async move { engine.reconcile(&task_key).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert_eq!(h.broker.call_count(MockOp::GetStream), 0);

    drop(guard);
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.operations, vec![Operation::Create]);
}

#[tokio::test]
async fn test_finalizer_kept_until_broker_delete_succeeds() {
    let h = TestHarness::new();
    created_stream(&h, create_test_stream("s1", NS)).await;
    h.delete::<Stream>(NS, "s1").await;

    h.broker.fail_next(
        MockOp::DeleteStream,
        MockFailure::Api {
            code: 500,
            err_code: 10_000,
            description: "raft group unavailable".to_string(),
        },
    );
    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_DELETE_FAILED));
    assert!(matches!(report.requeue, Requeue::After(_)));

    let stored = h.get::<Stream>(NS, "s1").expect("object kept while the broker delete fails");
    assert!(stored.finalizers().iter().any(|f| f == FINALIZER));
    assert!(h.broker.stream("s1").is_some());

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.operations, vec![Operation::Delete]);
    assert_eq!(report.requeue, Requeue::Done);
    assert!(h.get::<Stream>(NS, "s1").is_none());
    assert!(h.broker.stream("s1").is_none());
}

#[tokio::test]
async fn test_stream_already_gone_from_broker() {
    let h = TestHarness::new();
    created_stream(&h, create_test_stream("s1", NS)).await;
    h.broker.delete_stream("s1").await.unwrap();
    h.delete::<Stream>(NS, "s1").await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert!(report.operations.is_empty());
    assert!(h.get::<Stream>(NS, "s1").is_none());
}

#[tokio::test]
async fn test_read_only_never_writes() {
    let h = TestHarness::with_settings(EngineSettings {
        read_only: true,
        ..TestHarness::global_settings()
    });
    let mut dry_run = h.engine.dry_run_reports();
    h.add(create_test_stream("s1", NS)).await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.operations, vec![Operation::Create]);
    assert_eq!(h.broker.mutation_count(), 0);
    assert_eq!(h.writer.status_writes(), 0);
    assert_eq!(h.writer.finalizer_writes(), 0);
    assert!(h.get::<Stream>(NS, "s1").unwrap().status.is_none());

    let published = dry_run.try_recv().unwrap();
    assert_eq!(published.operations, vec![Operation::Create]);
    let status = published.status.unwrap();
    assert_eq!(status.condition(crds::CONDITION_READY).unwrap().reason, REASON_CREATED);
}

#[tokio::test]
async fn test_read_only_deletion_keeps_finalizer() {
    let h = TestHarness::with_settings(EngineSettings {
        read_only: true,
        ..TestHarness::global_settings()
    });
    let mut stream = create_test_stream("s1", NS);
    stream.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    h.add(stream).await;
    h.delete::<Stream>(NS, "s1").await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.operations, vec![Operation::Delete]);
    assert_eq!(h.writer.finalizer_writes(), 0);
    assert_eq!(h.broker.mutation_count(), 0);
    assert!(h.get::<Stream>(NS, "s1").is_some());
}

#[tokio::test]
async fn test_drift_is_corrected() {
    let h = TestHarness::new();
    created_stream(&h, create_test_stream("s1", NS)).await;
    set_live_subjects(&h, "s1", &["other.>"]);
    h.broker.clear_calls();

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.operations, vec![Operation::Update(vec!["subjects"])]);
    assert_eq!(report.reason(), Some(REASON_UPDATED));
    assert_eq!(h.broker.call_count(MockOp::UpdateStream), 1);
    assert_eq!(h.broker.mutation_count(), 1);
    assert_eq!(h.broker.stream("s1").unwrap().subjects, vec!["s1.>"]);
}

#[tokio::test]
async fn test_prevent_update_reports_drift_without_applying() {
    let h = TestHarness::new();
    let mut stream = create_test_stream("s1", NS);
    stream.spec.prevent_update = true;
    created_stream(&h, stream).await;
    set_live_subjects(&h, "s1", &["other.>"]);

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert!(report.operations.is_empty());
    assert_eq!(report.reason(), Some(REASON_UPDATE_PREVENTED));
    assert_eq!(report.condition.unwrap().status, ConditionStatus::True);
    assert_eq!(h.broker.call_count(MockOp::UpdateStream), 0);
}

#[tokio::test]
async fn test_prevent_delete_releases_without_broker_delete() {
    let h = TestHarness::new();
    let mut stream = create_test_stream("s1", NS);
    stream.spec.prevent_delete = true;
    created_stream(&h, stream).await;
    h.delete::<Stream>(NS, "s1").await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.requeue, Requeue::Done);
    assert!(h.get::<Stream>(NS, "s1").is_none());
    assert!(h.broker.stream("s1").is_some());
    assert_eq!(h.broker.call_count(MockOp::DeleteStream), 0);
}

#[tokio::test]
async fn test_immutable_drift_is_unsupported() {
    let h = TestHarness::new();
    created_stream(&h, create_test_stream("s1", NS)).await;
    let mut live = h.broker.stream("s1").unwrap();
    live.storage = StorageType::Memory;
    h.broker.add_stream(live);

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_UNSUPPORTED_CHANGE));
    assert_eq!(report.requeue, Requeue::Resync);
    let condition = report.condition.unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert!(condition.message.contains("storage"));
    assert_eq!(h.broker.call_count(MockOp::UpdateStream), 0);
}

#[tokio::test]
async fn test_invalid_spec() {
    let h = TestHarness::new();
    let mut stream = create_test_stream("s1", NS);
    stream.spec.config.max_age = Some("forever".to_string());
    h.add(stream).await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_INVALID_SPEC));
    assert_eq!(h.broker.mutation_count(), 0);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let h = TestHarness::new();
    h.connector.reject_auth(true);
    h.add(create_test_stream("s1", NS)).await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_AUTHENTICATION_FAILED));
    assert_eq!(report.requeue, Requeue::Resync);
    let ready = ready_condition(h.get::<Stream>(NS, "s1").unwrap().as_ref()).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
}

#[tokio::test]
async fn test_broker_outage_backs_off_without_status() {
    let h = TestHarness::new();
    h.connector.fail_network(1);
    h.add(create_test_stream("s1", NS)).await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert!(report.condition.is_none());
    assert!(matches!(report.requeue, Requeue::After(_)));
    assert_eq!(h.writer.status_writes(), 0);

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_CREATED));
}

#[tokio::test]
async fn test_missing_account() {
    let h = TestHarness::new();
    let mut stream = create_test_stream("s1", NS);
    stream.spec.account = Some("missing".to_string());
    h.add(stream).await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_ACCOUNT_NOT_FOUND));
    assert_eq!(report.requeue, Requeue::After(EngineSettings::default().parent_wait));
    assert_eq!(h.connector.connects(), 0);
}

#[tokio::test]
async fn test_no_connection_config() {
    let h = TestHarness::with_settings(EngineSettings::default());
    h.add(create_test_stream("s1", NS)).await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_NO_CONNECTION_CONFIG));
    assert_eq!(h.connector.connects(), 0);
}

#[tokio::test]
async fn test_crd_connect_uses_only_account_settings() {
    let h = TestHarness::with_settings(EngineSettings {
        crd_connect: true,
        ..TestHarness::global_settings()
    });
    h.add(create_test_stream("s1", NS)).await;
    h.add(create_test_account("no-servers", NS)).await;
    let mut account = create_test_account("acct-a", NS);
    account.spec.servers = vec!["nats://acct-a:4222".to_string()];
    h.add(account).await;

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_NO_CONNECTION_CONFIG), "global is not used");
    let report = h.reconcile(ResourceKind::Account, NS, "no-servers").await;
    assert_eq!(report.reason(), Some(REASON_NO_CONNECTION_CONFIG), "global is not a base");
    assert_eq!(h.connector.connects(), 0);

    let report = h.reconcile(ResourceKind::Account, NS, "acct-a").await;
    assert_ne!(report.reason(), Some(REASON_NO_CONNECTION_CONFIG));
    assert_eq!(h.connector.connects(), 1);
}

#[tokio::test]
async fn test_missing_account_secret() {
    let h = TestHarness::new();
    let mut account = create_test_account("acct-a", NS);
    account.spec.creds = Some(crds::CredsSecret {
        secret: crds::SecretReference::new("acct-a-creds"),
        file: "user.creds".to_string(),
    });
    h.add(account).await;

    let report = h.reconcile(ResourceKind::Account, NS, "acct-a").await;
    assert_eq!(report.reason(), Some(REASON_CREDENTIALS_UNAVAILABLE));
    assert!(matches!(report.requeue, Requeue::After(_)));

    h.secrets.insert(NS, "acct-a-creds", "user.creds", b"creds");
    let report = h.reconcile(ResourceKind::Account, NS, "acct-a").await;
    assert_eq!(report.reason(), Some(REASON_CREATED));
}

#[tokio::test]
async fn test_write_conflict_is_retried() {
    let h = TestHarness::new();
    h.add(create_test_stream("s1", NS)).await;
    h.writer.inject_conflicts(2);

    let report = h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert_eq!(report.reason(), Some(REASON_CREATED));
    let stored = h.get::<Stream>(NS, "s1").unwrap();
    assert!(stored.finalizers().iter().any(|f| f == FINALIZER));
    assert_eq!(ready_condition(stored.as_ref()).unwrap().reason, REASON_CREATED);
}

#[tokio::test]
async fn test_partial_apply() {
    let h = TestHarness::new();
    h.add(create_test_stream("s1", NS)).await;
    let key = ReconcileKey::new(ResourceKind::Stream, NS, "s1");
    let obj = h.get::<Stream>(NS, "s1").unwrap();

    let report = h
        .engine
        .broker_failure::<StreamReconciler>(
            &key,
            &obj,
            JetStreamError::InvalidRequest("bad subjects".to_string()).into(),
            vec![Operation::Create],
            2,
        )
        .await
        .unwrap();
    assert_eq!(report.reason(), Some(REASON_PARTIAL_APPLY));
    assert_eq!(report.operations, vec![Operation::Create]);
    assert!(matches!(report.requeue, Requeue::After(_)));
    assert!(report.condition.unwrap().message.contains("1 of 2"));
}

#[tokio::test]
async fn test_account_deletion_waits_for_dependents() {
    let h = TestHarness::new();
    h.add(create_test_account("acct-a", NS)).await;
    let mut stream = create_test_stream("s1", NS);
    stream.spec.account = Some("acct-a".to_string());
    h.add(stream).await;
    h.reconcile(ResourceKind::Account, NS, "acct-a").await;
    h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert!(h.broker.account("acct-a").is_some());
    assert!(h.broker.stream("s1").is_some());

    h.delete::<Account>(NS, "acct-a").await;
    let report = h.reconcile(ResourceKind::Account, NS, "acct-a").await;
    assert_eq!(report.reason(), Some(REASON_DEPENDENT_RESOURCES_EXIST));
    assert_eq!(report.requeue, Requeue::After(EngineSettings::default().dependents_wait));
    assert!(report.condition.unwrap().message.contains("Stream default/s1"));
    assert!(h.get::<Account>(NS, "acct-a").is_some());
    assert!(h.broker.account("acct-a").is_some());

    h.delete::<Stream>(NS, "s1").await;
    h.reconcile(ResourceKind::Stream, NS, "s1").await;
    assert!(h.get::<Stream>(NS, "s1").is_none());
    assert!(h.broker.stream("s1").is_none());

    let report = h.reconcile(ResourceKind::Account, NS, "acct-a").await;
    assert_eq!(report.operations, vec![Operation::Delete]);
    assert!(h.get::<Account>(NS, "acct-a").is_none());
    assert!(h.broker.account("acct-a").is_none());
}

#[tokio::test]
async fn test_deleted_object_is_done() {
    let h = TestHarness::new();
    let report = h.reconcile(ResourceKind::Consumer, NS, "gone").await;
    assert_eq!(report.requeue, Requeue::Done);
    assert!(report.condition.is_none());
}

#[tokio::test]
async fn test_ready_parent_unblocks_create() {
    let h = TestHarness::new();
    h.add(with_ready(create_test_account("acct-a", NS), ConditionStatus::True)).await;
    let mut template = create_test_template("orders", NS);
    template.spec.account = Some("acct-a".to_string());
    h.add(template).await;

    let report = h.reconcile(ResourceKind::StreamTemplate, NS, "orders").await;
    assert_eq!(report.reason(), Some(REASON_CREATED));
    assert_eq!(h.broker.stream_template("orders").unwrap().max_streams, 10);
}
