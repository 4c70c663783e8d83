//! Cleanup and finalization.
//!
//! The finalizer is added before any broker mutation and removed only
//! once the broker resource is confirmed deleted or absent. `preventDelete`
//! releases the finalizer without touching the broker, and an Account is
//! held back while Streams, Consumers or StreamTemplates still reference it.

use crate::connection::ConnectionDomain;
use crate::engine::{Engine, ReconcileReport, Requeue, Target};
use crate::error::ControllerError;
use crate::reconciler::{Operation, ReconcileKey, ResourceKind, ResourceReconciler};
use crate::status::{REASON_DELETE_FAILED, REASON_DEPENDENT_RESOURCES_EXIST};
use crds::{ConditionStatus, FINALIZER, JetStreamResource};
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

/// Make sure `obj` carries the finalizer, returning the (possibly updated) object
pub(crate) async fn ensure_finalizer<R: ResourceReconciler>(
    engine: &Engine,
    key: &ReconcileKey,
    obj: Arc<R::Object>,
) -> Result<Arc<R::Object>, ControllerError> {
    let mut current = obj;
    let mut attempt = 0;
    loop {
        if has_finalizer(&*current) {
            return Ok(current);
        }
        let mut finalizers = current.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        match engine
            .writer
            .patch_finalizers(key, current.meta().resource_version.as_deref(), &finalizers)
            .await
        {
            Ok(value) => {
                let updated: R::Object = serde_json::from_value(value)?;
                engine.cache.apply(updated.clone()).await;
                debug!("Added finalizer to {}", key);
                return Ok(Arc::new(updated));
            }
            Err(ControllerError::Conflict(_)) if attempt < engine.settings.max_conflict_retries => {
                attempt += 1;
                match engine.refetch::<R>(key).await? {
                    Some(fresh) => current = fresh,
                    None => return Err(ControllerError::Conflict(key.to_string())),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn remove_finalizer<R: ResourceReconciler>(
    engine: &Engine,
    key: &ReconcileKey,
    obj: Arc<R::Object>,
) -> Result<(), ControllerError> {
    let mut current = obj;
    let mut attempt = 0;
    loop {
        if !has_finalizer(&*current) {
            return Ok(());
        }
        let finalizers: Vec<String> = current
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        match engine
            .writer
            .patch_finalizers(key, current.meta().resource_version.as_deref(), &finalizers)
            .await
        {
            Ok(_) => {
                info!("Removed finalizer from {}", key);
                return Ok(());
            }
            Err(ControllerError::Conflict(_)) if attempt < engine.settings.max_conflict_retries => {
                attempt += 1;
                match engine.refetch::<R>(key).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(()),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Delete the broker resource of a deleting object, then release it
pub(crate) async fn finalize<R: ResourceReconciler>(
    engine: &Engine,
    key: &ReconcileKey,
    obj: Arc<R::Object>,
) -> Result<ReconcileReport, ControllerError> {
    if !has_finalizer(&*obj) {
        debug!("{} is being deleted without our finalizer", key);
        return Ok(ReconcileReport {
            key: key.clone(),
            operations: Vec::new(),
            requeue: Requeue::Done,
            condition: None,
        });
    }

    let dependents = R::dependents(&engine.cache, &obj);
    if !dependents.is_empty() {
        let names: Vec<String> = dependents.iter().map(ToString::to_string).collect();
        info!("{} still has {} dependent(s), deferring deletion", key, names.len());
        return engine
            .record::<R>(
                key,
                &obj,
                Vec::new(),
                ConditionStatus::False,
                REASON_DEPENDENT_RESOURCES_EXIST,
                format!("waiting for dependents to be deleted: {}", names.join(", ")),
                Requeue::After(engine.settings.dependents_wait),
            )
            .await;
    }

    if engine.settings.read_only {
        info!("Read-only: would delete {} and release its finalizer", key);
        return Ok(ReconcileReport {
            key: key.clone(),
            operations: vec![Operation::Delete],
            requeue: Requeue::Resync,
            condition: None,
        });
    }

    let mut operations = Vec::new();
    if obj.prevent_delete() {
        info!("preventDelete is set, leaving broker resource of {} in place", key);
    } else {
        match delete_from_broker::<R>(engine, key, &obj).await {
            Ok(ops) => operations = ops,
            Err(report) => return report,
        }
    }

    remove_finalizer::<R>(engine, key, Arc::clone(&obj)).await?;
    engine.backoff.reset(key);

    if key.kind == ResourceKind::Account {
        engine
            .connections
            .release(&ConnectionDomain::account(&key.namespace, &key.name));
        if let Err(e) = engine.credentials.remove(&key.namespace, &key.name).await {
            warn!("Failed to remove cached credentials of {}: {}", key, e);
        }
    }

    Ok(ReconcileReport {
        key: key.clone(),
        operations,
        requeue: Requeue::Done,
        condition: None,
    })
}

/// Delete the broker resource, returning the applied operations or the report to return instead
async fn delete_from_broker<R: ResourceReconciler>(
    engine: &Engine,
    key: &ReconcileKey,
    obj: &Arc<R::Object>,
) -> Result<Vec<Operation>, Result<ReconcileReport, ControllerError>> {
    let (domain, config) = match engine.resolve_target(key, obj.account()).await {
        Target::Connect { domain, config } => (domain, config),
        Target::Blocked { reason, message, .. } => {
            let delay = engine.backoff.next(key);
            return Err(engine
                .record::<R>(
                    key,
                    obj,
                    Vec::new(),
                    ConditionStatus::False,
                    reason,
                    message,
                    Requeue::After(delay),
                )
                .await);
        }
    };

    let target: &R::Object = obj;
    let observed = match engine
        .connections
        .with_handle(&domain, &config, move |client| async move {
            R::observe(client.as_ref(), target).await
        })
        .await
    {
        Ok(observed) => observed,
        Err(e) => return Err(delete_failure::<R>(engine, key, obj, e).await),
    };

    let ops: Vec<Operation> = match R::diff(obj, observed.as_ref()) {
        Ok(ops) => ops.into_iter().filter(Operation::is_mutation).collect(),
        Err(e) => {
            return Err(delete_failure::<R>(engine, key, obj, ControllerError::Config(e.to_string())).await);
        }
    };

    let observed_ref = observed.as_ref();
    for op in &ops {
        let result = engine
            .connections
            .with_handle(&domain, &config, move |client| async move {
                R::apply(client.as_ref(), target, observed_ref, op).await
            })
            .await;
        match result {
            Ok(()) => {}
            Err(ControllerError::JetStream(e)) if e.is_not_found() => {
                debug!("{} was already gone from the broker", key);
            }
            Err(e) => return Err(delete_failure::<R>(engine, key, obj, e).await),
        }
    }
    Ok(ops)
}

async fn delete_failure<R: ResourceReconciler>(
    engine: &Engine,
    key: &ReconcileKey,
    obj: &Arc<R::Object>,
    err: ControllerError,
) -> Result<ReconcileReport, ControllerError> {
    let delay = engine.backoff.next(key);
    warn!("Failed to delete {} from the broker: {}; retrying in {:?}", key, err, delay);
    engine
        .record::<R>(
            key,
            obj,
            Vec::new(),
            ConditionStatus::False,
            REASON_DELETE_FAILED,
            err.to_string(),
            Requeue::After(delay),
        )
        .await
}
