//! Managed control loop.
//!
//! One kube-runtime `Controller` per kind drives the engine from watch events,
//! with a fixed resync. When leader election is enabled, the controllers only
//! run while this replica holds the Lease, and losing it stops the loop.

use crate::cache::CachedObject;
use crate::config::{ControllerConfig, LeaseConfig};
use crate::engine::{Engine, Requeue};
use crate::error::ControllerError;
use crate::reconciler::ReconcileKey;
use crate::watcher::scoped_api;
use crds::{Account, Consumer, Stream, StreamTemplate};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, ResourceExt};
use kube_lease_manager::LeaseManagerBuilder;
use kube_runtime::controller::{Action, Config as RuntimeConfig, Controller};
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state handed to every reconcile
#[derive(Debug)]
pub struct ManagedContext {
    pub engine: Arc<Engine>,
    pub sync_interval: Duration,
}

/// Watch-driven controllers, optionally behind leader election
pub struct ManagedLoop {
    client: Client,
    namespace: Option<String>,
    workers: usize,
    lease: Option<LeaseConfig>,
    context: Arc<ManagedContext>,
}

impl fmt::Debug for ManagedLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedLoop")
            .field("namespace", &self.namespace)
            .field("workers", &self.workers)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl ManagedLoop {
    pub fn new(client: Client, engine: Arc<Engine>, config: &ControllerConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            workers: config.workers.max(1),
            lease: config.lease.clone(),
            context: Arc::new(ManagedContext {
                engine,
                sync_interval: config.sync_interval,
            }),
        }
    }

    /// Run until `shutdown` fires, leadership is lost or a controller stops
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        match self.lease.clone() {
            Some(lease) => self.run_as_leader(lease, shutdown).await,
            None => {
                warn!("Leader election disabled, reconciling without a Lease");
                self.run_controllers(shutdown).await
            }
        }
    }

    async fn run_as_leader(
        self,
        lease: LeaseConfig,
        shutdown: CancellationToken,
    ) -> Result<(), ControllerError> {
        info!(
            lease_name = %lease.name,
            lease_namespace = %lease.namespace,
            identity = %lease.identity,
            "Leader election enabled, waiting to acquire leadership"
        );

        let manager = LeaseManagerBuilder::new(self.client.clone(), &lease.name)
            .with_namespace(&lease.namespace)
            .with_identity(&lease.identity)
            .with_duration(lease.duration.as_secs())
            .with_grace(lease.grace.as_secs())
            .build()
            .await
            .map_err(|e| ControllerError::LeaderElection(e.to_string()))?;
        let (leader_rx, lease_handle) = manager.watch().await;

        let mut rx = leader_rx.clone();
        while !*rx.borrow_and_update() {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown before leadership was acquired");
                    drop(rx);
                    drop(leader_rx);
                    release(lease_handle).await;
                    return Ok(());
                }
                changed = rx.changed() => {
                    changed.map_err(|e| ControllerError::LeaderElection(e.to_string()))?;
                }
            }
        }
        info!("Leadership acquired, starting controllers");

        let stop = shutdown.child_token();
        let result = tokio::select! {
            result = self.run_controllers(stop.clone()) => result,
            lost = monitor_leadership(leader_rx) => {
                stop.cancel();
                match lost {
                    Ok(()) => {
                        warn!("Leadership lost, stopping controllers");
                        Err(ControllerError::LeaderElection("leadership lost".to_string()))
                    }
                    Err(e) => {
                        error!("Leadership monitor failed: {}", e);
                        Err(e)
                    }
                }
            }
        };

        drop(rx);
        release(lease_handle).await;
        result
    }

    async fn run_controllers(&self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        info!(
            "Managed control loop running ({} workers per kind, resync every {:?})",
            self.workers, self.context.sync_interval
        );
        let ns = self.namespace.as_deref();
        let controllers = futures::future::join4(
            run_controller(
                scoped_api::<Account>(&self.client, ns),
                Arc::clone(&self.context),
                self.workers,
            ),
            run_controller(
                scoped_api::<Stream>(&self.client, ns),
                Arc::clone(&self.context),
                self.workers,
            ),
            run_controller(
                scoped_api::<Consumer>(&self.client, ns),
                Arc::clone(&self.context),
                self.workers,
            ),
            run_controller(
                scoped_api::<StreamTemplate>(&self.client, ns),
                Arc::clone(&self.context),
                self.workers,
            ),
        );

        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Stopping managed control loop");
                Ok(())
            }
            _ = controllers => Err(ControllerError::Watch("controllers stopped unexpectedly".to_string())),
        }
    }
}

/// Returns once leadership is lost
async fn monitor_leadership(mut leader_rx: watch::Receiver<bool>) -> Result<(), ControllerError> {
    loop {
        leader_rx
            .changed()
            .await
            .map_err(|e| ControllerError::LeaderElection(e.to_string()))?;
        if !*leader_rx.borrow() {
            return Ok(());
        }
    }
}

/// Wait for the lease task to step down once every receiver is gone
async fn release(
    handle: tokio::task::JoinHandle<
        Result<kube_lease_manager::LeaseManager, kube_lease_manager::LeaseManagerError>,
    >,
) {
    match handle.await {
        Ok(Ok(_)) => info!("Leader election lease released"),
        Ok(Err(e)) => warn!("Failed to release leader election lease: {}", e),
        Err(e) => warn!("Lease task failed: {}", e),
    }
}

async fn run_controller<K>(api: Api<K>, context: Arc<ManagedContext>, workers: usize)
where
    K: CachedObject
        + kube::Resource<Scope = NamespaceResourceScope>
        + DeserializeOwned
        + Clone,
{
    info!("Starting {} controller", K::KIND);
    let config = RuntimeConfig::default().concurrency(u16::try_from(workers).unwrap_or(u16::MAX));

    Controller::new(api, watcher::Config::default())
        .with_config(config)
        .run(reconcile::<K>, error_policy::<K>, context)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("{} {} reconciled", K::KIND, obj.name),
                Err(e) => error!("{} controller error: {}", K::KIND, e),
            }
        })
        .await;
}

fn key_of<K: CachedObject>(obj: &K) -> ReconcileKey {
    ReconcileKey::new(K::KIND, obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Map an engine requeue decision onto a controller action
pub fn action_for(requeue: Requeue, sync_interval: Duration) -> Action {
    match requeue {
        Requeue::Resync => Action::requeue(sync_interval),
        Requeue::After(delay) => Action::requeue(delay),
        Requeue::Done => Action::await_change(),
    }
}

async fn reconcile<K: CachedObject>(
    obj: Arc<K>,
    ctx: Arc<ManagedContext>,
) -> Result<Action, ControllerError> {
    // The controller's copy may be ahead of the cache feed
    if ctx.engine.cache().apply_if_newer((*obj).clone()).await {
        debug!("Cache refreshed from {} event", key_of(&*obj));
    }
    let report = ctx.engine.reconcile(&key_of(&*obj)).await?;
    Ok(action_for(report.requeue, ctx.sync_interval))
}

fn error_policy<K: CachedObject>(obj: Arc<K>, err: &ControllerError, ctx: Arc<ManagedContext>) -> Action {
    let key = key_of(&*obj);
    let delay = ctx.engine.retry_delay(&key);
    warn!("Reconcile of {} failed: {}; retrying in {:?}", key, err, delay);
    Action::requeue(delay)
}
