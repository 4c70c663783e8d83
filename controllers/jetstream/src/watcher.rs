//! Kubernetes resource watchers feeding the object cache.
//!
//! One watcher per kind keeps the [`ObjectCache`] in step with the API
//! server. A (re)list is buffered and swapped in with
//! [`ObjectCache::replace_all`], so objects deleted while the watch was down
//! are pruned and reported as deletions.

use crate::cache::{CachedObject, ObjectCache};
use crate::error::ControllerError;
use crds::{Account, Consumer, Stream, StreamTemplate};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client};
use kube_runtime::WatchStreamExt;
use kube_runtime::watcher::{self, Event};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Typed API for `K`, limited to `namespace` when one is set
pub fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Keep the cache's store for `K` current until the watch ends or `shutdown` fires
pub async fn run_feed<K>(api: Api<K>, cache: Arc<ObjectCache>, shutdown: CancellationToken)
where
    K: CachedObject + DeserializeOwned + Clone,
{
    info!("Starting {} watcher", K::KIND);
    let mut events = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut listing: Vec<K> = Vec::new();

    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(Ok(Event::Apply(obj))) => cache.apply(obj).await,
            Some(Ok(Event::Delete(obj))) => {
                let namespace = obj.meta().namespace.clone().unwrap_or_default();
                let name = obj.meta().name.clone().unwrap_or_default();
                cache.remove::<K>(&namespace, &name).await;
            }
            Some(Ok(Event::Init)) => {
                debug!("{} watcher (re)listing", K::KIND);
                listing.clear();
            }
            Some(Ok(Event::InitApply(obj))) => listing.push(obj),
            Some(Ok(Event::InitDone)) => {
                let objects = std::mem::take(&mut listing);
                info!("{} watcher listed {} object(s)", K::KIND, objects.len());
                cache.replace_all(objects).await;
            }
            Some(Err(e)) => warn!("{} watch error (retrying): {}", K::KIND, e),
            None => break,
        }
    }
    info!("{} watcher stopped", K::KIND);
}

/// Watches every JetStream kind into one cache
#[derive(Clone)]
pub struct CacheFeeds {
    client: Client,
    namespace: Option<String>,
    cache: Arc<ObjectCache>,
}

impl CacheFeeds {
    /// Watch `namespace`, or every namespace when `None`
    pub fn new(client: Client, namespace: Option<String>, cache: Arc<ObjectCache>) -> Self {
        Self {
            client,
            namespace,
            cache,
        }
    }

    /// Spawn one watcher per kind
    pub fn spawn(&self, shutdown: &CancellationToken) -> JoinSet<()> {
        let ns = self.namespace.as_deref();
        let mut feeds = JoinSet::new();
        feeds.spawn(run_feed(
            scoped_api::<Account>(&self.client, ns),
            Arc::clone(&self.cache),
            shutdown.child_token(),
        ));
        feeds.spawn(run_feed(
            scoped_api::<Stream>(&self.client, ns),
            Arc::clone(&self.cache),
            shutdown.child_token(),
        ));
        feeds.spawn(run_feed(
            scoped_api::<Consumer>(&self.client, ns),
            Arc::clone(&self.cache),
            shutdown.child_token(),
        ));
        feeds.spawn(run_feed(
            scoped_api::<StreamTemplate>(&self.client, ns),
            Arc::clone(&self.cache),
            shutdown.child_token(),
        ));
        feeds
    }
}

/// Wait until a feed exits on its own; that only happens when its watch stream ended
pub async fn supervise(mut feeds: JoinSet<()>, shutdown: CancellationToken) -> Result<(), ControllerError> {
    tokio::select! {
        () = shutdown.cancelled() => {
            feeds.shutdown().await;
            Ok(())
        }
        finished = feeds.join_next() => match finished {
            Some(Err(e)) => Err(ControllerError::Watch(format!("watcher task failed: {}", e))),
            _ if shutdown.is_cancelled() => Ok(()),
            _ => Err(ControllerError::Watch("watch stream ended".to_string())),
        },
    }
}
