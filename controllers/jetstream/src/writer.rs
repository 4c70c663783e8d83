//! Status and finalizer writes.
//!
//! The engine never writes spec. Status and finalizer patches carry the
//! object's `metadata.resourceVersion`, so a write based on a stale copy
//! fails with [`ControllerError::Conflict`] instead of overwriting a newer
//! one.

use crate::error::ControllerError;
use crate::reconciler::{ReconcileKey, ResourceKind};
use async_trait::async_trait;
use crds::{Account, Consumer, ResourceStatus, Stream, StreamTemplate};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt;

/// Writes status and finalizers of JetStream objects
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    /// Current object from the API server, `None` when it no longer exists
    async fn fetch(&self, key: &ReconcileKey) -> Result<Option<Value>, ControllerError>;

    /// Replace the status subresource, returning the updated object
    async fn patch_status(
        &self,
        key: &ReconcileKey,
        resource_version: Option<&str>,
        status: &ResourceStatus,
    ) -> Result<Value, ControllerError>;

    /// Replace `metadata.finalizers`, returning the updated object
    async fn patch_finalizers(
        &self,
        key: &ReconcileKey,
        resource_version: Option<&str>,
        finalizers: &[String],
    ) -> Result<Value, ControllerError>;
}

/// [`ObjectWriter`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeObjectWriter {
    client: Client,
}

impl fmt::Debug for KubeObjectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeObjectWriter").finish_non_exhaustive()
    }
}

fn metadata_patch(resource_version: Option<&str>) -> Value {
    match resource_version {
        Some(rv) => json!({ "resourceVersion": rv }),
        None => json!({}),
    }
}

impl KubeObjectWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn fetch_typed<K>(&self, key: &ReconcileKey) -> Result<Option<Value>, ControllerError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Serialize + fmt::Debug,
    {
        let obj = self.api::<K>(&key.namespace).get_opt(&key.name).await?;
        Ok(obj.map(serde_json::to_value).transpose()?)
    }

    async fn patch_status_typed<K>(
        &self,
        key: &ReconcileKey,
        resource_version: Option<&str>,
        status: &ResourceStatus,
    ) -> Result<Value, ControllerError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Serialize + fmt::Debug,
    {
        let patch = json!({
            "metadata": metadata_patch(resource_version),
            "status": status,
        });
        let obj = self
            .api::<K>(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ControllerError::from_write(e, &key.to_string()))?;
        Ok(serde_json::to_value(obj)?)
    }

    async fn patch_finalizers_typed<K>(
        &self,
        key: &ReconcileKey,
        resource_version: Option<&str>,
        finalizers: &[String],
    ) -> Result<Value, ControllerError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Serialize + fmt::Debug,
    {
        let mut metadata = metadata_patch(resource_version);
        metadata["finalizers"] = json!(finalizers);
        let patch = json!({ "metadata": metadata });
        let obj = self
            .api::<K>(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ControllerError::from_write(e, &key.to_string()))?;
        Ok(serde_json::to_value(obj)?)
    }
}

#[async_trait]
impl ObjectWriter for KubeObjectWriter {
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
        match key.kind {
            ResourceKind::Account => self.patch_status_typed::<Account>(key, resource_version, status).await,
            ResourceKind::Stream => self.patch_status_typed::<Stream>(key, resource_version, status).await,
            ResourceKind::Consumer => self.patch_status_typed::<Consumer>(key, resource_version, status).await,
            ResourceKind::StreamTemplate => {
                self.patch_status_typed::<StreamTemplate>(key, resource_version, status).await
            }
        }
    }

    async fn patch_finalizers(
        &self,
        key: &ReconcileKey,
        resource_version: Option<&str>,
        finalizers: &[String],
    ) -> Result<Value, ControllerError> {
        match key.kind {
            ResourceKind::Account => self.patch_finalizers_typed::<Account>(key, resource_version, finalizers).await,
            ResourceKind::Stream => self.patch_finalizers_typed::<Stream>(key, resource_version, finalizers).await,
            ResourceKind::Consumer => {
                self.patch_finalizers_typed::<Consumer>(key, resource_version, finalizers).await
            }
            ResourceKind::StreamTemplate => {
                self.patch_finalizers_typed::<StreamTemplate>(key, resource_version, finalizers).await
            }
        }
    }
}
