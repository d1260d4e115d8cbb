//! kmirror kubehub: the cluster API seam, its kube-rs binding for apps/v1
//! Deployments, and the reflector that keeps a delta queue fed from list+watch.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, ListParams, PostParams, WatchParams},
    core::WatchEvent as KubeWatchEvent,
    Client,
};
use kmirror_core::{Listing, ManagedObject, ObjectKey};
use tracing::{debug, warn};

pub mod backoff;
mod mock;
pub mod reflector;

pub use backoff::Backoff;
pub use mock::{MockCluster, WatchFeed};
pub use reflector::{Phase, Reflector};

/// Server-side watch timeout; kube rejects values of 295s and above.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// One incremental change notification from the cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(ManagedObject),
    Modified(ManagedObject),
    Deleted(ManagedObject),
    /// Progress marker carrying only a new cursor.
    Bookmark(String),
}

impl WatchEvent {
    pub fn resource_version(&self) -> &str {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => &o.resource_version,
            WatchEvent::Bookmark(rv) => rv,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// A single notification could not be decoded; the stream itself is fine.
    #[error("malformed notification: {0}")]
    Malformed(String),
    /// The cursor is too old to resume from (HTTP 410 Gone).
    #[error("watch cursor expired: {0}")]
    Expired(String),
    #[error("watch transport: {0}")]
    Transport(String),
}

pub type WatchStream = BoxStream<'static, std::result::Result<WatchEvent, WatchError>>;

/// Cluster API calls the mirror and its collaborators need for the mirrored kind.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Full list scoped to `namespace` (all namespaces when `None`).
    async fn list(&self, namespace: Option<&str>) -> Result<Listing>;

    /// Incremental watch starting after `resource_version`.
    async fn watch(&self, namespace: Option<&str>, resource_version: &str) -> std::result::Result<WatchStream, WatchError>;

    /// Live read of a single object.
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>>;

    /// Replace a single object; the payload's resourceVersion guards against lost updates.
    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject>;
}

/// `ClusterClient` over kube-rs for apps/v1 Deployments.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    fn api(&self, namespace: Option<&str>) -> Api<Deployment> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn namespaced_api(&self, key: &ObjectKey) -> Result<Api<Deployment>> {
        let ns = key.namespace.as_deref().ok_or_else(|| anyhow!("deployment key {} has no namespace", key))?;
        Ok(Api::namespaced(self.client.clone(), ns))
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_managed(d: &Deployment) -> Result<ManagedObject> {
    let mut raw = serde_json::to_value(d).context("serializing Deployment")?;
    strip_managed_fields(&mut raw);
    ManagedObject::from_raw(raw).ok_or_else(|| anyhow!("deployment missing metadata.name or metadata.resourceVersion"))
}

fn map_kube_err(e: kube::Error) -> WatchError {
    match e {
        kube::Error::Api(resp) if resp.code == 410 => WatchError::Expired(resp.message),
        kube::Error::SerdeError(e) => WatchError::Malformed(e.to_string()),
        other => WatchError::Transport(other.to_string()),
    }
}

fn from_kube_event(ev: KubeWatchEvent<Deployment>) -> std::result::Result<WatchEvent, WatchError> {
    let shape = |d: &Deployment| to_managed(d).map_err(|e| WatchError::Malformed(e.to_string()));
    match ev {
        KubeWatchEvent::Added(d) => shape(&d).map(WatchEvent::Added),
        KubeWatchEvent::Modified(d) => shape(&d).map(WatchEvent::Modified),
        KubeWatchEvent::Deleted(d) => shape(&d).map(WatchEvent::Deleted),
        KubeWatchEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        KubeWatchEvent::Error(e) if e.code == 410 => Err(WatchError::Expired(e.message)),
        KubeWatchEvent::Error(e) => Err(WatchError::Transport(format!("{} ({})", e.message, e.code))),
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClient {
    async fn list(&self, namespace: Option<&str>) -> Result<Listing> {
        let list = self.api(namespace).list(&ListParams::default()).await.context("listing deployments")?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let mut items = Vec::with_capacity(list.items.len());
        for d in list.items.iter() {
            match to_managed(d) {
                Ok(o) => items.push(o),
                Err(e) => warn!(error = %e, "kubehub: skipping malformed listed deployment"),
            }
        }
        debug!(ns = ?namespace, items = items.len(), rv = %resource_version, "kubehub: list");
        Ok(Listing { items, resource_version })
    }

    async fn watch(&self, namespace: Option<&str>, resource_version: &str) -> std::result::Result<WatchStream, WatchError> {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self.api(namespace).watch(&wp, resource_version).await.map_err(map_kube_err)?;
        Ok(stream
            .map(|item| match item {
                Ok(ev) => from_kube_event(ev),
                Err(e) => Err(map_kube_err(e)),
            })
            .boxed())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        let api = self.namespaced_api(key)?;
        let found = api.get_opt(&key.name).await.with_context(|| format!("getting deployment {}", key))?;
        found.as_ref().map(to_managed).transpose()
    }

    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject> {
        let api = self.namespaced_api(&object.key)?;
        let d: Deployment = serde_json::from_value(object.payload.clone()).context("payload is not a Deployment")?;
        let out = api
            .replace(&object.key.name, &PostParams::default(), &d)
            .await
            .with_context(|| format!("replacing deployment {}", object.key))?;
        to_managed(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_deployment_and_strips_managed_fields() {
        let d: Deployment = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "reviews",
                "namespace": "bookinfo",
                "resourceVersion": "123",
                "managedFields": [{ "manager": "kubectl" }]
            },
            "spec": { "selector": {}, "template": {} }
        }))
        .unwrap();
        let o = to_managed(&d).unwrap();
        assert_eq!(o.key.to_string(), "bookinfo/reviews");
        assert_eq!(o.resource_version, "123");
        assert!(o.payload["metadata"].get("managedFields").is_none());
        assert_eq!(o.payload["kind"], "Deployment");
    }

    #[test]
    fn deployment_without_version_is_malformed() {
        let d: Deployment = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "x" }
        })).unwrap();
        let ev = from_kube_event(KubeWatchEvent::Added(d));
        assert!(matches!(ev, Err(WatchError::Malformed(_))));
    }

    #[test]
    fn gone_maps_to_expired() {
        let resp = kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        };
        assert!(matches!(from_kube_event(KubeWatchEvent::Error(resp.clone())), Err(WatchError::Expired(_))));
        assert!(matches!(map_kube_err(kube::Error::Api(resp)), WatchError::Expired(_)));
    }
}
