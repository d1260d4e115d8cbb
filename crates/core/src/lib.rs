//! kmirror core types: keys, mirrored objects and the deltas that move between
//! the reflector, the queue and the store.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod config;

pub use config::{BackoffConfig, ControllerConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid object key {0:?} (expect name or namespace/name)")]
    InvalidKey(String),
}

/// Identity of a mirrored object: `namespace/name`, or bare `name` when cluster scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self { Self::new(Some(namespace), name) }

    /// Build a key from a raw object's `metadata.{namespace,name}`.
    pub fn from_raw(raw: &serde_json::Value) -> Option<Self> {
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty())?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str());
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(None, name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(CoreError::InvalidKey(s.to_string())),
        }
    }
}

/// A mirrored workload object. The payload is the full resource as the API served it;
/// nothing in the mirror interprets it beyond `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub key: ObjectKey,
    /// Opaque version token assigned by the API server.
    pub resource_version: String,
    pub payload: serde_json::Value,
}

impl ManagedObject {
    /// Shape a raw API object. Requires `metadata.name` and `metadata.resourceVersion`.
    pub fn from_raw(payload: serde_json::Value) -> Option<Self> {
        let key = ObjectKey::from_raw(&payload)?;
        let resource_version = payload
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())?
            .to_string();
        Some(Self { key, resource_version, payload })
    }

    /// RFC3339 `metadata.creationTimestamp`, if present.
    pub fn creation_timestamp(&self) -> Option<&str> {
        self.payload.get("metadata").and_then(|m| m.get("creationTimestamp")).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Periodic re-affirmation of an object already in the store.
    Synced,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Synced => "synced",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    /// Snapshot of the object when the event was emitted (last known state for deletes).
    pub object: ManagedObject,
}

impl Delta {
    pub fn new(kind: DeltaKind, object: ManagedObject) -> Self { Self { kind, object } }
    pub fn added(object: ManagedObject) -> Self { Self::new(DeltaKind::Added, object) }
    pub fn updated(object: ManagedObject) -> Self { Self::new(DeltaKind::Updated, object) }
    pub fn deleted(object: ManagedObject) -> Self { Self::new(DeltaKind::Deleted, object) }
    pub fn synced(object: ManagedObject) -> Self { Self::new(DeltaKind::Synced, object) }

    pub fn key(&self) -> &ObjectKey { &self.object.key }
}

/// Result of a full list: every object plus the collection-level cursor to watch from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub items: Vec<ManagedObject>,
    pub resource_version: String,
}

pub mod prelude {
    pub use super::{
        BackoffConfig, ControllerConfig, CoreError, Delta, DeltaKind, Listing, ManagedObject, ObjectKey,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parse_and_render() {
        let k: ObjectKey = "ns/a".parse().unwrap();
        assert_eq!(k, ObjectKey::namespaced("ns", "a"));
        assert_eq!(k.to_string(), "ns/a");

        let c: ObjectKey = "node-1".parse().unwrap();
        assert_eq!(c.namespace, None);
        assert_eq!(c.to_string(), "node-1");
    }

    #[test]
    fn key_parse_rejects_malformed() {
        for bad in ["", "/", "ns/", "/a", "a/b/c"] {
            assert_eq!(bad.parse::<ObjectKey>(), Err(CoreError::InvalidKey(bad.to_string())), "{bad:?}");
        }
    }

    #[test]
    fn managed_object_from_raw() {
        let raw = serde_json::json!({
            "metadata": { "name": "web", "namespace": "prod", "resourceVersion": "42", "creationTimestamp": "2020-01-01T00:00:00Z" }
        });
        let obj = ManagedObject::from_raw(raw).unwrap();
        assert_eq!(obj.key.to_string(), "prod/web");
        assert_eq!(obj.resource_version, "42");
        assert_eq!(obj.creation_timestamp(), Some("2020-01-01T00:00:00Z"));

        let missing_rv = serde_json::json!({ "metadata": { "name": "web" } });
        assert!(ManagedObject::from_raw(missing_rv).is_none());
    }

    #[test]
    fn empty_namespace_is_cluster_scoped() {
        let k = ObjectKey::new(Some(""), "x");
        assert_eq!(k.namespace, None);
    }
}
