//! rekon core types: object identity, cached records, watch events and the
//! store traits the controller runtime is built against.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod backend;
mod config;
mod error;

pub use backend::{ListSnapshot, ObjectStore, WatchFeed, WatchStream};
pub use config::ControllerConfig;
pub use error::{Error, Result};

pub mod prelude {
    pub use super::{
        Error, LabelSelector, ObjectKey, ObjectRecord, ObjectStore, ReconcileRequest,
        ReconcileResult, ResourceVersion, Result, WatchEvent, WatchFeed,
    };
}

/// Stable identity of a tracked object. `namespace` is empty for cluster-scoped kinds.
///
/// `kind` is a group/version/kind key such as `apps/v1/ReplicaSet` or `v1/Pod`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, String::new(), name)
    }

    pub fn is_namespaced(&self) -> bool { !self.namespace.is_empty() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}:{}", self.kind, self.name)
        } else {
            write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Build a kind key from an `apiVersion` and a `kind`, e.g. `apps/v1` + `ReplicaSet`.
pub fn gvk_key(api_version: &str, kind: &str) -> String {
    if api_version.is_empty() { kind.to_string() } else { format!("{}/{}", api_version, kind) }
}

/// Opaque optimistic-concurrency token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Ordering used to discard replayed or reordered notifications.
    ///
    /// Integer tokens compare numerically; anything else compares by length, then
    /// bytewise. An empty token on either side cannot be ordered and counts as newer.
    pub fn is_newer_than(&self, other: &ResourceVersion) -> bool {
        if self.0.is_empty() || other.0.is_empty() {
            return true;
        }
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a > b,
            _ => (self.0.len(), self.0.as_str()) > (other.0.len(), other.0.as_str()),
        }
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() { f.write_str("-") } else { f.write_str(&self.0) }
    }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for ResourceVersion {
    fn from(v: String) -> Self { Self(v) }
}

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool { self.match_labels.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as `k1=v1,k2=v2` (Kubernetes `labelSelector` query syntax).
    pub fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSelector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { match_labels: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

/// Cached view of one object.
///
/// Everything except `payload` is derived from `payload.metadata` by [`ObjectRecord::from_raw`],
/// so derived fields (owners, labels) are recomputed whenever a new version arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub key: ObjectKey,
    pub resource_version: ResourceVersion,
    /// Changes when an object is deleted and recreated under the same key.
    pub uid: Option<String>,
    pub owner_keys: SmallVec<[ObjectKey; 2]>,
    pub labels: BTreeMap<String, String>,
    pub payload: serde_json::Value,
}

impl ObjectRecord {
    /// Build a record from a raw Kubernetes-shaped object (`{"metadata": {...}, ...}`).
    pub fn from_raw(kind: &str, raw: serde_json::Value) -> Result<Self> {
        let meta = raw
            .get("metadata")
            .and_then(|m| m.as_object())
            .ok_or_else(|| Error::Invalid(format!("{}: object missing metadata", kind)))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Invalid(format!("{}: object missing metadata.name", kind)))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let resource_version = ResourceVersion::new(
            meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or(""),
        );
        let uid = meta.get("uid").and_then(|v| v.as_str()).map(|s| s.to_string());

        let mut labels = BTreeMap::new();
        if let Some(lbls) = meta.get("labels").and_then(|m| m.as_object()) {
            for (k, v) in lbls.iter() {
                if let Some(val) = v.as_str() { labels.insert(k.clone(), val.to_string()); }
            }
        }

        // Owners live in the child's namespace (or are cluster-scoped, which the
        // reference alone cannot tell; cluster-scoped owners need a custom mapper).
        let mut owner_keys: SmallVec<[ObjectKey; 2]> = SmallVec::new();
        if let Some(refs) = meta.get("ownerReferences").and_then(|v| v.as_array()) {
            for r in refs.iter() {
                let owner_kind = r.get("kind").and_then(|v| v.as_str()).unwrap_or("");
                let owner_name = r.get("name").and_then(|v| v.as_str()).unwrap_or("");
                if owner_kind.is_empty() || owner_name.is_empty() { continue; }
                let api_version = r.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
                let owner = ObjectKey::new(gvk_key(api_version, owner_kind), namespace.clone(), owner_name);
                if !owner_keys.contains(&owner) { owner_keys.push(owner); }
            }
        }

        Ok(Self {
            key: ObjectKey { kind: kind.to_string(), namespace, name },
            resource_version,
            uid,
            owner_keys,
            labels,
            payload: raw,
        })
    }

    pub fn is_owned_by(&self, owner: &ObjectKey) -> bool { self.owner_keys.iter().any(|o| o == owner) }

    pub fn label(&self, key: &str) -> Option<&str> { self.labels.get(key).map(|s| s.as_str()) }

    /// Look up a payload field by JSON pointer, e.g. `/spec/configMapRef/name`.
    pub fn field(&self, pointer: &str) -> Option<&serde_json::Value> { self.payload.pointer(pointer) }

    pub fn field_str(&self, pointer: &str) -> Option<&str> { self.field(pointer).and_then(|v| v.as_str()) }

    /// Set a label in both the derived map and `payload.metadata.labels`.
    /// Returns false when the label already had this value.
    pub fn set_label(&mut self, key: &str, value: &str) -> bool {
        if self.label(key) == Some(value) { return false; }
        self.labels.insert(key.to_string(), value.to_string());
        if let Some(meta) = self.metadata_mut() {
            let labels = meta
                .entry("labels")
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if !labels.is_object() { *labels = serde_json::Value::Object(serde_json::Map::new()); }
            if let Some(map) = labels.as_object_mut() {
                map.insert(key.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
        true
    }

    /// Stamp a new resourceVersion into the record and its payload. Used by stores on write.
    pub fn set_resource_version(&mut self, rv: ResourceVersion) {
        if let Some(meta) = self.metadata_mut() {
            meta.insert("resourceVersion".into(), serde_json::Value::String(rv.as_str().to_string()));
        }
        self.resource_version = rv;
    }

    pub fn set_uid(&mut self, uid: &str) {
        if let Some(meta) = self.metadata_mut() {
            meta.insert("uid".into(), serde_json::Value::String(uid.to_string()));
        }
        self.uid = Some(uid.to_string());
    }

    fn metadata_mut(&mut self) -> Option<&mut serde_json::Map<String, serde_json::Value>> {
        self.payload.get_mut("metadata").and_then(|m| m.as_object_mut())
    }
}

/// One notification from a watch feed.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(ObjectRecord),
    Updated(ObjectRecord),
    Deleted(ObjectRecord),
    /// Cursor advance without an object change.
    Bookmark(ResourceVersion),
}

impl WatchEvent {
    pub fn resource_version(&self) -> &ResourceVersion {
        match self {
            WatchEvent::Added(o) | WatchEvent::Updated(o) | WatchEvent::Deleted(o) => &o.resource_version,
            WatchEvent::Bookmark(rv) => rv,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Updated(_) => "updated",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Bookmark(_) => "bookmark",
        }
    }
}

/// The unit carried through the work queue. Deliberately payload-free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub key: ObjectKey,
}

impl From<ObjectKey> for ReconcileRequest {
    fn from(key: ObjectKey) -> Self { Self { key } }
}

/// Follow-up requested by a reconciler. The default means "done until the next change".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    /// Takes precedence over `requeue` when both are set.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn done() -> Self { Self::default() }
    pub fn requeue() -> Self { Self { requeue: true, requeue_after: None } }
    pub fn requeue_after(after: Duration) -> Self { Self { requeue: false, requeue_after: Some(after) } }
}
