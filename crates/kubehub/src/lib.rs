//! rekon kubehub: Kubernetes backend over `DynamicObject` APIs.
//!
//! Kinds are resolved once through discovery; list, watch and writes then go through
//! `Api<DynamicObject>` handles built from the cached `ApiResource`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta, WatchEvent as KubeEvent},
    discovery::{Discovery, Scope},
    Client,
};
use rekon_core::{
    Error, LabelSelector, ListSnapshot, ObjectKey, ObjectRecord, ObjectStore, ResourceVersion, Result, WatchEvent,
    WatchFeed, WatchStream,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Server-side watch timeout; the informer resumes from its cursor afterwards.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover() -> anyhow::Result<Vec<DiscoveredResource>> {
    let client = Client::try_default().await?;
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(Error::FatalConfig(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

fn find_api_resource(discovery: &Discovery, gvk: &GroupVersionKind) -> Option<(ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Some((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    None
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

fn to_record(kind: &str, obj: &DynamicObject) -> Result<ObjectRecord> {
    let mut raw = serde_json::to_value(obj).map_err(|e| Error::Invalid(format!("{}: serializing object: {}", kind, e)))?;
    strip_managed_fields(&mut raw);
    ObjectRecord::from_raw(kind, raw)
}

fn to_dynamic(ar: &ApiResource, rec: &ObjectRecord) -> Result<DynamicObject> {
    let mut obj: DynamicObject = serde_json::from_value(rec.payload.clone())
        .map_err(|e| Error::Invalid(format!("{}: payload is not an object: {}", rec.key, e)))?;
    obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    Ok(obj)
}

/// Map a kube error onto the store taxonomy.
fn classify(err: kube::Error, key: Option<&ObjectKey>, expected: Option<&ResourceVersion>) -> Error {
    match err {
        kube::Error::Api(ae) => match (ae.code, key) {
            (404, Some(k)) => Error::NotFound(k.clone()),
            (409, Some(k)) if ae.reason == "AlreadyExists" => Error::AlreadyExists(k.clone()),
            (409, Some(k)) => Error::Conflict {
                key: k.clone(),
                expected: expected.cloned().unwrap_or_default(),
                actual: ResourceVersion::default(),
            },
            (410, _) => Error::Expired(ae.message),
            (code, _) => Error::Transient(format!("api error {}: {}", code, ae.message)),
        },
        other => Error::Transient(other.to_string()),
    }
}

#[derive(Debug, Clone)]
struct Resolved {
    ar: ApiResource,
    namespaced: bool,
}

/// [`ObjectStore`] and [`WatchFeed`] over a live cluster.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
    kinds: BTreeMap<String, Resolved>,
    namespace: Option<String>,
}

impl std::fmt::Debug for KubeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBackend").field("kinds", &self.kinds.keys().collect::<Vec<_>>()).field("namespace", &self.namespace).finish()
    }
}

impl KubeBackend {
    /// Connect with the default kubeconfig and resolve every kind key. An unknown kind
    /// is a startup configuration error. `namespace` limits lists and watches of
    /// namespaced kinds.
    pub async fn connect(kinds: &[&str], namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await.map_err(|e| Error::Transient(format!("kube client: {}", e)))?;
        Self::with_client(client, kinds, namespace).await
    }

    pub async fn with_client(client: Client, kinds: &[&str], namespace: Option<&str>) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await.map_err(|e| classify(e, None, None))?;
        let mut resolved = BTreeMap::new();
        for key in kinds {
            let gvk = parse_gvk_key(key)?;
            let (ar, namespaced) = find_api_resource(&discovery, &gvk)
                .ok_or_else(|| Error::FatalConfig(format!("GVK not served by the cluster: {}", key)))?;
            debug!(kind = %key, plural = %ar.plural, namespaced, "kubehub: resolved kind");
            resolved.insert(key.to_string(), Resolved { ar, namespaced });
        }
        info!(kinds = resolved.len(), ns = ?namespace, "kubehub: connected");
        Ok(Self { client, kinds: resolved, namespace: namespace.map(|s| s.to_string()) })
    }

    fn resolved(&self, kind: &str) -> Result<&Resolved> {
        self.kinds.get(kind).ok_or_else(|| Error::Invalid(format!("kind {} not registered with the backend", kind)))
    }

    /// Api for list/watch, scoped to the configured namespace when the kind is namespaced.
    fn collection_api(&self, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let r = self.resolved(kind)?;
        let ns = namespace.or(self.namespace.as_deref());
        Ok(match (r.namespaced, ns) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &r.ar),
            _ => Api::all_with(self.client.clone(), &r.ar),
        })
    }

    /// Api addressing one object.
    fn object_api(&self, key: &ObjectKey) -> Result<(Api<DynamicObject>, &ApiResource)> {
        let r = self.resolved(&key.kind)?;
        let api = if r.namespaced {
            Api::namespaced_with(self.client.clone(), &key.namespace, &r.ar)
        } else {
            Api::all_with(self.client.clone(), &r.ar)
        };
        Ok((api, &r.ar))
    }
}

fn count(verb: &'static str, kind: &str) {
    metrics::counter!("kube_requests_total", 1u64, "verb" => verb, "kind" => kind.to_string());
}

#[async_trait]
impl WatchFeed for KubeBackend {
    async fn list(&self, kind: &str) -> Result<ListSnapshot> {
        count("list", kind);
        let api = self.collection_api(kind, None)?;
        let list = api.list(&ListParams::default()).await.map_err(|e| classify(e, None, None))?;
        let items = list.items.iter().map(|o| to_record(kind, o)).collect::<Result<Vec<_>>>()?;
        let resource_version = ResourceVersion::new(list.metadata.resource_version.unwrap_or_default());
        Ok(ListSnapshot { items, resource_version })
    }

    async fn watch(&self, kind: &str, since: &ResourceVersion) -> Result<WatchStream> {
        count("watch", kind);
        let api = self.collection_api(kind, None)?;
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = api.watch(&wp, since.as_str()).await.map_err(|e| classify(e, None, None))?;
        let kind = kind.to_string();
        Ok(stream
            .map(move |item| match item {
                Ok(KubeEvent::Added(o)) => to_record(&kind, &o).map(WatchEvent::Added),
                Ok(KubeEvent::Modified(o)) => to_record(&kind, &o).map(WatchEvent::Updated),
                Ok(KubeEvent::Deleted(o)) => to_record(&kind, &o).map(WatchEvent::Deleted),
                Ok(KubeEvent::Bookmark(b)) => Ok(WatchEvent::Bookmark(ResourceVersion::new(b.metadata.resource_version))),
                Ok(KubeEvent::Error(ae)) if ae.code == 410 => Err(Error::Expired(ae.message)),
                Ok(KubeEvent::Error(ae)) => Err(Error::Transient(format!("watch error {}: {}", ae.code, ae.message))),
                Err(e) => Err(classify(e, None, None)),
            })
            .boxed())
    }
}

#[async_trait]
impl ObjectStore for KubeBackend {
    async fn get(&self, key: &ObjectKey) -> Result<ObjectRecord> {
        count("get", &key.kind);
        let (api, _) = self.object_api(key)?;
        let obj = api.get(&key.name).await.map_err(|e| classify(e, Some(key), None))?;
        to_record(&key.kind, &obj)
    }

    async fn list(&self, kind: &str, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<ObjectRecord>> {
        count("list", kind);
        let api = self.collection_api(kind, namespace)?;
        let mut lp = ListParams::default();
        if !selector.is_empty() { lp = lp.labels(&selector.to_query()); }
        let list = api.list(&lp).await.map_err(|e| classify(e, None, None))?;
        list.items.iter().map(|o| to_record(kind, o)).collect()
    }

    async fn create(&self, object: ObjectRecord) -> Result<ObjectRecord> {
        count("create", &object.key.kind);
        let (api, ar) = self.object_api(&object.key)?;
        let body = to_dynamic(ar, &object)?;
        let created = api.create(&PostParams::default(), &body).await.map_err(|e| classify(e, Some(&object.key), None))?;
        to_record(&object.key.kind, &created)
    }

    async fn update(&self, object: ObjectRecord) -> Result<ObjectRecord> {
        if object.resource_version.is_empty() {
            return Err(Error::Invalid(format!("{}: update without resourceVersion", object.key)));
        }
        count("replace", &object.key.kind);
        let (api, ar) = self.object_api(&object.key)?;
        let body = to_dynamic(ar, &object)?;
        let stored = api
            .replace(&object.key.name, &PostParams::default(), &body)
            .await
            .map_err(|e| classify(e, Some(&object.key), Some(&object.resource_version)))?;
        to_record(&object.key.kind, &stored)
    }

    async fn delete(&self, key: &ObjectKey, expected: Option<&ResourceVersion>) -> Result<()> {
        count("delete", &key.kind);
        let (api, _) = self.object_api(key)?;
        let dp = DeleteParams {
            preconditions: expected.map(|rv| Preconditions { resource_version: Some(rv.as_str().to_string()), uid: None }),
            ..Default::default()
        };
        api.delete(&key.name, &dp).await.map_err(|e| classify(e, Some(key), expected))?;
        Ok(())
    }
}
