//! Bundled reconcilers: pod counting for ReplicaSets and config map tracking for a
//! custom kind that references a ConfigMap by name.

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use rekon_core::{LabelSelector, ObjectKey, ObjectRecord, ReconcileRequest, ReconcileResult};
use rekon_index::{field_index_fn, namespaced_value};
use rekon_runtime::{Controller, Manager, PredicateMapper, ReconcileContext, Reconciler};
use tracing::{debug, info, warn};

pub const REPLICASET: &str = "apps/v1/ReplicaSet";
pub const POD: &str = "v1/Pod";
pub const CONFIGMAP: &str = "v1/ConfigMap";
pub const POD_COUNT_LABEL: &str = "pod-count";
pub const CONFIGMAP_RV_LABEL: &str = "configmap-resource-version";
pub const CONFIGMAP_REF_INDEX: &str = "configMapRef";
/// Where the bundled custom kind keeps its reference (`configMapRef: {name: ...}`).
pub const DEFAULT_REF_POINTER: &str = "/configMapRef/name";

const WRITE_ATTEMPTS: u32 = 5;

/// Pods selected by the ReplicaSet's pod template labels.
fn template_selector(rs: &ObjectRecord) -> anyhow::Result<LabelSelector> {
    let labels = match rs.field("/spec/template") {
        Some(raw) => {
            let template: PodTemplateSpec =
                serde_json::from_value(raw.clone()).with_context(|| format!("decoding pod template of {}", rs.key))?;
            template.metadata.and_then(|m| m.labels).unwrap_or_default()
        }
        None => Default::default(),
    };
    Ok(labels.into_iter().collect())
}

/// Labels each ReplicaSet with the number of pods its template selects.
#[derive(Debug, Default)]
pub struct ReplicaSetReconciler;

#[async_trait]
impl Reconciler for ReplicaSetReconciler {
    async fn reconcile(&self, ctx: ReconcileContext, req: ReconcileRequest) -> anyhow::Result<ReconcileResult> {
        let rs = match ctx.client.get(&req.key).await {
            Ok(rs) => rs,
            Err(e) if e.is_not_found() => {
                debug!(key = %req.key, "replicaset: gone");
                return Ok(ReconcileResult::done());
            }
            Err(e) => return Err(e).context("getting replica set"),
        };
        let selector = template_selector(&rs)?;
        let pods = ctx.client.list(POD, Some(req.key.namespace.as_str()), &selector).await.context("listing pods")?;
        let count = pods.len().to_string();
        let stored = ctx
            .client
            .update_with_retry(&req.key, WRITE_ATTEMPTS, |rs| rs.set_label(POD_COUNT_LABEL, &count))
            .await
            .context("updating replica set")?;
        if stored.resource_version != rs.resource_version {
            info!(key = %req.key, pods = %count, rv = %stored.resource_version, "replicaset: pod-count updated");
        }
        Ok(ReconcileResult::done())
    }
}

/// Records the resourceVersion of the referenced ConfigMap (or `missing`) on the
/// referencing object.
#[derive(Debug, Clone)]
pub struct ConfigMapRefReconciler {
    pointer: String,
}

impl ConfigMapRefReconciler {
    pub fn new(pointer: &str) -> Self { Self { pointer: pointer.to_string() } }
}

#[async_trait]
impl Reconciler for ConfigMapRefReconciler {
    async fn reconcile(&self, ctx: ReconcileContext, req: ReconcileRequest) -> anyhow::Result<ReconcileResult> {
        let obj = match ctx.client.get(&req.key).await {
            Ok(o) => o,
            Err(e) if e.is_not_found() => return Ok(ReconcileResult::done()),
            Err(e) => return Err(e).context("getting referencing object"),
        };
        let Some(name) = obj.field_str(&self.pointer) else {
            warn!(key = %req.key, pointer = %self.pointer, "configmap-ref: object carries no reference");
            return Ok(ReconcileResult::done());
        };
        let cm_key = ObjectKey::new(CONFIGMAP, req.key.namespace.clone(), name);
        let seen = match ctx.client.get(&cm_key).await {
            Ok(cm) => cm.resource_version.to_string(),
            Err(e) if e.is_not_found() => "missing".to_string(),
            Err(e) => return Err(e).context("getting referenced config map"),
        };
        ctx.client
            .update_with_retry(&req.key, WRITE_ATTEMPTS, |o| o.set_label(CONFIGMAP_RV_LABEL, &seen))
            .await
            .context("recording config map version")?;
        debug!(key = %req.key, configmap = %cm_key, seen = %seen, "configmap-ref: reconciled");
        Ok(ReconcileResult::done())
    }
}

/// ReplicaSets, triggered by themselves and by the pods they own.
pub fn add_replicaset_controller(mgr: &mut Manager) -> rekon_core::Result<()> {
    let c = Controller::new("replicaset", REPLICASET).owns(POD).complete(ReplicaSetReconciler)?;
    mgr.add_controller(c)
}

/// Objects of `kind` referencing a ConfigMap at `pointer`, triggered by ConfigMap
/// changes through an index on the reference.
pub fn add_configmap_ref_controller(mgr: &mut Manager, kind: &str, pointer: &str) -> rekon_core::Result<()> {
    mgr.add_index(kind, CONFIGMAP_REF_INDEX, field_index_fn(pointer))?;
    let referencing = mgr.cache_for(kind);
    let ptr = pointer.to_string();
    let mapper = PredicateMapper::new(referencing, move |obj: &ObjectRecord, cm: &ObjectRecord| {
        obj.key.namespace == cm.key.namespace && obj.field_str(&ptr) == Some(cm.key.name.as_str())
    })
    .via_index(CONFIGMAP_REF_INDEX, |cm: &ObjectRecord| Some(namespaced_value(&cm.key.namespace, &cm.key.name)));
    let c = Controller::new("configmap-ref", kind)
        .watches(CONFIGMAP, mapper)
        .complete(ConfigMapRefReconciler::new(pointer))?;
    mgr.add_controller(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use rekon_core::{ControllerConfig, ObjectStore, WatchFeed};
    use rekon_memstore::MemoryStore;
    use tokio_util::sync::CancellationToken;

    const WIDGET: &str = "example.com/v1/Widget";

    fn rs(name: &str, app: &str) -> ObjectRecord {
        ObjectRecord::from_raw(
            REPLICASET,
            serde_json::json!({
                "apiVersion": "apps/v1", "kind": "ReplicaSet",
                "metadata": { "name": name, "namespace": "default", "labels": {} },
                "spec": { "selector": { "matchLabels": { "app": app } }, "template": { "metadata": { "labels": { "app": app } } } }
            }),
        )
        .unwrap()
    }

    fn pod(name: &str, app: &str, owner: Option<&str>) -> ObjectRecord {
        let refs: Vec<_> = owner
            .map(|o| serde_json::json!({ "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": o }))
            .into_iter()
            .collect();
        ObjectRecord::from_raw(
            POD,
            serde_json::json!({
                "metadata": { "name": name, "namespace": "default", "labels": { "app": app }, "ownerReferences": refs }
            }),
        )
        .unwrap()
    }

    fn label(store: &MemoryStore, kind: &str, name: &str, label: &str) -> Option<String> {
        store.peek(&ObjectKey::new(kind, "default", name)).and_then(|o| o.label(label).map(|s| s.to_string()))
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() { return; }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn config() -> ControllerConfig {
        ControllerConfig { resync_interval: Duration::ZERO, shutdown_grace: Duration::from_secs(1), ..ControllerConfig::default() }
    }

    fn manager(store: &Arc<MemoryStore>) -> Manager {
        let objects: Arc<dyn ObjectStore> = store.clone();
        let feed: Arc<dyn WatchFeed> = store.clone();
        Manager::new(objects, feed, config())
    }

    #[test]
    fn selector_comes_from_template_labels() {
        let sel = template_selector(&rs("rs-1", "web")).unwrap();
        assert_eq!(sel.to_query(), "app=web");
        let bare = ObjectRecord::from_raw(REPLICASET, serde_json::json!({ "metadata": { "name": "x" } })).unwrap();
        assert!(template_selector(&bare).unwrap().is_empty());
    }

    #[tokio::test]
    async fn replicaset_pod_count_tracks_template_matches() {
        let store = Arc::new(MemoryStore::new());
        store.insert(rs("rs-1", "web")).unwrap();
        store.insert(pod("web-1", "web", Some("rs-1"))).unwrap();
        store.insert(pod("web-2", "web", Some("rs-1"))).unwrap();
        store.insert(pod("db-1", "db", None)).unwrap();

        let mut mgr = manager(&store);
        add_replicaset_controller(&mut mgr).unwrap();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(mgr.run(shutdown.clone()));

        eventually("pod-count=2", || label(&store, REPLICASET, "rs-1", POD_COUNT_LABEL).as_deref() == Some("2")).await;

        store.insert(pod("web-3", "web", Some("rs-1"))).unwrap();
        eventually("pod-count=3", || label(&store, REPLICASET, "rs-1", POD_COUNT_LABEL).as_deref() == Some("3")).await;

        store.remove(&ObjectKey::new(POD, "default", "web-1"), None).unwrap();
        eventually("pod-count=2 again", || label(&store, REPLICASET, "rs-1", POD_COUNT_LABEL).as_deref() == Some("2")).await;

        // an unowned pod of another app changes nothing
        store.insert(pod("db-2", "db", None)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(label(&store, REPLICASET, "rs-1", POD_COUNT_LABEL).as_deref(), Some("2"));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn configmap_changes_propagate_to_referencing_objects() {
        let store = Arc::new(MemoryStore::new());
        let widget = |name: &str, cm: &str| {
            ObjectRecord::from_raw(
                WIDGET,
                serde_json::json!({ "metadata": { "name": name, "namespace": "default" }, "configMapRef": { "name": cm } }),
            )
            .unwrap()
        };
        store.insert(widget("w1", "cfg")).unwrap();
        store.insert(widget("w2", "other")).unwrap();

        let mut mgr = manager(&store);
        add_configmap_ref_controller(&mut mgr, WIDGET, DEFAULT_REF_POINTER).unwrap();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(mgr.run(shutdown.clone()));

        eventually("w1 sees missing", || label(&store, WIDGET, "w1", CONFIGMAP_RV_LABEL).as_deref() == Some("missing")).await;

        let cm = store
            .insert(ObjectRecord::from_raw(CONFIGMAP, serde_json::json!({ "metadata": { "name": "cfg", "namespace": "default" } })).unwrap())
            .unwrap();
        let expected = cm.resource_version.to_string();
        eventually("w1 sees cfg", || label(&store, WIDGET, "w1", CONFIGMAP_RV_LABEL) == Some(expected.clone())).await;
        assert_eq!(label(&store, WIDGET, "w2", CONFIGMAP_RV_LABEL).as_deref(), Some("missing"));

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }
}
