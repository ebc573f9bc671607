//! In-memory demo: seeds a store with ReplicaSets, pods and ConfigMap-referencing
//! widgets, runs the bundled controllers against it while churning objects, and
//! reports whether the labels converged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rekon_core::{ControllerConfig, LabelSelector, ObjectKey, ObjectRecord, ObjectStore, WatchFeed};
use rekon_memstore::MemoryStore;
use rekon_runtime::Manager;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controllers::{
    add_configmap_ref_controller, add_replicaset_controller, CONFIGMAP, CONFIGMAP_RV_LABEL, DEFAULT_REF_POINTER, POD,
    POD_COUNT_LABEL, REPLICASET,
};

pub const WIDGET: &str = "demo.rekon.dev/v1/Widget";
const NAMESPACE: &str = "default";

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub replicasets: usize,
    pub pods_per_set: usize,
    /// How long to churn objects once the caches are ready.
    pub duration: Duration,
    pub tick: Duration,
    /// Quiet period after churn before the report is taken.
    pub settle: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetRow {
    pub name: String,
    pub pods: usize,
    pub label: Option<String>,
}

impl SetRow {
    pub fn converged(&self) -> bool { self.label.as_deref() == Some(self.pods.to_string().as_str()) }
}

#[derive(Debug, Clone, Serialize)]
pub struct WidgetRow {
    pub name: String,
    pub configmap: String,
    /// resourceVersion of the referenced ConfigMap, or `missing`.
    pub configmap_rv: String,
    pub label: Option<String>,
}

impl WidgetRow {
    pub fn converged(&self) -> bool { self.label.as_deref() == Some(self.configmap_rv.as_str()) }
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub replicasets: Vec<SetRow>,
    pub widgets: Vec<WidgetRow>,
    pub writes: u64,
}

impl DemoReport {
    pub fn converged(&self) -> bool {
        self.replicasets.iter().all(SetRow::converged) && self.widgets.iter().all(WidgetRow::converged)
    }
}

fn app(set: usize) -> String { format!("rs-{}", set) }

fn replicaset(set: usize) -> rekon_core::Result<ObjectRecord> {
    ObjectRecord::from_raw(
        REPLICASET,
        serde_json::json!({
            "apiVersion": "apps/v1", "kind": "ReplicaSet",
            "metadata": { "name": app(set), "namespace": NAMESPACE },
            "spec": {
                "selector": { "matchLabels": { "app": app(set) } },
                "template": { "metadata": { "labels": { "app": app(set) } } }
            }
        }),
    )
}

fn pod(name: &str, set: usize) -> rekon_core::Result<ObjectRecord> {
    ObjectRecord::from_raw(
        POD,
        serde_json::json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {
                "name": name, "namespace": NAMESPACE, "labels": { "app": app(set) },
                "ownerReferences": [{ "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": app(set) }]
            }
        }),
    )
}

fn configmap(set: usize) -> rekon_core::Result<ObjectRecord> {
    ObjectRecord::from_raw(
        CONFIGMAP,
        serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": format!("cfg-{}", set), "namespace": NAMESPACE },
            "data": { "tick": "0" }
        }),
    )
}

fn widget(set: usize) -> rekon_core::Result<ObjectRecord> {
    ObjectRecord::from_raw(
        WIDGET,
        serde_json::json!({
            "apiVersion": "demo.rekon.dev/v1", "kind": "Widget",
            "metadata": { "name": format!("widget-{}", set), "namespace": NAMESPACE },
            "configMapRef": { "name": format!("cfg-{}", set) }
        }),
    )
}

fn seed(store: &MemoryStore, opts: &DemoOptions) -> rekon_core::Result<()> {
    for set in 0..opts.replicasets {
        store.insert(replicaset(set)?)?;
        for p in 0..opts.pods_per_set {
            store.insert(pod(&format!("{}-{}", app(set), p), set)?)?;
        }
        store.insert(configmap(set)?)?;
        store.insert(widget(set)?)?;
    }
    // one widget whose config map never exists
    store.insert(ObjectRecord::from_raw(
        WIDGET,
        serde_json::json!({
            "metadata": { "name": "widget-orphan", "namespace": NAMESPACE },
            "configMapRef": { "name": "cfg-missing" }
        }),
    )?)?;
    Ok(())
}

async fn churn(store: &MemoryStore, opts: &DemoOptions, shutdown: &CancellationToken) -> rekon_core::Result<u64> {
    let sets = opts.replicasets.max(1);
    let deadline = Instant::now() + opts.duration;
    let mut ticker = tokio::time::interval(opts.tick);
    let mut extra: VecDeque<ObjectKey> = VecDeque::new();
    let mut tick = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        if Instant::now() >= deadline { break; }
        let set = (tick as usize) % sets;
        if tick % 3 == 2 {
            if let Some(key) = extra.pop_front() { store.remove(&key, None)?; }
        } else {
            let added = store.insert(pod(&format!("{}-x{}", app(set), tick), set)?)?;
            extra.push_back(added.key);
        }
        if let Some(mut cm) = store.peek(&ObjectKey::new(CONFIGMAP, NAMESPACE, format!("cfg-{}", set))) {
            cm.payload["data"] = serde_json::json!({ "tick": tick.to_string() });
            store.replace(cm)?;
        }
        metrics::counter!("demo_churn_steps_total", 1u64);
        tick += 1;
    }
    Ok(tick)
}

async fn report(store: &MemoryStore, opts: &DemoOptions) -> rekon_core::Result<DemoReport> {
    let mut replicasets = Vec::with_capacity(opts.replicasets);
    for set in 0..opts.replicasets {
        let selector = LabelSelector::everything().with("app", app(set));
        let pods = ObjectStore::list(store, POD, Some(NAMESPACE), &selector).await?;
        let label = store
            .peek(&ObjectKey::new(REPLICASET, NAMESPACE, app(set)))
            .and_then(|rs| rs.label(POD_COUNT_LABEL).map(str::to_string));
        replicasets.push(SetRow { name: app(set), pods: pods.len(), label });
    }
    let mut widgets = Vec::new();
    for w in ObjectStore::list(store, WIDGET, Some(NAMESPACE), &LabelSelector::everything()).await? {
        let configmap = w.field_str(DEFAULT_REF_POINTER).unwrap_or_default().to_string();
        let configmap_rv = store
            .peek(&ObjectKey::new(CONFIGMAP, NAMESPACE, configmap.clone()))
            .map(|cm| cm.resource_version.to_string())
            .unwrap_or_else(|| "missing".to_string());
        let label = w.label(CONFIGMAP_RV_LABEL).map(str::to_string);
        widgets.push(WidgetRow { name: w.key.name, configmap, configmap_rv, label });
    }
    Ok(DemoReport { replicasets, widgets, writes: store.write_count() })
}

/// Run the demo until `opts.duration` elapses or `shutdown` fires, then stop the
/// controllers and report.
pub async fn run(config: ControllerConfig, opts: &DemoOptions, shutdown: CancellationToken) -> anyhow::Result<DemoReport> {
    let store = Arc::new(MemoryStore::new());
    seed(&store, opts).context("seeding demo objects")?;

    let objects: Arc<dyn ObjectStore> = store.clone();
    let feed: Arc<dyn WatchFeed> = store.clone();
    let mut mgr = Manager::new(objects, feed, config);
    add_replicaset_controller(&mut mgr)?;
    add_configmap_ref_controller(&mut mgr, WIDGET, DEFAULT_REF_POINTER)?;

    let health = mgr.health();
    let stop = shutdown.child_token();
    let handle = tokio::spawn(mgr.run(stop.clone()));

    let ready = tokio::select! {
        ready = health.wait_ready() => ready,
        _ = shutdown.cancelled() => false,
    };
    if ready {
        info!(sets = opts.replicasets, "demo: caches synced; churning");
        let ticks = churn(&store, opts, &shutdown).await?;
        info!(ticks, "demo: churn finished; settling");
        tokio::select! {
            _ = tokio::time::sleep(opts.settle) => {}
            _ = shutdown.cancelled() => {}
        }
    } else {
        warn!("demo: stopped before caches synced");
    }

    stop.cancel();
    handle.await.context("joining manager")??;
    Ok(report(&store, opts).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_converges() {
        let opts = DemoOptions {
            replicasets: 3,
            pods_per_set: 2,
            duration: Duration::from_millis(300),
            tick: Duration::from_millis(20),
            settle: Duration::from_millis(500),
        };
        let config = ControllerConfig { resync_interval: Duration::ZERO, ..ControllerConfig::default() };
        let report = run(config, &opts, CancellationToken::new()).await.unwrap();
        assert_eq!(report.replicasets.len(), 3);
        assert_eq!(report.widgets.len(), 4);
        assert!(report.converged(), "{:#?}", report);
        let orphan = report.widgets.iter().find(|w| w.name == "widget-orphan").unwrap();
        assert_eq!(orphan.label.as_deref(), Some("missing"));
    }

    #[tokio::test]
    async fn cancelled_demo_still_reports() {
        let opts = DemoOptions {
            replicasets: 1,
            pods_per_set: 1,
            duration: Duration::from_secs(60),
            tick: Duration::from_millis(10),
            settle: Duration::from_secs(60),
        };
        let shutdown = CancellationToken::new();
        let trip = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trip.cancel();
        });
        let report = run(ControllerConfig::default(), &opts, shutdown).await.unwrap();
        assert_eq!(report.replicasets.len(), 1);
    }
}
