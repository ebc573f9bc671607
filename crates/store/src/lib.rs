//! rekon store: per-kind object caches fed by a sequential apply stream.
//!
//! The writer side ([`CacheBuilder`]) lives in exactly one informer task per kind and
//! publishes immutable [`KindSnapshot`]s; readers ([`KindCache`]) load them lock-free.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rekon_core::{LabelSelector, ObjectKey, ObjectRecord, ResourceVersion, Result, WatchEvent};
use rekon_index::Indexer;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

mod informer;

pub use informer::{EventSink, Informer};

/// Domain event derived from one applied cache mutation.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Added(Arc<ObjectRecord>),
    Updated { old: Arc<ObjectRecord>, new: Arc<ObjectRecord> },
    Deleted(Arc<ObjectRecord>),
}

impl ResourceEvent {
    /// The most recent state carried by the event.
    pub fn object(&self) -> &ObjectRecord {
        match self {
            ResourceEvent::Added(o) | ResourceEvent::Deleted(o) => o,
            ResourceEvent::Updated { new, .. } => new,
        }
    }

    pub fn key(&self) -> &ObjectKey { &self.object().key }

    pub fn label(&self) -> &'static str {
        match self {
            ResourceEvent::Added(_) => "added",
            ResourceEvent::Updated { .. } => "updated",
            ResourceEvent::Deleted(_) => "deleted",
        }
    }
}

/// Immutable view of one kind at a given epoch.
#[derive(Debug, Clone, Default)]
pub struct KindSnapshot {
    pub epoch: u64,
    pub synced: bool,
    items: im::HashMap<ObjectKey, Arc<ObjectRecord>>,
    index: Indexer,
}

impl KindSnapshot {
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn get(&self, key: &ObjectKey) -> Option<ObjectRecord> { self.items.get(key).map(|o| (**o).clone()) }

    /// Records in `namespace` (all namespaces when `None`) matching `selector`, in key order.
    pub fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<ObjectRecord> {
        let mut out: Vec<ObjectRecord> = self
            .items
            .values()
            .filter(|o| namespace.map(|ns| o.key.namespace == ns).unwrap_or(true))
            .filter(|o| selector.matches(&o.labels))
            .map(|o| (**o).clone())
            .collect();
        out.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<ObjectRecord>> {
        let keys = self.index.lookup(index, value)?;
        Ok(keys.iter().filter_map(|k| self.get(k)).collect())
    }

    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>> { self.index.lookup(index, value) }

    pub fn has_index(&self, index: &str) -> bool { self.index.has_index(index) }
}

/// Capacity-bounded FIFO of last-seen versions of deleted objects.
/// Last version (and uid, when known) of a deleted object.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Gone {
    rv: ResourceVersion,
    uid: Option<String>,
}

struct Tombstones {
    map: FxHashMap<ObjectKey, Gone>,
    order: VecDeque<ObjectKey>,
    cap: usize,
}

impl Tombstones {
    fn with_capacity(cap: usize) -> Self { Self { map: FxHashMap::default(), order: VecDeque::new(), cap } }

    fn get(&self, key: &ObjectKey) -> Option<&Gone> { self.map.get(key) }

    fn push(&mut self, key: ObjectKey, gone: Gone) {
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() { self.map.remove(&old); }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, gone);
    }

    // `order` may keep the key; a later pop of it is a harmless no-op on `map`.
    fn remove(&mut self, key: &ObjectKey) { self.map.remove(key); }
}

const TOMBSTONE_CAP: usize = 4096;

fn strictly_older(candidate: &ResourceVersion, current: &ResourceVersion) -> bool {
    !candidate.is_empty() && !current.is_empty() && current.is_newer_than(candidate)
}

/// Two known, different uids: the key was deleted and recreated, and versions of the
/// two incarnations do not compare.
fn other_incarnation(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a != b)
}

/// Mutable working copy of one kind's cache. Owned by that kind's informer.
pub struct CacheBuilder {
    kind: String,
    epoch: u64,
    synced: bool,
    items: im::HashMap<ObjectKey, Arc<ObjectRecord>>,
    tombstones: Tombstones,
    index: Indexer,
}

impl CacheBuilder {
    pub fn new(kind: &str) -> Self { Self::with_indexer(kind, Indexer::with_owner_index()) }

    pub fn with_indexer(kind: &str, index: Indexer) -> Self {
        Self {
            kind: kind.to_string(),
            epoch: 0,
            synced: false,
            items: im::HashMap::new(),
            tombstones: Tombstones::with_capacity(TOMBSTONE_CAP),
            index,
        }
    }

    pub fn kind(&self) -> &str { &self.kind }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn mark_synced(&mut self) { self.synced = true; }
    pub fn is_synced(&self) -> bool { self.synced }

    /// Apply one notification. Returns the resulting event, or `None` when the
    /// notification was stale, a duplicate, or a bookmark.
    pub fn apply(&mut self, ev: WatchEvent) -> Option<ResourceEvent> {
        let out = match ev {
            WatchEvent::Added(o) | WatchEvent::Updated(o) => self.upsert(o),
            WatchEvent::Deleted(o) => self.delete(o),
            WatchEvent::Bookmark(_) => None,
        };
        if let Some(e) = &out {
            metrics::counter!("cache_events_total", 1u64, "kind" => self.kind.clone(), "event" => e.label());
        }
        out
    }

    fn accepts(&self, o: &ObjectRecord) -> bool {
        if o.key.kind != self.kind {
            warn!(kind = %self.kind, key = %o.key, "cache: dropping object of foreign kind");
            return false;
        }
        true
    }

    fn upsert(&mut self, o: ObjectRecord) -> Option<ResourceEvent> {
        if !self.accepts(&o) { return None; }
        let prev = match self.items.get(&o.key) {
            Some(c) => Some((&c.resource_version, c.uid.as_deref())),
            None => self.tombstones.get(&o.key).map(|g| (&g.rv, g.uid.as_deref())),
        };
        if let Some((prev, prev_uid)) = prev {
            if other_incarnation(o.uid.as_deref(), prev_uid) {
                debug!(key = %o.key, rv = %o.resource_version, "cache: new incarnation");
            } else if !o.resource_version.is_newer_than(prev) {
                debug!(key = %o.key, rv = %o.resource_version, cached = %prev, "cache: discarding stale notification");
                metrics::counter!("cache_stale_discarded_total", 1u64, "kind" => self.kind.clone());
                return None;
            }
        }
        self.tombstones.remove(&o.key);
        self.index.upsert(&o);
        let new = Arc::new(o);
        match self.items.insert(new.key.clone(), Arc::clone(&new)) {
            Some(old) => Some(ResourceEvent::Updated { old, new }),
            None => Some(ResourceEvent::Added(new)),
        }
    }

    fn delete(&mut self, o: ObjectRecord) -> Option<ResourceEvent> {
        if !self.accepts(&o) { return None; }
        let (cached_rv, cached_uid) = self.items.get(&o.key).map(|c| (c.resource_version.clone(), c.uid.clone()))?;
        if other_incarnation(o.uid.as_deref(), cached_uid.as_deref()) {
            debug!(key = %o.key, rv = %o.resource_version, "cache: discarding delete of a previous incarnation");
            metrics::counter!("cache_stale_discarded_total", 1u64, "kind" => self.kind.clone());
            return None;
        }
        if strictly_older(&o.resource_version, &cached_rv) {
            debug!(key = %o.key, rv = %o.resource_version, cached = %cached_rv, "cache: discarding stale delete");
            metrics::counter!("cache_stale_discarded_total", 1u64, "kind" => self.kind.clone());
            return None;
        }
        self.items.remove(&o.key);
        self.index.remove(&o.key);
        let rv = if o.resource_version.is_empty() { cached_rv } else { o.resource_version.clone() };
        let uid = o.uid.clone().or(cached_uid);
        self.tombstones.push(o.key.clone(), Gone { rv, uid });
        Some(ResourceEvent::Deleted(Arc::new(o)))
    }

    /// Replace the whole contents with an authoritative list.
    ///
    /// Every listed object is re-delivered as `Added`; cached objects missing from the
    /// list are delivered as `Deleted`.
    pub fn replace(&mut self, listed: Vec<ObjectRecord>) -> Vec<ResourceEvent> {
        let mut events = Vec::with_capacity(listed.len());
        let mut next: im::HashMap<ObjectKey, Arc<ObjectRecord>> = im::HashMap::new();
        self.index.clear();
        for o in listed {
            if !self.accepts(&o) { continue; }
            self.tombstones.remove(&o.key);
            self.index.upsert(&o);
            let rec = Arc::new(o);
            next.insert(rec.key.clone(), Arc::clone(&rec));
            events.push(ResourceEvent::Added(rec));
        }
        let mut gone: Vec<Arc<ObjectRecord>> = self
            .items
            .values()
            .filter(|old| !next.contains_key(&old.key))
            .cloned()
            .collect();
        gone.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        for old in gone {
            self.tombstones.push(old.key.clone(), Gone { rv: old.resource_version.clone(), uid: old.uid.clone() });
            events.push(ResourceEvent::Deleted(old));
        }
        self.items = next;
        metrics::counter!("cache_relists_total", 1u64, "kind" => self.kind.clone());
        events
    }

    /// Snapshot the current state under a new epoch. Items and postings are persistent
    /// maps: the snapshot shares structure with the builder instead of copying it.
    pub fn freeze(&mut self) -> Arc<KindSnapshot> {
        self.epoch = self.epoch.saturating_add(1);
        metrics::gauge!("cache_objects", self.items.len() as f64, "kind" => self.kind.clone());
        Arc::new(KindSnapshot {
            epoch: self.epoch,
            synced: self.synced,
            items: self.items.clone(),
            index: self.index.clone(),
        })
    }

    fn empty_snapshot(&self) -> KindSnapshot {
        KindSnapshot { epoch: 0, synced: false, items: im::HashMap::new(), index: self.index.clone() }
    }
}

/// Writer half: applies through its builder and publishes to readers.
pub struct CacheWriter {
    pub builder: CacheBuilder,
    snap: Arc<ArcSwap<KindSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
}

impl CacheWriter {
    pub fn publish(&mut self) {
        let next = self.builder.freeze();
        let epoch = next.epoch;
        let synced = next.synced;
        self.builder.index.publish_metrics(&self.builder.kind);
        self.snap.store(next);
        let _ = self.epoch_tx.send(epoch);
        if synced && !*self.synced_tx.borrow() {
            let _ = self.synced_tx.send(true);
        }
    }
}

/// Create a connected writer/reader pair for one kind.
pub fn cache_pair(builder: CacheBuilder) -> (CacheWriter, KindCache) {
    let snap = Arc::new(ArcSwap::from_pointee(builder.empty_snapshot()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (synced_tx, synced_rx) = watch::channel(false);
    let kind: Arc<str> = Arc::from(builder.kind());
    let reader = KindCache { kind, snap: Arc::clone(&snap), epoch_rx, synced_rx };
    (CacheWriter { builder, snap, epoch_tx, synced_tx }, reader)
}

/// Read handle for one kind. Cheap to clone; every read returns owned copies.
#[derive(Clone)]
pub struct KindCache {
    kind: Arc<str>,
    snap: Arc<ArcSwap<KindSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    synced_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for KindCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindCache").field("kind", &self.kind).field("synced", &self.is_synced()).finish()
    }
}

impl KindCache {
    pub fn kind(&self) -> &str { &self.kind }
    pub fn current(&self) -> Arc<KindSnapshot> { self.snap.load_full() }
    pub fn get(&self, key: &ObjectKey) -> Option<ObjectRecord> { self.snap.load().get(key) }
    pub fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<ObjectRecord> {
        self.snap.load().list(namespace, selector)
    }
    pub fn keys(&self) -> Vec<ObjectKey> { self.snap.load().keys() }
    pub fn len(&self) -> usize { self.snap.load().len() }
    pub fn is_empty(&self) -> bool { self.snap.load().is_empty() }
    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<ObjectRecord>> { self.snap.load().by_index(index, value) }
    pub fn has_index(&self, index: &str) -> bool { self.snap.load().has_index(index) }
    pub fn is_synced(&self) -> bool { *self.synced_rx.borrow() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait until the initial list has been applied. Returns false if the writer went
    /// away before that happened.
    pub async fn wait_synced(&self) -> bool {
        let mut rx = self.synced_rx.clone();
        loop {
            if *rx.borrow_and_update() { return true; }
            if rx.changed().await.is_err() { return *rx.borrow(); }
        }
    }
}

/// Registry of per-kind caches; dispatches reads by `ObjectKey::kind`.
#[derive(Clone, Default, Debug)]
pub struct ObjectCache {
    kinds: std::collections::BTreeMap<String, KindCache>,
}

impl ObjectCache {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, cache: KindCache) { self.kinds.insert(cache.kind().to_string(), cache); }

    pub fn kind(&self, kind: &str) -> Option<&KindCache> { self.kinds.get(kind) }
    pub fn contains_kind(&self, kind: &str) -> bool { self.kinds.contains_key(kind) }
    pub fn kinds(&self) -> impl Iterator<Item = &str> { self.kinds.keys().map(|k| k.as_str()) }

    /// `None` when the kind is not cached at all; `Some(None)` when cached but absent.
    pub fn get(&self, key: &ObjectKey) -> Option<Option<ObjectRecord>> { self.kinds.get(&key.kind).map(|c| c.get(key)) }

    pub fn list(&self, kind: &str, namespace: Option<&str>, selector: &LabelSelector) -> Option<Vec<ObjectRecord>> {
        self.kinds.get(kind).map(|c| c.list(namespace, selector))
    }

    pub fn all_synced(&self) -> bool { self.kinds.values().all(|c| c.is_synced()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, rv: &str, owner: Option<&str>) -> ObjectRecord {
        let mut meta = serde_json::json!({ "name": name, "namespace": "default", "resourceVersion": rv });
        if let Some(o) = owner {
            meta["ownerReferences"] = serde_json::json!([{ "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": o }]);
        }
        ObjectRecord::from_raw("v1/Pod", serde_json::json!({ "metadata": meta })).unwrap()
    }

    #[test]
    fn tombstones_are_bounded_fifo() {
        let mut t = Tombstones::with_capacity(2);
        let k = |n: &str| ObjectKey::new("v1/Pod", "default", n);
        let gone = |rv: &str| Gone { rv: rv.into(), uid: None };
        t.push(k("a"), gone("1"));
        t.push(k("b"), gone("2"));
        t.push(k("c"), gone("3"));
        assert!(t.get(&k("a")).is_none());
        assert_eq!(t.get(&k("c")).map(|g| g.rv.as_str()), Some("3"));
    }

    #[test]
    fn upsert_emits_added_then_updated_and_discards_stale() {
        let mut b = CacheBuilder::new("v1/Pod");
        assert!(matches!(b.apply(WatchEvent::Added(pod("p", "5", None))), Some(ResourceEvent::Added(_))));
        assert!(b.apply(WatchEvent::Added(pod("p", "5", None))).is_none(), "duplicate is a no-op");
        assert!(b.apply(WatchEvent::Updated(pod("p", "4", None))).is_none(), "older version is discarded");
        match b.apply(WatchEvent::Updated(pod("p", "6", Some("rs-1")))) {
            Some(ResourceEvent::Updated { old, new }) => {
                assert_eq!(old.resource_version.as_str(), "5");
                assert_eq!(new.owner_keys.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(b.apply(WatchEvent::Bookmark("9".into())).is_none());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn delete_leaves_tombstone_against_replays() {
        let mut b = CacheBuilder::new("v1/Pod");
        b.apply(WatchEvent::Added(pod("p", "5", None)));
        assert!(b.apply(WatchEvent::Deleted(pod("p", "3", None))).is_none(), "stale delete ignored");
        assert!(matches!(b.apply(WatchEvent::Deleted(pod("p", "7", None))), Some(ResourceEvent::Deleted(_))));
        assert!(b.apply(WatchEvent::Deleted(pod("p", "7", None))).is_none(), "duplicate delete ignored");
        assert!(b.apply(WatchEvent::Updated(pod("p", "6", None))).is_none(), "replay after delete ignored");
        assert!(matches!(b.apply(WatchEvent::Added(pod("p", "8", None))), Some(ResourceEvent::Added(_))), "recreation accepted");
    }

    #[test]
    fn foreign_kind_rejected() {
        let mut b = CacheBuilder::new("apps/v1/ReplicaSet");
        assert!(b.apply(WatchEvent::Added(pod("p", "1", None))).is_none());
        assert!(b.is_empty());
    }

    #[test]
    fn replace_redelivers_added_and_reports_vanished() {
        let mut b = CacheBuilder::new("v1/Pod");
        b.apply(WatchEvent::Added(pod("a", "1", Some("rs-1"))));
        b.apply(WatchEvent::Added(pod("b", "2", None)));
        let events = b.replace(vec![pod("a", "1", None)]);
        let labels: Vec<_> = events.iter().map(|e| (e.label(), e.key().name.clone())).collect();
        assert_eq!(labels, vec![("added", "a".to_string()), ("deleted", "b".to_string())]);
        let snap = b.freeze();
        assert_eq!(snap.len(), 1);
        let rs1 = ObjectKey::new("apps/v1/ReplicaSet", "default", "rs-1");
        assert!(snap.index_keys(rekon_index::OWNER_INDEX, &rekon_index::owner_index_value(&rs1)).unwrap().is_empty());
    }

    #[test]
    fn snapshot_reads_are_copies() {
        let (mut w, reader) = cache_pair(CacheBuilder::new("v1/Pod"));
        w.builder.apply(WatchEvent::Added(pod("a", "1", Some("rs-1"))));
        w.publish();
        let mut copy = reader.get(&ObjectKey::new("v1/Pod", "default", "a")).unwrap();
        copy.set_label("mutated", "yes");
        let again = reader.get(&ObjectKey::new("v1/Pod", "default", "a")).unwrap();
        assert!(again.label("mutated").is_none());
        assert_eq!(reader.current().epoch, 1);
        assert!(!reader.is_synced());
        let rs1 = ObjectKey::new("apps/v1/ReplicaSet", "default", "rs-1");
        let children = reader.by_index(rekon_index::OWNER_INDEX, &rekon_index::owner_index_value(&rs1)).unwrap();
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn published_snapshots_do_not_see_later_writes() {
        let mut b = CacheBuilder::new("v1/Pod");
        for i in 0..64 {
            b.apply(WatchEvent::Added(pod(&format!("p-{}", i), "1", Some("rs-1"))));
        }
        let first = b.freeze();
        b.apply(WatchEvent::Updated(pod("p-0", "2", None)));
        b.apply(WatchEvent::Deleted(pod("p-1", "2", Some("rs-1"))));
        b.apply(WatchEvent::Added(pod("p-new", "3", Some("rs-1"))));
        let second = b.freeze();

        let rs1 = ObjectKey::new("apps/v1/ReplicaSet", "default", "rs-1");
        let owner = rekon_index::owner_index_value(&rs1);
        assert_eq!(first.len(), 64);
        assert_eq!(first.get(&ObjectKey::new("v1/Pod", "default", "p-0")).unwrap().resource_version.as_str(), "1");
        assert_eq!(first.index_keys(rekon_index::OWNER_INDEX, &owner).unwrap().len(), 64);
        assert_eq!(second.len(), 64);
        assert_eq!(second.get(&ObjectKey::new("v1/Pod", "default", "p-0")).unwrap().resource_version.as_str(), "2");
        assert!(second.get(&ObjectKey::new("v1/Pod", "default", "p-1")).is_none());
        assert_eq!(second.index_keys(rekon_index::OWNER_INDEX, &owner).unwrap().len(), 63);
    }

    fn pod_with_uid(name: &str, rv: &str, uid: &str) -> ObjectRecord {
        ObjectRecord::from_raw(
            "v1/Pod",
            serde_json::json!({ "metadata": { "name": name, "namespace": "default", "resourceVersion": rv, "uid": uid } }),
        )
        .unwrap()
    }

    #[test]
    fn recreated_object_starts_a_new_version_lineage() {
        let mut b = CacheBuilder::new("v1/Pod");
        b.apply(WatchEvent::Added(pod_with_uid("p", "b7", "uid-a")));
        assert!(matches!(b.apply(WatchEvent::Deleted(pod_with_uid("p", "b7", "uid-a"))), Some(ResourceEvent::Deleted(_))));
        // same uid replayed after the delete is still stale
        assert!(b.apply(WatchEvent::Updated(pod_with_uid("p", "a0", "uid-a"))).is_none());
        match b.apply(WatchEvent::Added(pod_with_uid("p", "a1", "uid-b"))) {
            Some(ResourceEvent::Added(o)) => assert_eq!(o.uid.as_deref(), Some("uid-b")),
            other => panic!("recreation dropped: {:?}", other),
        }
        assert_eq!(b.len(), 1);

        // a late delete of the old incarnation leaves the new one alone
        assert!(b.apply(WatchEvent::Deleted(pod_with_uid("p", "b8", "uid-a"))).is_none());
        // a missed delete: the new incarnation replaces the cached one regardless of version order
        match b.apply(WatchEvent::Added(pod_with_uid("p", "00", "uid-c"))) {
            Some(ResourceEvent::Updated { old, new }) => {
                assert_eq!(old.uid.as_deref(), Some("uid-b"));
                assert_eq!(new.uid.as_deref(), Some("uid-c"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
