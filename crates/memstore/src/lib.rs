//! rekon memstore: in-process object store implementing both [`ObjectStore`] and
//! [`WatchFeed`].
//!
//! Every write bumps a single global revision which doubles as the resourceVersion of
//! the written object. A bounded history of changes lets watchers resume from a recent
//! cursor; older cursors get [`Error::Expired`]. Faults can be injected per call class.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use rekon_core::{
    Error, LabelSelector, ListSnapshot, ObjectKey, ObjectRecord, ObjectStore, ResourceVersion, Result, WatchEvent,
    WatchFeed, WatchStream,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const DEFAULT_HISTORY: usize = 1024;

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    lists: u32,
    watches: u32,
    reads: u32,
    writes: u32,
}

fn take(n: &mut u32) -> bool {
    if *n == 0 { return false; }
    *n -= 1;
    true
}

struct Watcher {
    kind: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent>>,
}

struct Inner {
    revision: u64,
    objects: BTreeMap<ObjectKey, ObjectRecord>,
    history: VecDeque<(u64, WatchEvent)>,
    // highest revision no longer covered by `history`
    compacted: u64,
    watchers: Vec<Watcher>,
    faults: Faults,
    writes: u64,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn record(&mut self, cap: usize, rev: u64, ev: WatchEvent) {
        if let Some(obj) = event_object(&ev) {
            let kind = obj.key.kind.clone();
            self.watchers.retain(|w| w.kind != kind || w.tx.send(Ok(ev.clone())).is_ok());
        }
        self.history.push_back((rev, ev));
        while self.history.len() > cap {
            if let Some((old, _)) = self.history.pop_front() { self.compacted = old; }
        }
        self.writes += 1;
    }
}

fn event_object(ev: &WatchEvent) -> Option<&ObjectRecord> {
    match ev {
        WatchEvent::Added(o) | WatchEvent::Updated(o) | WatchEvent::Deleted(o) => Some(o),
        WatchEvent::Bookmark(_) => None,
    }
}

/// Re-derive a record after its payload metadata was edited.
fn restamp(rec: ObjectRecord, edit: impl FnOnce(&mut serde_json::Map<String, serde_json::Value>)) -> Result<ObjectRecord> {
    let kind = rec.key.kind.clone();
    let mut payload = rec.payload;
    match payload.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        Some(meta) => edit(meta),
        None => return Err(Error::Invalid(format!("{}: object missing metadata", rec.key))),
    }
    ObjectRecord::from_raw(&kind, payload)
}

fn same_content(a: &ObjectRecord, b: &ObjectRecord) -> bool {
    let strip = |v: &serde_json::Value| {
        let mut v = v.clone();
        if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("resourceVersion");
        }
        v
    };
    strip(&a.payload) == strip(&b.payload)
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    history_cap: usize,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.lock();
        f.debug_struct("MemoryStore").field("revision", &g.revision).field("objects", &g.objects.len()).finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self { Self::with_history(DEFAULT_HISTORY) }

    /// Store retaining at most `cap` changes for watch resumption.
    pub fn with_history(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                revision: 0,
                objects: BTreeMap::new(),
                history: VecDeque::new(),
                compacted: 0,
                watchers: Vec::new(),
                faults: Faults::default(),
                writes: 0,
            }),
            history_cap: cap.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn revision(&self) -> ResourceVersion { ResourceVersion::new(self.lock().revision.to_string()) }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 { self.lock().writes }

    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    /// Synchronous read of the stored version, bypassing fault injection.
    pub fn peek(&self, key: &ObjectKey) -> Option<ObjectRecord> { self.lock().objects.get(key).cloned() }

    /// Synchronous create; see [`ObjectStore::create`].
    pub fn insert(&self, object: ObjectRecord) -> Result<ObjectRecord> {
        let mut g = self.lock();
        if take(&mut g.faults.writes) { return Err(Error::Transient("injected write failure".into())); }
        if g.objects.contains_key(&object.key) { return Err(Error::AlreadyExists(object.key)); }
        let rev = g.next_revision();
        let uid = uuid::Uuid::new_v4().to_string();
        let created = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let stored = restamp(object, |meta| {
            meta.insert("resourceVersion".into(), rev.to_string().into());
            meta.insert("uid".into(), uid.into());
            meta.insert("creationTimestamp".into(), created.into());
        })?;
        g.objects.insert(stored.key.clone(), stored.clone());
        g.record(self.history_cap, rev, WatchEvent::Added(stored.clone()));
        metrics::counter!("memstore_writes_total", 1u64, "op" => "create");
        debug!(key = %stored.key, rv = rev, "memstore: created");
        Ok(stored)
    }

    /// Synchronous update; see [`ObjectStore::update`].
    pub fn replace(&self, object: ObjectRecord) -> Result<ObjectRecord> {
        let mut g = self.lock();
        if take(&mut g.faults.writes) { return Err(Error::Transient("injected write failure".into())); }
        let current = g.objects.get(&object.key).cloned().ok_or_else(|| Error::NotFound(object.key.clone()))?;
        if object.resource_version != current.resource_version {
            return Err(Error::Conflict {
                key: object.key,
                expected: object.resource_version,
                actual: current.resource_version,
            });
        }
        if same_content(&object, &current) { return Ok(current); }
        let rev = g.next_revision();
        let uid = current.uid.clone();
        let created = current.field("/metadata/creationTimestamp").cloned();
        let stored = restamp(object, |meta| {
            meta.insert("resourceVersion".into(), rev.to_string().into());
            if let Some(uid) = uid { meta.insert("uid".into(), uid.into()); }
            if let Some(ts) = created { meta.insert("creationTimestamp".into(), ts); }
        })?;
        g.objects.insert(stored.key.clone(), stored.clone());
        g.record(self.history_cap, rev, WatchEvent::Updated(stored.clone()));
        metrics::counter!("memstore_writes_total", 1u64, "op" => "update");
        debug!(key = %stored.key, rv = rev, "memstore: updated");
        Ok(stored)
    }

    /// Synchronous delete; see [`ObjectStore::delete`].
    pub fn remove(&self, key: &ObjectKey, expected: Option<&ResourceVersion>) -> Result<()> {
        let mut g = self.lock();
        if take(&mut g.faults.writes) { return Err(Error::Transient("injected write failure".into())); }
        let current = g.objects.get(key).cloned().ok_or_else(|| Error::NotFound(key.clone()))?;
        if let Some(exp) = expected {
            if *exp != current.resource_version {
                return Err(Error::Conflict { key: key.clone(), expected: exp.clone(), actual: current.resource_version });
            }
        }
        g.objects.remove(key);
        let rev = g.next_revision();
        let mut gone = current;
        gone.set_resource_version(ResourceVersion::new(rev.to_string()));
        g.record(self.history_cap, rev, WatchEvent::Deleted(gone));
        metrics::counter!("memstore_writes_total", 1u64, "op" => "delete");
        debug!(key = %key, rv = rev, "memstore: deleted");
        Ok(())
    }

    pub fn fail_next_lists(&self, n: u32) { self.lock().faults.lists = n; }
    pub fn fail_next_watches(&self, n: u32) { self.lock().faults.watches = n; }
    pub fn fail_next_reads(&self, n: u32) { self.lock().faults.reads = n; }
    pub fn fail_next_writes(&self, n: u32) { self.lock().faults.writes = n; }

    /// End every open watch stream. Watchers resume from their cursor.
    pub fn disconnect_watchers(&self) {
        let n = std::mem::take(&mut self.lock().watchers).len();
        info!(watchers = n, "memstore: disconnected watchers");
    }

    /// Fail every open watch stream with [`Error::Expired`].
    pub fn expire_watchers(&self) {
        let watchers = std::mem::take(&mut self.lock().watchers);
        for w in watchers.iter() {
            let _ = w.tx.send(Err(Error::Expired("watch expired by store".into())));
        }
        info!(watchers = watchers.len(), "memstore: expired watchers");
    }

    /// Drop the whole change history: only the current revision can be resumed from.
    pub fn compact(&self) {
        let mut g = self.lock();
        g.history.clear();
        g.compacted = g.revision;
        info!(revision = g.revision, "memstore: compacted");
    }

    /// Send a bookmark carrying the current revision to every open watch stream.
    pub fn bookmark(&self) {
        let mut g = self.lock();
        let rv = ResourceVersion::new(g.revision.to_string());
        g.watchers.retain(|w| w.tx.send(Ok(WatchEvent::Bookmark(rv.clone()))).is_ok());
    }
}

#[async_trait]
impl WatchFeed for MemoryStore {
    async fn list(&self, kind: &str) -> Result<ListSnapshot> {
        let mut g = self.lock();
        if take(&mut g.faults.lists) { return Err(Error::Transient("injected list failure".into())); }
        let items = g.objects.values().filter(|o| o.key.kind == kind).cloned().collect();
        Ok(ListSnapshot { items, resource_version: ResourceVersion::new(g.revision.to_string()) })
    }

    async fn watch(&self, kind: &str, since: &ResourceVersion) -> Result<WatchStream> {
        let mut g = self.lock();
        if take(&mut g.faults.watches) { return Err(Error::Transient("injected watch failure".into())); }
        let since = if since.is_empty() {
            g.revision
        } else {
            since
                .as_str()
                .parse::<u64>()
                .map_err(|_| Error::Expired(format!("unrecognised cursor {}", since)))?
        };
        if since < g.compacted {
            return Err(Error::Expired(format!("cursor {} older than compacted revision {}", since, g.compacted)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for (rev, ev) in g.history.iter() {
            if *rev <= since { continue; }
            if event_object(ev).map(|o| o.key.kind == kind).unwrap_or(false) {
                let _ = tx.send(Ok(ev.clone()));
            }
        }
        g.watchers.push(Watcher { kind: kind.to_string(), tx });
        debug!(kind = %kind, since, "memstore: watch opened");
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<ObjectRecord> {
        let mut g = self.lock();
        if take(&mut g.faults.reads) { return Err(Error::Transient("injected read failure".into())); }
        g.objects.get(key).cloned().ok_or_else(|| Error::NotFound(key.clone()))
    }

    async fn list(&self, kind: &str, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<ObjectRecord>> {
        let mut g = self.lock();
        if take(&mut g.faults.reads) { return Err(Error::Transient("injected read failure".into())); }
        Ok(g
            .objects
            .values()
            .filter(|o| o.key.kind == kind)
            .filter(|o| namespace.map(|ns| o.key.namespace == ns).unwrap_or(true))
            .filter(|o| selector.matches(&o.labels))
            .cloned()
            .collect())
    }

    async fn create(&self, object: ObjectRecord) -> Result<ObjectRecord> { self.insert(object) }

    async fn update(&self, object: ObjectRecord) -> Result<ObjectRecord> { self.replace(object) }

    async fn delete(&self, key: &ObjectKey, expected: Option<&ResourceVersion>) -> Result<()> { self.remove(key, expected) }
}
