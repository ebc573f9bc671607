//! rekon index: named secondary indexes over cached objects.
//! Postings are maintained incrementally as the cache applies each mutation.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use rekon_core::{Error, ObjectKey, ObjectRecord, Result};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

pub type IndexValues = SmallVec<[String; 4]>;

/// Extracts the index values of one record. May return zero, one or many values.
pub type IndexFn = Arc<dyn Fn(&ObjectRecord) -> IndexValues + Send + Sync>;

/// Built-in index over `ObjectRecord::owner_keys`.
pub const OWNER_INDEX: &str = "owner";

/// Index value under which children of `owner` are filed in [`OWNER_INDEX`].
pub fn owner_index_value(owner: &ObjectKey) -> String { owner.to_string() }

pub fn owner_index_fn() -> IndexFn {
    Arc::new(|rec: &ObjectRecord| rec.owner_keys.iter().map(owner_index_value).collect())
}

/// Index on a string field addressed by JSON pointer, scoped to the object's namespace
/// (`namespace/value`). Useful for relations like `spec.configMapRef.name`.
pub fn field_index_fn(pointer: &str) -> IndexFn {
    let pointer = pointer.to_string();
    Arc::new(move |rec: &ObjectRecord| {
        rec.field_str(&pointer)
            .map(|v| namespaced_value(&rec.key.namespace, v))
            .into_iter()
            .collect()
    })
}

pub fn namespaced_value(namespace: &str, value: &str) -> String { format!("{}/{}", namespace, value) }

#[derive(Clone)]
struct Index {
    func: IndexFn,
    postings: im::HashMap<String, im::OrdSet<ObjectKey>>,
    // values recorded at insert time; removal never re-runs `func`
    values: im::HashMap<ObjectKey, IndexValues>,
}

impl Index {
    fn new(func: IndexFn) -> Self {
        Self { func, postings: im::HashMap::new(), values: im::HashMap::new() }
    }

    fn remove(&mut self, key: &ObjectKey) {
        if let Some(old) = self.values.remove(key) {
            for v in old.iter() {
                if let Some(set) = self.postings.get_mut(v) {
                    set.remove(key);
                    if set.is_empty() { self.postings.remove(v); }
                }
            }
        }
    }

    fn upsert(&mut self, rec: &ObjectRecord) {
        self.remove(&rec.key);
        let mut vals = (self.func)(rec);
        vals.sort_unstable();
        vals.dedup();
        if vals.is_empty() { return; }
        for v in vals.iter() {
            let mut set = self.postings.get(v).cloned().unwrap_or_default();
            set.insert(rec.key.clone());
            self.postings.insert(v.clone(), set);
        }
        self.values.insert(rec.key.clone(), vals);
    }
}

/// Set of named indexes. Postings are persistent maps, so a clone shares structure
/// with the original and costs O(number of indexes).
#[derive(Clone, Default)]
pub struct Indexer {
    indexes: FxHashMap<String, Index>,
}

impl fmt::Debug for Indexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.indexes.keys().collect();
        names.sort_unstable();
        f.debug_struct("Indexer").field("indexes", &names).finish()
    }
}

impl Indexer {
    pub fn new() -> Self { Self::default() }

    /// Indexer pre-populated with the [`OWNER_INDEX`].
    pub fn with_owner_index() -> Self {
        let mut me = Self::new();
        me.indexes.insert(OWNER_INDEX.to_string(), Index::new(owner_index_fn()));
        me
    }

    /// Register an index. Must happen before the cache is seeded; a duplicate name is a
    /// startup configuration error.
    pub fn add_index(&mut self, name: &str, func: IndexFn) -> Result<()> {
        if self.indexes.contains_key(name) {
            return Err(Error::FatalConfig(format!("index {} registered twice", name)));
        }
        debug!(index = %name, "index: registered");
        self.indexes.insert(name.to_string(), Index::new(func));
        Ok(())
    }

    pub fn has_index(&self, name: &str) -> bool { self.indexes.contains_key(name) }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.indexes.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Re-index one record: entries from its previous version go first.
    pub fn upsert(&mut self, rec: &ObjectRecord) {
        for idx in self.indexes.values_mut() { idx.upsert(rec); }
    }

    pub fn remove(&mut self, key: &ObjectKey) {
        for idx in self.indexes.values_mut() { idx.remove(key); }
    }

    pub fn clear(&mut self) {
        for idx in self.indexes.values_mut() {
            idx.postings.clear();
            idx.values.clear();
        }
    }

    /// Keys whose current version yields `value` under `index`, in key order.
    pub fn lookup(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>> {
        let idx = self
            .indexes
            .get(index)
            .ok_or_else(|| Error::Mapping(format!("unknown index {}", index)))?;
        Ok(idx.postings.get(value).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    /// Values currently filed for `key` under `index`.
    pub fn values_of(&self, index: &str, key: &ObjectKey) -> Option<&[String]> {
        self.indexes.get(index).and_then(|idx| idx.values.get(key)).map(|v| v.as_slice())
    }

    /// Number of distinct values under `index`.
    pub fn cardinality(&self, index: &str) -> usize {
        self.indexes.get(index).map(|idx| idx.postings.len()).unwrap_or(0)
    }

    pub fn publish_metrics(&self, kind: &str) {
        for (name, idx) in self.indexes.iter() {
            metrics::gauge!("index_values", idx.postings.len() as f64, "kind" => kind.to_string(), "index" => name.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pod(name: &str, owner: Option<&str>, rv: &str) -> ObjectRecord {
        let mut meta = serde_json::json!({ "name": name, "namespace": "default", "resourceVersion": rv });
        if let Some(o) = owner {
            meta["ownerReferences"] = serde_json::json!([{ "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": o }]);
        }
        ObjectRecord::from_raw("v1/Pod", serde_json::json!({ "metadata": meta })).unwrap()
    }

    fn rs(name: &str) -> ObjectKey { ObjectKey::new("apps/v1/ReplicaSet", "default", name) }

    #[test]
    fn owner_index_follows_reparenting() {
        let mut ix = Indexer::with_owner_index();
        ix.upsert(&pod("p1", Some("rs-1"), "1"));
        ix.upsert(&pod("p2", Some("rs-1"), "2"));
        assert_eq!(ix.lookup(OWNER_INDEX, &owner_index_value(&rs("rs-1"))).unwrap().len(), 2);

        ix.upsert(&pod("p1", Some("rs-2"), "3"));
        let on_1 = ix.lookup(OWNER_INDEX, &owner_index_value(&rs("rs-1"))).unwrap();
        assert_eq!(on_1, vec![ObjectKey::new("v1/Pod", "default", "p2")]);
        let on_2 = ix.lookup(OWNER_INDEX, &owner_index_value(&rs("rs-2"))).unwrap();
        assert_eq!(on_2, vec![ObjectKey::new("v1/Pod", "default", "p1")]);

        ix.remove(&ObjectKey::new("v1/Pod", "default", "p2"));
        assert!(ix.lookup(OWNER_INDEX, &owner_index_value(&rs("rs-1"))).unwrap().is_empty());
        assert_eq!(ix.cardinality(OWNER_INDEX), 1);
    }

    #[test]
    fn stale_values_removed_even_if_extractor_changes_its_mind() {
        // Extractor output depends on call count, not on the object.
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let func: IndexFn = Arc::new(move |_rec: &ObjectRecord| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            std::iter::once(format!("v{}", n)).collect()
        });
        let mut ix = Indexer::new();
        ix.add_index("flaky", func).unwrap();
        ix.upsert(&pod("p1", None, "1"));
        ix.upsert(&pod("p1", None, "2"));
        assert!(ix.lookup("flaky", "v0").unwrap().is_empty());
        assert_eq!(ix.lookup("flaky", "v1").unwrap().len(), 1);
        assert_eq!(ix.values_of("flaky", &ObjectKey::new("v1/Pod", "default", "p1")).unwrap(), ["v1".to_string()]);
    }

    #[test]
    fn clones_are_independent() {
        let mut ix = Indexer::with_owner_index();
        ix.upsert(&pod("p1", Some("rs-1"), "1"));
        let frozen = ix.clone();
        ix.upsert(&pod("p2", Some("rs-1"), "2"));
        ix.remove(&ObjectKey::new("v1/Pod", "default", "p1"));
        assert_eq!(frozen.lookup(OWNER_INDEX, &owner_index_value(&rs("rs-1"))).unwrap(), vec![ObjectKey::new("v1/Pod", "default", "p1")]);
        assert_eq!(ix.lookup(OWNER_INDEX, &owner_index_value(&rs("rs-1"))).unwrap(), vec![ObjectKey::new("v1/Pod", "default", "p2")]);
    }

    #[test]
    fn field_index_and_errors() {
        let mut ix = Indexer::new();
        ix.add_index("cm", field_index_fn("/spec/configMapRef/name")).unwrap();
        assert!(ix.add_index("cm", field_index_fn("/x")).unwrap_err().is_fatal());
        let rec = ObjectRecord::from_raw(
            "example.com/v1/Widget",
            serde_json::json!({ "metadata": { "name": "w", "namespace": "ns1" }, "spec": { "configMapRef": { "name": "cfg" } } }),
        )
        .unwrap();
        ix.upsert(&rec);
        assert_eq!(ix.lookup("cm", &namespaced_value("ns1", "cfg")).unwrap(), vec![rec.key.clone()]);
        assert_eq!(ix.lookup("missing", "x").unwrap_err().kind(), "mapping");
        ix.clear();
        assert!(ix.lookup("cm", &namespaced_value("ns1", "cfg")).unwrap().is_empty());
    }
}
