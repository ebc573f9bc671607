//! Secondary event → primary keys.

use std::sync::Arc;

use rekon_core::{Error, LabelSelector, ObjectKey, ObjectRecord, Result};
use rekon_store::{KindCache, ResourceEvent};
use rustc_hash::FxHashSet;

/// Pure translation of one event into the primary keys it affects.
pub trait Mapper: Send + Sync {
    fn map(&self, event: &ResourceEvent) -> Result<Vec<ObjectKey>>;
}

/// Drop repeated keys, keeping first occurrences in order.
pub fn dedup_keys(keys: impl IntoIterator<Item = ObjectKey>) -> Vec<ObjectKey> {
    let mut seen = FxHashSet::default();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

/// New then old object for updates, the single object otherwise.
fn sides(event: &ResourceEvent) -> impl Iterator<Item = &ObjectRecord> {
    let (a, b) = match event {
        ResourceEvent::Updated { old, new } => (&**new, Some(&**old)),
        ResourceEvent::Added(o) | ResourceEvent::Deleted(o) => (&**o, None),
    };
    std::iter::once(a).chain(b)
}

/// Events of the primary kind itself map to their own key.
#[derive(Debug, Clone)]
pub struct SelfMapper {
    kind: String,
}

impl SelfMapper {
    pub fn new(kind: &str) -> Self { Self { kind: kind.to_string() } }
}

impl Mapper for SelfMapper {
    fn map(&self, event: &ResourceEvent) -> Result<Vec<ObjectKey>> {
        let key = event.key();
        Ok(if key.kind == self.kind { vec![key.clone()] } else { Vec::new() })
    }
}

/// Owner references of the triggering object, restricted to the primary kind. An update
/// maps to the owners of both versions so a re-parented child reaches both parents.
#[derive(Debug, Clone)]
pub struct OwnerMapper {
    primary: String,
}

impl OwnerMapper {
    pub fn new(primary: &str) -> Self { Self { primary: primary.to_string() } }
}

impl Mapper for OwnerMapper {
    fn map(&self, event: &ResourceEvent) -> Result<Vec<ObjectKey>> {
        Ok(dedup_keys(
            sides(event).flat_map(|o| o.owner_keys.iter()).filter(|k| k.kind == self.primary).cloned(),
        ))
    }
}

pub type Relation = Arc<dyn Fn(&ObjectRecord, &ObjectRecord) -> bool + Send + Sync>;
pub type IndexValueFn = Arc<dyn Fn(&ObjectRecord) -> Option<String> + Send + Sync>;

/// Primaries related to the triggering object by an arbitrary predicate.
///
/// Candidates come from the primary cache, narrowed through a named index when one is
/// configured, otherwise from a full list. Each candidate is then checked with
/// `relation(primary, secondary)`.
#[derive(Clone)]
pub struct PredicateMapper {
    primary: KindCache,
    index: Option<(String, IndexValueFn)>,
    relation: Relation,
}

impl std::fmt::Debug for PredicateMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateMapper")
            .field("primary", &self.primary.kind())
            .field("index", &self.index.as_ref().map(|(n, _)| n))
            .finish()
    }
}

impl PredicateMapper {
    pub fn new<F>(primary: KindCache, relation: F) -> Self
    where
        F: Fn(&ObjectRecord, &ObjectRecord) -> bool + Send + Sync + 'static,
    {
        Self { primary, index: None, relation: Arc::new(relation) }
    }

    /// Narrow candidates to primaries filed under `value(secondary)` in index `name`.
    pub fn via_index<F>(mut self, name: &str, value: F) -> Self
    where
        F: Fn(&ObjectRecord) -> Option<String> + Send + Sync + 'static,
    {
        self.index = Some((name.to_string(), Arc::new(value)));
        self
    }

    fn candidates(&self, secondary: &ObjectRecord) -> Result<Vec<ObjectRecord>> {
        match &self.index {
            Some((name, value)) => {
                if !self.primary.has_index(name) {
                    return Err(Error::Mapping(format!("index {} not registered on {}", name, self.primary.kind())));
                }
                match value(secondary) {
                    Some(v) => self.primary.by_index(name, &v),
                    None => Ok(Vec::new()),
                }
            }
            None => Ok(self.primary.list(None, &LabelSelector::everything())),
        }
    }
}

impl Mapper for PredicateMapper {
    fn map(&self, event: &ResourceEvent) -> Result<Vec<ObjectKey>> {
        let mut out = Vec::new();
        for secondary in sides(event) {
            for primary in self.candidates(secondary)? {
                if (self.relation)(&primary, secondary) { out.push(primary.key); }
            }
        }
        Ok(dedup_keys(out))
    }
}

/// Closure escape hatch.
pub struct FnMapper<F>(F);

impl<F> FnMapper<F>
where
    F: Fn(&ResourceEvent) -> Result<Vec<ObjectKey>> + Send + Sync,
{
    pub fn new(f: F) -> Self { Self(f) }
}

impl<F> Mapper for FnMapper<F>
where
    F: Fn(&ResourceEvent) -> Result<Vec<ObjectKey>> + Send + Sync,
{
    fn map(&self, event: &ResourceEvent) -> Result<Vec<ObjectKey>> { Ok(dedup_keys((self.0)(event)?)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, rv: &str, owners: &[&str]) -> Arc<ObjectRecord> {
        let refs: Vec<_> = owners
            .iter()
            .map(|o| serde_json::json!({ "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": o }))
            .collect();
        let raw = serde_json::json!({
            "metadata": { "name": name, "namespace": "default", "resourceVersion": rv, "ownerReferences": refs }
        });
        Arc::new(ObjectRecord::from_raw("v1/Pod", raw).unwrap())
    }

    fn rs(name: &str) -> ObjectKey { ObjectKey::new("apps/v1/ReplicaSet", "default", name) }

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let out = dedup_keys(vec![rs("b"), rs("a"), rs("b"), rs("c"), rs("a")]);
        assert_eq!(out, vec![rs("b"), rs("a"), rs("c")]);
    }

    #[test]
    fn owner_mapper_unions_old_and_new_owners() {
        let m = OwnerMapper::new("apps/v1/ReplicaSet");
        let ev = ResourceEvent::Updated { old: pod("p", "1", &["rs-1"]), new: pod("p", "2", &["rs-2", "rs-1"]) };
        assert_eq!(m.map(&ev).unwrap(), vec![rs("rs-2"), rs("rs-1")]);
        assert!(OwnerMapper::new("apps/v1/Deployment").map(&ev).unwrap().is_empty());
    }

    #[test]
    fn self_mapper_filters_kind() {
        let ev = ResourceEvent::Added(pod("p", "1", &[]));
        assert_eq!(SelfMapper::new("v1/Pod").map(&ev).unwrap().len(), 1);
        assert!(SelfMapper::new("apps/v1/ReplicaSet").map(&ev).unwrap().is_empty());
    }

    #[test]
    fn fn_mapper_dedups_and_propagates_errors() {
        let m = FnMapper::new(|_ev: &ResourceEvent| Ok(vec![rs("a"), rs("a")]));
        assert_eq!(m.map(&ResourceEvent::Added(pod("p", "1", &[]))).unwrap(), vec![rs("a")]);
        let bad = FnMapper::new(|_ev: &ResourceEvent| Err(Error::Mapping("boom".into())));
        assert_eq!(bad.map(&ResourceEvent::Added(pod("p", "1", &[]))).unwrap_err().kind(), "mapping");
    }
}
