//! Cache-first reads, conflict-checked writes.

use std::future::Future;
use std::sync::Arc;

use rekon_core::{Error, LabelSelector, ObjectKey, ObjectRecord, ObjectStore, ResourceVersion, Result};
use rekon_store::ObjectCache;
use tokio::time::Instant;
use tracing::debug;

/// Accessor handed to reconcilers.
///
/// Reads of cached kinds are served from the local snapshot; everything else, and all
/// writes, go to the store. A scoped client bounds every store call by its deadline.
#[derive(Clone)]
pub struct Client {
    caches: ObjectCache,
    store: Arc<dyn ObjectStore>,
    deadline: Option<Instant>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("caches", &self.caches).field("deadline", &self.deadline).finish()
    }
}

impl Client {
    pub fn new(caches: ObjectCache, store: Arc<dyn ObjectStore>) -> Self { Self { caches, store, deadline: None } }

    /// Copy of this client whose store calls fail with `Transient` after `deadline`.
    pub fn scoped(&self, deadline: Instant) -> Self { Self { deadline: Some(deadline), ..self.clone() } }

    pub fn caches(&self) -> &ObjectCache { &self.caches }

    async fn bounded<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.deadline {
            None => fut.await,
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| Error::Transient(format!("{} exceeded the reconcile deadline", op)))?,
        }
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<ObjectRecord> {
        match self.caches.get(key) {
            Some(Some(rec)) => Ok(rec),
            Some(None) => Err(Error::NotFound(key.clone())),
            None => self.get_fresh(key).await,
        }
    }

    /// Read straight from the store, bypassing the cache.
    pub async fn get_fresh(&self, key: &ObjectKey) -> Result<ObjectRecord> {
        self.bounded("get", self.store.get(key)).await
    }

    pub async fn list(&self, kind: &str, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<ObjectRecord>> {
        match self.caches.list(kind, namespace, selector) {
            Some(items) => Ok(items),
            None => {
                let mut items = self.bounded("list", self.store.list(kind, namespace, selector)).await?;
                items.sort_unstable_by(|a, b| a.key.cmp(&b.key));
                Ok(items)
            }
        }
    }

    pub async fn create(&self, object: ObjectRecord) -> Result<ObjectRecord> {
        self.bounded("create", self.store.create(object)).await
    }

    /// Submit `object` with the resourceVersion it was read at.
    pub async fn update(&self, object: ObjectRecord) -> Result<ObjectRecord> {
        self.bounded("update", self.store.update(object)).await
    }

    pub async fn delete(&self, key: &ObjectKey, expected: Option<&ResourceVersion>) -> Result<()> {
        self.bounded("delete", self.store.delete(key, expected)).await
    }

    /// Read, mutate and write back, re-reading from the store on each conflict.
    ///
    /// `mutate` returns whether it changed anything; when it did not, nothing is
    /// written and the read version is returned.
    pub async fn update_with_retry<F>(&self, key: &ObjectKey, attempts: u32, mut mutate: F) -> Result<ObjectRecord>
    where
        F: FnMut(&mut ObjectRecord) -> bool + Send,
    {
        let mut current = self.get(key).await?;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !mutate(&mut current) { return Ok(current); }
            match self.update(current).await {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_conflict() && attempt < attempts.max(1) => {
                    debug!(key = %key, attempt, "client: conflict; re-reading");
                    metrics::counter!("client_conflicts_total", 1u64, "kind" => key.kind.clone());
                    current = self.get_fresh(key).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
