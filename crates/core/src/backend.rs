//! Capabilities consumed from the backing object store.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{LabelSelector, ObjectKey, ObjectRecord, ResourceVersion, Result, WatchEvent};

/// Full list of one kind plus the cursor to start watching from.
#[derive(Debug, Clone, Default)]
pub struct ListSnapshot {
    pub items: Vec<ObjectRecord>,
    pub resource_version: ResourceVersion,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Source of list snapshots and ordered per-kind change notifications.
#[async_trait]
pub trait WatchFeed: Send + Sync {
    async fn list(&self, kind: &str) -> Result<ListSnapshot>;

    /// Stream changes strictly after `since`. Returns [`crate::Error::Expired`] when the
    /// cursor can no longer be resumed from, either immediately or as a stream item.
    async fn watch(&self, kind: &str, since: &ResourceVersion) -> Result<WatchStream>;
}

/// Read/write access to the backing store.
///
/// `update` is optimistic: the record's `resource_version` must match the stored one,
/// otherwise the call fails with [`crate::Error::Conflict`] and nothing is written.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<ObjectRecord>;
    async fn list(&self, kind: &str, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<ObjectRecord>>;
    async fn create(&self, object: ObjectRecord) -> Result<ObjectRecord>;
    async fn update(&self, object: ObjectRecord) -> Result<ObjectRecord>;
    /// `expected` adds a resourceVersion precondition to the delete.
    async fn delete(&self, key: &ObjectKey, expected: Option<&ResourceVersion>) -> Result<()>;
}
