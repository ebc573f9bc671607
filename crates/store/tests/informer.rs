use std::sync::Arc;
use std::time::Duration;

use rekon_core::{LabelSelector, ObjectKey, ObjectRecord, WatchFeed};
use rekon_index::Indexer;
use rekon_memstore::MemoryStore;
use rekon_store::{Informer, ResourceEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn pod(name: &str, owner: Option<&str>) -> ObjectRecord {
    let mut meta = serde_json::json!({ "name": name, "namespace": "default" });
    if let Some(o) = owner {
        meta["ownerReferences"] = serde_json::json!([{ "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": o }]);
    }
    ObjectRecord::from_raw("v1/Pod", serde_json::json!({ "metadata": meta })).unwrap()
}

async fn recv(rx: &mut mpsc::Receiver<ResourceEvent>) -> ResourceEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("event in time").expect("sink open")
}

#[tokio::test]
async fn seeds_syncs_and_follows_changes() {
    let store = Arc::new(MemoryStore::new());
    store.insert(pod("p1", Some("rs-1"))).unwrap();
    let feed: Arc<dyn WatchFeed> = store.clone();
    let (mut informer, cache) = Informer::new("v1/Pod", feed, Indexer::with_owner_index(), Duration::from_secs(1));
    let (tx, mut rx) = mpsc::channel(16);
    informer.add_sink(tx);
    let shutdown = CancellationToken::new();
    let handle = informer.spawn(shutdown.clone());

    assert!(cache.wait_synced().await);
    assert!(matches!(recv(&mut rx).await, ResourceEvent::Added(o) if o.key.name == "p1"));
    assert_eq!(cache.len(), 1);

    let p2 = store.insert(pod("p2", Some("rs-1"))).unwrap();
    assert!(matches!(recv(&mut rx).await, ResourceEvent::Added(o) if o.key == p2.key));
    let rs1 = ObjectKey::new("apps/v1/ReplicaSet", "default", "rs-1");
    let children = cache.by_index(rekon_index::OWNER_INDEX, &rekon_index::owner_index_value(&rs1)).unwrap();
    assert_eq!(children.len(), 2);

    let mut relabeled = p2.clone();
    relabeled.set_label("tier", "web");
    store.replace(relabeled).unwrap();
    match recv(&mut rx).await {
        ResourceEvent::Updated { old, new } => {
            assert!(old.label("tier").is_none());
            assert_eq!(new.label("tier"), Some("web"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(cache.list(None, &LabelSelector::everything().with("tier", "web")).len(), 1);

    store.remove(&p2.key, None).unwrap();
    assert!(matches!(recv(&mut rx).await, ResourceEvent::Deleted(o) if o.key == p2.key));
    assert!(cache.get(&p2.key).is_none());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn relists_when_cursor_expires_and_reports_vanished_objects() {
    let store = Arc::new(MemoryStore::with_history(4));
    let keep = store.insert(pod("keep", None)).unwrap();
    let gone = store.insert(pod("gone", None)).unwrap();
    let feed: Arc<dyn WatchFeed> = store.clone();
    let (mut informer, cache) = Informer::new("v1/Pod", feed, Indexer::with_owner_index(), Duration::from_millis(200));
    let (tx, mut rx) = mpsc::channel(64);
    informer.add_sink(tx);
    let shutdown = CancellationToken::new();
    let handle = informer.spawn(shutdown.clone());
    assert!(cache.wait_synced().await);
    recv(&mut rx).await;
    recv(&mut rx).await;

    // The delete happens while the informer is told its stream expired, and the history
    // that would have replayed it is compacted away.
    store.expire_watchers();
    store.remove(&gone.key, None).unwrap();
    store.compact();

    let mut saw_deleted = false;
    for _ in 0..16 {
        match recv(&mut rx).await {
            ResourceEvent::Deleted(o) if o.key == gone.key => {
                saw_deleted = true;
                break;
            }
            // relists re-deliver whatever they find
            ResourceEvent::Added(o) => assert!(o.key == keep.key || o.key == gone.key),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(saw_deleted);
    assert_eq!(cache.keys(), vec![keep.key.clone()]);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn recovers_from_list_failures_and_dropped_watches() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next_lists(2);
    let feed: Arc<dyn WatchFeed> = store.clone();
    let (mut informer, cache) = Informer::new("v1/Pod", feed, Indexer::with_owner_index(), Duration::from_millis(200));
    let (tx, mut rx) = mpsc::channel(16);
    informer.add_sink(tx);
    let shutdown = CancellationToken::new();
    let handle = informer.spawn(shutdown.clone());
    assert!(tokio::time::timeout(Duration::from_secs(5), cache.wait_synced()).await.unwrap());
    assert!(cache.is_empty());

    store.disconnect_watchers();
    store.fail_next_watches(1);
    let p = store.insert(pod("after-drop", None)).unwrap();
    assert!(matches!(recv(&mut rx).await, ResourceEvent::Added(o) if o.key == p.key));
    assert_eq!(cache.len(), 1);

    shutdown.cancel();
    handle.await.unwrap();
}
