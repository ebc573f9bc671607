use std::time::Duration;

use rekon_core::{ObjectKey, ObjectRecord, WatchEvent};
use rekon_queue::{Backoff, WorkQueue};
use rekon_runtime::{Mapper, OwnerMapper};
use rekon_store::CacheBuilder;

fn pod(rv: &str, phase: &str) -> ObjectRecord {
    ObjectRecord::from_raw(
        "v1/Pod",
        serde_json::json!({
            "metadata": {
                "name": "rs-1-abcde",
                "namespace": "default",
                "resourceVersion": rv,
                "ownerReferences": [{ "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "rs-1" }]
            },
            "status": { "phase": phase }
        }),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn rapid_owned_pod_updates_collapse_to_one_queue_entry() {
    let mut cache = CacheBuilder::new("v1/Pod");
    let mapper = OwnerMapper::new("apps/v1/ReplicaSet");
    let queue = WorkQueue::new("replicaset", Backoff::default());

    cache.apply(WatchEvent::Added(pod("1", "Pending")));
    for (rv, phase) in [("2", "ContainerCreating"), ("3", "Running"), ("4", "Running")] {
        let ev = cache.apply(WatchEvent::Updated(pod(rv, phase))).expect("newer version applies");
        for key in mapper.map(&ev).unwrap() { queue.add(key); }
    }

    assert_eq!(queue.len(), 1);
    let rs1 = ObjectKey::new("apps/v1/ReplicaSet", "default", "rs-1");
    assert_eq!(queue.get().await, Some(rs1.clone()));
    queue.done(&rs1);
    assert!(tokio::time::timeout(Duration::from_secs(1), queue.get()).await.is_err());
}
