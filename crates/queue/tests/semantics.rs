#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use rekon_core::ObjectKey;
use rekon_queue::{Backoff, WorkQueue};
use tokio::time::Instant;

fn key(name: &str) -> ObjectKey { ObjectKey::new("apps/v1/ReplicaSet", "default", name) }

fn queue() -> WorkQueue { WorkQueue::new("test", Backoff::new(Duration::from_millis(5), Duration::from_secs(1))) }

#[tokio::test(start_paused = true)]
async fn overlapping_delays_coalesce_to_earliest() {
    let q = queue();
    let start = Instant::now();
    q.add_after(key("rs-1"), Duration::from_secs(10));
    q.add_after(key("rs-1"), Duration::from_secs(5));
    q.add_after(key("rs-1"), Duration::from_secs(20));
    assert_eq!(q.len(), 1);

    let got = q.get().await.unwrap();
    assert_eq!(got, key("rs-1"));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(10), "waited {:?}", waited);
    assert!(q.is_empty());
    q.done(&got);

    // nothing left: the 10s and 20s requests were folded into the 5s one
    assert!(tokio::time::timeout(Duration::from_secs(60), q.get()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn immediate_add_pulls_delayed_entry_forward() {
    let q = queue();
    let start = Instant::now();
    q.add_after(key("rs-1"), Duration::from_secs(30));
    q.add(key("rs-1"));
    assert_eq!(q.get().await.unwrap(), key("rs-1"));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn add_while_in_flight_is_deferred_until_done() {
    let q = queue();
    q.add(key("rs-1"));
    let k = q.get().await.unwrap();
    assert!(q.is_in_flight(&k));

    q.add(key("rs-1"));
    q.add(key("rs-1"));
    q.add(key("rs-1"));
    assert_eq!(q.len(), 1, "follow-ups collapse into one pending item");
    assert!(tokio::time::timeout(Duration::from_secs(5), q.get()).await.is_err(), "same key must not be handed out twice");

    q.done(&k);
    assert_eq!(q.get().await.unwrap(), key("rs-1"));
    assert!(q.is_empty());
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_are_handed_out_concurrently() {
    let q = queue();
    q.add(key("a"));
    q.add(key("b"));
    let first = q.get().await.unwrap();
    let second = q.get().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(q.in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn waiting_getter_wakes_on_add() {
    let q = Arc::new(queue());
    let waiter = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    q.add(key("late"));
    assert_eq!(waiter.await.unwrap(), Some(key("late")));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_backs_off_exponentially_until_forgotten() {
    let q = queue();
    let k = key("flaky");
    for expected in [5u64, 10, 20] {
        let start = Instant::now();
        q.add_rate_limited(k.clone());
        let got = q.get().await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(expected) && waited < Duration::from_millis(expected + 3), "waited {:?}", waited);
        q.done(&got);
    }
    assert_eq!(q.num_requeues(&k), 3);
    q.forget(&k);
    assert_eq!(q.num_requeues(&k), 0);
}

#[tokio::test(start_paused = true)]
async fn lease_releases_on_drop() {
    let q = queue();
    q.add(key("rs-1"));
    {
        let lease = q.lease().await.unwrap();
        assert_eq!(lease.key(), &key("rs-1"));
        q.add(key("rs-1"));
        assert!(q.is_in_flight(&key("rs-1")));
    }
    assert!(!q.is_in_flight(&key("rs-1")));
    assert_eq!(q.get().await.unwrap(), key("rs-1"));
}

#[tokio::test(start_paused = true)]
async fn shut_down_stops_getters_and_ignores_adds() {
    let q = Arc::new(queue());
    let waiter = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    q.shut_down();
    assert_eq!(waiter.await.unwrap(), None);
    q.add(key("ignored"));
    assert!(q.is_empty());
    assert!(q.get().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn drain_hands_out_ready_items_then_stops() {
    let q = queue();
    q.add(key("a"));
    q.add(key("b"));
    q.add_after(key("later"), Duration::from_secs(60));
    q.shut_down_with_drain();
    q.add(key("ignored"));
    let mut drained = vec![q.get().await.unwrap(), q.get().await.unwrap()];
    drained.sort();
    assert_eq!(drained, vec![key("a"), key("b")]);
    assert!(q.get().await.is_none());
    assert!(q.is_shutting_down());
}
