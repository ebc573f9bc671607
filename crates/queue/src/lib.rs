//! rekon queue: deduplicating, delay-capable work queue of object keys.
//!
//! A key is either pending (waiting for its readyAt), in flight (handed out by
//! [`WorkQueue::get`] and not yet [`WorkQueue::done`]), both, or absent. Pending entries
//! coalesce to the earliest readyAt, and a pending key is never handed out while the same
//! key is in flight.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rekon_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Longest delay the queue schedules; longer requeues and backoffs are clamped to it.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + delay`, with `delay` clamped to [`MAX_DELAY`].
pub fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now)
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max } }

    pub fn delay(&self, failures: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(failures)).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self { Self::new(Duration::from_millis(5), Duration::from_secs(1000)) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    ready_at: Instant,
    seq: u64,
}

struct State {
    pending: FxHashMap<ObjectKey, Pending>,
    // min-heap; entries whose seq no longer matches `pending` are stale and skipped
    heap: BinaryHeap<Reverse<(Instant, u64, ObjectKey)>>,
    in_flight: FxHashSet<ObjectKey>,
    failures: FxHashMap<ObjectKey, u32>,
    seq: u64,
    phase: Phase,
}

impl State {
    fn pop_ready(&mut self, now: Instant) -> Option<(ObjectKey, Instant)> {
        loop {
            let (at, live, busy) = match self.heap.peek() {
                None => return None,
                Some(Reverse((at, seq, key))) => (
                    *at,
                    self.pending.get(key).map(|p| p.seq == *seq).unwrap_or(false),
                    self.in_flight.contains(key),
                ),
            };
            if live && at > now { return None; }
            let Reverse((_, _, key)) = self.heap.pop()?;
            // in-flight keys are re-pushed by `done`
            if !live || busy { continue; }
            let p = self.pending.remove(&key)?;
            self.in_flight.insert(key.clone());
            return Some((key, p.ready_at));
        }
    }

    fn next_ready_at(&self) -> Option<Instant> { self.heap.peek().map(|Reverse((at, _, _))| *at) }
}

pub struct WorkQueue {
    name: String,
    backoff: Backoff,
    state: Mutex<State>,
    wake_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("name", &self.name).field("len", &self.len()).finish()
    }
}

impl WorkQueue {
    pub fn new(name: &str, backoff: Backoff) -> Self {
        let (wake_tx, _) = watch::channel(0u64);
        Self {
            name: name.to_string(),
            backoff,
            state: Mutex::new(State {
                pending: FxHashMap::default(),
                heap: BinaryHeap::new(),
                in_flight: FxHashSet::default(),
                failures: FxHashMap::default(),
                seq: 0,
                phase: Phase::Running,
            }),
            wake_tx,
        }
    }

    pub fn name(&self) -> &str { &self.name }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn wake(&self) { self.wake_tx.send_modify(|v| *v = v.wrapping_add(1)); }

    /// Enqueue `key` ready now.
    pub fn add(&self, key: ObjectKey) { self.add_after(key, Duration::ZERO); }

    /// Enqueue `key` ready after `delay`. An existing pending entry with an earlier
    /// readyAt wins; a later one is pulled forward.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        let depth = {
            let mut st = self.lock();
            if st.phase != Phase::Running { return; }
            let ready_at = deadline_after(delay);
            if let Some(p) = st.pending.get(&key) {
                if p.ready_at <= ready_at {
                    metrics::counter!("workqueue_coalesced_total", 1u64, "name" => self.name.clone());
                    return;
                }
            }
            st.seq = st.seq.wrapping_add(1);
            let seq = st.seq;
            st.pending.insert(key.clone(), Pending { ready_at, seq });
            st.heap.push(Reverse((ready_at, seq, key)));
            st.pending.len()
        };
        metrics::counter!("workqueue_adds_total", 1u64, "name" => self.name.clone());
        metrics::gauge!("workqueue_depth", depth as f64, "name" => self.name.clone());
        self.wake();
    }

    /// Requeue after the key's current backoff delay and bump its failure count.
    pub fn add_rate_limited(&self, key: ObjectKey) {
        let delay = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*n);
            *n = n.saturating_add(1);
            delay
        };
        debug!(queue = %self.name, key = %key, delay_ms = delay.as_millis() as u64, "queue: rate-limited requeue");
        metrics::counter!("workqueue_retries_total", 1u64, "name" => self.name.clone());
        self.add_after(key, delay);
    }

    /// Reset the key's backoff.
    pub fn forget(&self, key: &ObjectKey) { self.lock().failures.remove(key); }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    /// Wait for the next ready key not currently in flight. Returns `None` once the
    /// queue is shut down, or drained when shutting down with drain.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let (wait_until, mut wake_rx) = {
                let mut st = self.lock();
                if st.phase == Phase::Stopped { return None; }
                let now = Instant::now();
                if let Some((key, ready_at)) = st.pop_ready(now) {
                    let depth = st.pending.len();
                    drop(st);
                    metrics::histogram!("workqueue_queue_duration_seconds", now.saturating_duration_since(ready_at).as_secs_f64(), "name" => self.name.clone());
                    metrics::gauge!("workqueue_depth", depth as f64, "name" => self.name.clone());
                    return Some(key);
                }
                if st.phase == Phase::Draining { return None; }
                // subscribed under the lock: any add after this point wakes us
                (st.next_ready_at(), self.wake_tx.subscribe())
            };
            match wait_until {
                Some(at) => {
                    tokio::select! {
                        _ = wake_rx.changed() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => {
                    let _ = wake_rx.changed().await;
                }
            }
        }
    }

    /// Like [`WorkQueue::get`], but the returned lease calls `done` when dropped.
    pub async fn lease(&self) -> Option<Lease<'_>> {
        let key = self.get().await?;
        Some(Lease { queue: self, key, started: Instant::now() })
    }

    /// Release the in-flight marker taken by `get`. A follow-up added meanwhile becomes
    /// eligible again.
    pub fn done(&self, key: &ObjectKey) {
        let requeued = {
            let mut st = self.lock();
            st.in_flight.remove(key);
            match st.pending.get(key).copied() {
                Some(p) => {
                    st.heap.push(Reverse((p.ready_at, p.seq, key.clone())));
                    true
                }
                None => false,
            }
        };
        if requeued { self.wake(); }
    }

    /// Stop handing out keys immediately; further adds are ignored.
    pub fn shut_down(&self) {
        self.lock().phase = Phase::Stopped;
        debug!(queue = %self.name, "queue: shut down");
        self.wake();
    }

    /// Keep handing out keys that are already ready, then return `None`; further adds
    /// are ignored.
    pub fn shut_down_with_drain(&self) {
        {
            let mut st = self.lock();
            if st.phase == Phase::Running { st.phase = Phase::Draining; }
        }
        debug!(queue = %self.name, "queue: draining");
        self.wake();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().phase != Phase::Running }

    /// Number of pending keys (including follow-ups of in-flight keys).
    pub fn len(&self) -> usize { self.lock().pending.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn in_flight(&self) -> usize { self.lock().in_flight.len() }
    pub fn is_in_flight(&self, key: &ObjectKey) -> bool { self.lock().in_flight.contains(key) }
}

/// Scoped in-flight marker; dropping it calls [`WorkQueue::done`].
pub struct Lease<'a> {
    queue: &'a WorkQueue,
    key: ObjectKey,
    started: Instant,
}

impl Lease<'_> {
    pub fn key(&self) -> &ObjectKey { &self.key }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        metrics::histogram!("workqueue_work_duration_seconds", self.started.elapsed().as_secs_f64(), "name" => self.queue.name.clone());
        self.queue.done(&self.key);
    }
}
