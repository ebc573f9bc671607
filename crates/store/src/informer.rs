//! List-then-watch loop for one kind: seeds the cache, applies notifications in
//! delivery order and fans the resulting events out to registered sinks.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use rekon_core::{Error, ResourceVersion, WatchFeed};
use rekon_index::{IndexFn, Indexer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{cache_pair, CacheBuilder, CacheWriter, KindCache, ResourceEvent};

pub type EventSink = mpsc::Sender<ResourceEvent>;

/// Upper bound of notifications applied per published snapshot.
const MAX_BATCH: usize = 256;
const BACKOFF_START: Duration = Duration::from_millis(100);

struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    fn new(max: Duration) -> Self { Self { next: BACKOFF_START.min(max), max } }
    fn reset(&mut self) { self.next = BACKOFF_START.min(self.max); }
    fn step(&mut self) -> Duration {
        let cur = self.next;
        self.next = (self.next * 2).min(self.max);
        cur
    }
}

pub struct Informer {
    kind: String,
    feed: Arc<dyn WatchFeed>,
    writer: CacheWriter,
    sinks: Vec<EventSink>,
    backoff: Backoff,
}

impl Informer {
    /// Create an informer and the read handle of the cache it maintains. Nothing runs
    /// until [`Informer::spawn`].
    pub fn new(kind: &str, feed: Arc<dyn WatchFeed>, indexer: Indexer, watch_backoff_max: Duration) -> (Self, KindCache) {
        let (writer, reader) = cache_pair(CacheBuilder::with_indexer(kind, indexer));
        let me = Self {
            kind: kind.to_string(),
            feed,
            writer,
            sinks: Vec::new(),
            backoff: Backoff::new(watch_backoff_max),
        };
        (me, reader)
    }

    pub fn kind(&self) -> &str { &self.kind }

    /// Register a secondary index. Only valid before [`Informer::spawn`]; the first
    /// published snapshot carries it.
    pub fn add_index(&mut self, name: &str, func: IndexFn) -> rekon_core::Result<()> {
        self.writer.builder.index.add_index(name, func)
    }

    /// Register an event consumer. Sinks whose receiver is gone are dropped silently.
    pub fn add_sink(&mut self, sink: EventSink) { self.sinks.push(sink); }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> { tokio::spawn(self.run(shutdown)) }

    async fn run(mut self, shutdown: CancellationToken) {
        info!(kind = %self.kind, "informer: started");
        let mut cursor: Option<ResourceVersion> = None;
        'outer: loop {
            if cursor.is_none() {
                let listed = tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    r = self.feed.list(&self.kind) => r,
                };
                match listed {
                    Ok(snap) => {
                        let count = snap.items.len();
                        let events = self.writer.builder.replace(snap.items);
                        let first_sync = !self.writer.builder.is_synced();
                        self.writer.builder.mark_synced();
                        self.writer.publish();
                        if first_sync {
                            metrics::gauge!("cache_synced", 1.0, "kind" => self.kind.clone());
                            info!(kind = %self.kind, count, rv = %snap.resource_version, "informer: initial list synced");
                        } else {
                            info!(kind = %self.kind, count, rv = %snap.resource_version, "informer: relisted");
                        }
                        if !self.dispatch(events, &shutdown).await { break 'outer; }
                        cursor = Some(snap.resource_version);
                        self.backoff.reset();
                    }
                    Err(e) => {
                        warn!(kind = %self.kind, error = %e, "informer: list failed");
                        if !self.pause(&shutdown).await { break 'outer; }
                        continue 'outer;
                    }
                }
            }

            let since = cursor.clone().unwrap_or_default();
            let opened = tokio::select! {
                _ = shutdown.cancelled() => break 'outer,
                r = self.feed.watch(&self.kind, &since) => r,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(Error::Expired(msg)) => {
                    info!(kind = %self.kind, since = %since, reason = %msg, "informer: cursor expired; relisting");
                    cursor = None;
                    continue 'outer;
                }
                Err(e) => {
                    warn!(kind = %self.kind, since = %since, error = %e, "informer: watch failed");
                    if !self.pause(&shutdown).await { break 'outer; }
                    continue 'outer;
                }
            };
            debug!(kind = %self.kind, since = %since, "informer: watching");

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    n = stream.next() => Some(n),
                };
                let Some(next) = next else { break 'outer };
                let Some(first) = next else {
                    debug!(kind = %self.kind, "informer: watch stream ended; resuming");
                    continue 'outer;
                };

                let mut batch = vec![first];
                while batch.len() < MAX_BATCH {
                    match stream.next().now_or_never() {
                        Some(Some(item)) => batch.push(item),
                        _ => break,
                    }
                }

                let mut events = Vec::with_capacity(batch.len());
                let mut failure = None;
                for item in batch {
                    match item {
                        Ok(ev) => {
                            if !ev.resource_version().is_empty() { cursor = Some(ev.resource_version().clone()); }
                            if let Some(out) = self.writer.builder.apply(ev) { events.push(out); }
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                if !events.is_empty() {
                    self.writer.publish();
                    if !self.dispatch(events, &shutdown).await { break 'outer; }
                }
                match failure {
                    None => self.backoff.reset(),
                    Some(Error::Expired(msg)) => {
                        info!(kind = %self.kind, reason = %msg, "informer: watch expired mid-stream; relisting");
                        cursor = None;
                        continue 'outer;
                    }
                    Some(e) => {
                        warn!(kind = %self.kind, error = %e, "informer: watch stream error; resuming from cursor");
                        if !self.pause(&shutdown).await { break 'outer; }
                        continue 'outer;
                    }
                }
            }
        }
        metrics::gauge!("cache_synced", 0.0, "kind" => self.kind.clone());
        info!(kind = %self.kind, "informer: stopped");
    }

    /// Deliver events to every sink in order. Returns false on shutdown.
    async fn dispatch(&mut self, events: Vec<ResourceEvent>, shutdown: &CancellationToken) -> bool {
        if self.sinks.is_empty() { return true; }
        for ev in events {
            let mut closed = Vec::new();
            for (i, sink) in self.sinks.iter().enumerate() {
                let sent = tokio::select! {
                    _ = shutdown.cancelled() => return false,
                    r = sink.send(ev.clone()) => r,
                };
                if sent.is_err() { closed.push(i); }
            }
            for i in closed.into_iter().rev() {
                debug!(kind = %self.kind, "informer: sink closed; removing");
                self.sinks.remove(i);
            }
        }
        true
    }

    async fn pause(&mut self, shutdown: &CancellationToken) -> bool {
        let d = self.backoff.step();
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }
}
