//! Owns caches, queues and controllers for the lifetime of one `run`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rekon_core::{ControllerConfig, Error, ObjectStore, Result, WatchFeed};
use rekon_index::{IndexFn, Indexer};
use rekon_queue::{deadline_after, Backoff, WorkQueue, MAX_DELAY};
use rekon_store::{Informer, KindCache, ObjectCache, ResourceEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{announce, Workers};
use crate::{Client, Health, Mapper, RegisteredController};

pub struct Manager {
    store: Arc<dyn ObjectStore>,
    feed: Arc<dyn WatchFeed>,
    config: ControllerConfig,
    informers: BTreeMap<String, Informer>,
    caches: ObjectCache,
    controllers: Vec<RegisteredController>,
    ready_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("kinds", &self.informers.keys().collect::<Vec<_>>())
            .field("controllers", &self.controllers)
            .finish()
    }
}

impl Manager {
    pub fn new(store: Arc<dyn ObjectStore>, feed: Arc<dyn WatchFeed>, config: ControllerConfig) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            store,
            feed,
            config,
            informers: BTreeMap::new(),
            caches: ObjectCache::new(),
            controllers: Vec::new(),
            ready_tx,
        }
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    /// Read handle for `kind`, creating its informer on first use. The cache fills once
    /// [`Manager::run`] starts.
    pub fn cache_for(&mut self, kind: &str) -> KindCache {
        if let Some(c) = self.caches.kind(kind) { return c.clone(); }
        let (informer, cache) =
            Informer::new(kind, Arc::clone(&self.feed), Indexer::with_owner_index(), self.config.watch_backoff_max);
        self.informers.insert(kind.to_string(), informer);
        self.caches.insert(cache.clone());
        debug!(kind = %kind, "manager: cache created");
        cache
    }

    /// Register a secondary index on `kind`'s cache.
    pub fn add_index(&mut self, kind: &str, name: &str, func: IndexFn) -> Result<()> {
        self.cache_for(kind);
        match self.informers.get_mut(kind) {
            Some(informer) => informer.add_index(name, func),
            None => Err(Error::FatalConfig(format!("index {} added to {} after start", name, kind))),
        }
    }

    pub fn add_controller(&mut self, controller: RegisteredController) -> Result<()> {
        if self.controllers.iter().any(|c| c.name == controller.name) {
            return Err(Error::FatalConfig(format!("controller {} registered twice", controller.name)));
        }
        let kinds: Vec<String> = controller.watched_kinds().map(|k| k.to_string()).collect();
        for kind in kinds.iter() { self.cache_for(kind); }
        self.controllers.push(controller);
        Ok(())
    }

    /// Client over every cache registered so far.
    pub fn client(&self) -> Client { Client::new(self.caches.clone(), Arc::clone(&self.store)) }

    pub fn health(&self) -> Health { Health { ready: self.ready_tx.subscribe() } }

    /// Run until `shutdown` is cancelled.
    ///
    /// Caches are seeded before any worker starts. On shutdown the queues stop
    /// accepting work and hand out only what is already ready; in-flight reconciles get
    /// `shutdown_grace` to finish before they are cancelled and aborted.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let client = self.client();
        let hard_stop = CancellationToken::new();
        let informer_stop = CancellationToken::new();
        let mut background: Vec<JoinHandle<()>> = Vec::new();
        let mut queues: Vec<Arc<WorkQueue>> = Vec::new();
        let mut pools: Vec<(Arc<Workers>, usize)> = Vec::new();

        for c in std::mem::take(&mut self.controllers) {
            let workers = c.workers.unwrap_or(self.config.workers).max(1);
            announce(&c, workers);
            let queue = Arc::new(WorkQueue::new(&c.name, Backoff::new(self.config.backoff_base, self.config.backoff_max)));
            for (kind, mapper) in c.sources.iter() {
                let informer = self
                    .informers
                    .get_mut(kind)
                    .ok_or_else(|| Error::FatalConfig(format!("controller {}: no informer for {}", c.name, kind)))?;
                let (tx, rx) = mpsc::channel(self.config.event_capacity.max(1));
                informer.add_sink(tx);
                background.push(tokio::spawn(pump(
                    c.name.clone(),
                    kind.clone(),
                    Arc::clone(mapper),
                    rx,
                    Arc::clone(&queue),
                    shutdown.clone(),
                )));
            }
            let primary = self
                .caches
                .kind(&c.primary)
                .cloned()
                .ok_or_else(|| Error::FatalConfig(format!("controller {}: no cache for {}", c.name, c.primary)))?;
            background.push(tokio::spawn(resync(
                c.name.clone(),
                primary,
                Arc::clone(&queue),
                self.config.resync_interval,
                shutdown.clone(),
            )));
            pools.push((
                Arc::new(Workers {
                    name: Arc::from(c.name.as_str()),
                    primary: Arc::from(c.primary.as_str()),
                    queue: Arc::clone(&queue),
                    reconciler: Arc::clone(&c.reconciler),
                    client: client.clone(),
                    config: self.config.clone(),
                    hard_stop: hard_stop.clone(),
                }),
                workers,
            ));
            queues.push(queue);
        }

        let caches: Vec<KindCache> = self.caches.kinds().filter_map(|k| self.caches.kind(k).cloned()).collect();
        let informers: Vec<JoinHandle<()>> = std::mem::take(&mut self.informers)
            .into_values()
            .map(|i| i.spawn(informer_stop.clone()))
            .collect();
        info!(kinds = informers.len(), controllers = pools.len(), "manager: started; waiting for cache sync");

        let synced = tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = futures::future::join_all(caches.iter().map(|c| c.wait_synced())) => true,
        };

        let mut worker_handles: Vec<JoinHandle<()>> = Vec::new();
        if synced {
            self.ready_tx.send_replace(true);
            info!("manager: caches synced; starting workers");
            for (pool, n) in pools.iter() {
                for id in 0..*n {
                    worker_handles.push(tokio::spawn(Arc::clone(pool).run(id)));
                }
            }
            shutdown.cancelled().await;
        }

        info!("manager: shutting down");
        self.ready_tx.send_replace(false);
        for q in queues.iter() { q.shut_down_with_drain(); }
        let grace = self.config.shutdown_grace;
        let finished = tokio::time::timeout(grace, futures::future::join_all(worker_handles.iter_mut())).await.is_ok();
        if !finished {
            warn!(grace_secs = grace.as_secs_f64(), "manager: grace period over; aborting in-flight reconciles");
            hard_stop.cancel();
            for h in worker_handles.iter() { h.abort(); }
        }
        for q in queues.iter() { q.shut_down(); }
        informer_stop.cancel();
        futures::future::join_all(informers).await;
        futures::future::join_all(background).await;
        info!("manager: stopped");
        Ok(())
    }
}

/// Feed one kind's events through a mapper into a controller's queue.
async fn pump(
    controller: String,
    kind: String,
    mapper: Arc<dyn Mapper>,
    mut rx: mpsc::Receiver<ResourceEvent>,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
) {
    loop {
        let ev = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        match mapper.map(&ev) {
            Ok(keys) => {
                for key in keys { queue.add(key); }
            }
            Err(e) => {
                warn!(controller = %controller, kind = %kind, key = %ev.key(), error = %e, "controller: mapping failed; event dropped");
                metrics::counter!("mapping_failures_total", 1u64, "controller" => controller.clone(), "kind" => kind.clone());
            }
        }
    }
    debug!(controller = %controller, kind = %kind, "controller: event pump stopped");
}

/// Re-enqueue every primary key each `every`. A zero interval disables resync.
async fn resync(controller: String, cache: KindCache, queue: Arc<WorkQueue>, every: Duration, shutdown: CancellationToken) {
    if every.is_zero() { return; }
    let every = every.min(MAX_DELAY);
    let mut tick = tokio::time::interval_at(deadline_after(every), every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let keys = cache.keys();
                debug!(controller = %controller, keys = keys.len(), "controller: resync");
                metrics::counter!("resync_total", 1u64, "controller" => controller.clone());
                for key in keys { queue.add(key); }
            }
        }
    }
}
