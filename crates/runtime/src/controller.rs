//! Controller registration and the per-key worker loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rekon_core::{ControllerConfig, Error, ObjectKey, ReconcileRequest, ReconcileResult, Result};
use rekon_queue::{deadline_after, WorkQueue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Client, Mapper, OwnerMapper, ReconcileContext, Reconciler, SelfMapper};

/// Builder for one controller: a primary kind, the kinds that trigger it and the
/// reconciler that drives it.
pub struct Controller {
    name: String,
    primary: String,
    workers: Option<usize>,
    sources: Vec<(String, Arc<dyn Mapper>)>,
}

impl Controller {
    pub fn new(name: &str, primary: &str) -> Self {
        Self { name: name.to_string(), primary: primary.to_string(), workers: None, sources: Vec::new() }
    }

    /// Trigger on objects of `kind` whose owner references point at a primary.
    pub fn owns(mut self, kind: &str) -> Self {
        let mapper = Arc::new(OwnerMapper::new(&self.primary));
        self.sources.push((kind.to_string(), mapper));
        self
    }

    /// Trigger on objects of `kind` through an arbitrary mapper.
    pub fn watches(mut self, kind: &str, mapper: impl Mapper + 'static) -> Self {
        self.sources.push((kind.to_string(), Arc::new(mapper)));
        self
    }

    /// Override the configured worker count for this controller.
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = Some(n);
        self
    }

    pub fn complete(self, reconciler: impl Reconciler) -> Result<RegisteredController> {
        if self.name.is_empty() { return Err(Error::FatalConfig("controller name is empty".into())); }
        if self.primary.is_empty() {
            return Err(Error::FatalConfig(format!("controller {}: primary kind is empty", self.name)));
        }
        if self.workers == Some(0) {
            return Err(Error::FatalConfig(format!("controller {}: zero workers", self.name)));
        }
        let mut sources: Vec<(String, Arc<dyn Mapper>)> = vec![(self.primary.clone(), Arc::new(SelfMapper::new(&self.primary)))];
        for (kind, mapper) in self.sources {
            if kind.is_empty() {
                return Err(Error::FatalConfig(format!("controller {}: empty watched kind", self.name)));
            }
            if sources.iter().any(|(k, _)| *k == kind) {
                return Err(Error::FatalConfig(format!("controller {}: kind {} registered twice", self.name, kind)));
            }
            sources.push((kind, mapper));
        }
        Ok(RegisteredController {
            name: self.name,
            primary: self.primary,
            workers: self.workers,
            sources,
            reconciler: Arc::new(reconciler),
        })
    }
}

/// A validated controller, ready to be added to a [`crate::Manager`].
pub struct RegisteredController {
    pub(crate) name: String,
    pub(crate) primary: String,
    pub(crate) workers: Option<usize>,
    pub(crate) sources: Vec<(String, Arc<dyn Mapper>)>,
    pub(crate) reconciler: Arc<dyn Reconciler>,
}

impl RegisteredController {
    pub fn name(&self) -> &str { &self.name }
    pub fn primary(&self) -> &str { &self.primary }
    pub fn watched_kinds(&self) -> impl Iterator<Item = &str> { self.sources.iter().map(|(k, _)| k.as_str()) }
}

impl std::fmt::Debug for RegisteredController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredController")
            .field("name", &self.name)
            .field("primary", &self.primary)
            .field("kinds", &self.watched_kinds().collect::<Vec<_>>())
            .finish()
    }
}

/// What the worker does with the queue entry after a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Done,
    Requeue(Duration),
    Failed,
}

/// Everything one controller's workers share.
pub(crate) struct Workers {
    pub name: Arc<str>,
    pub primary: Arc<str>,
    pub queue: Arc<WorkQueue>,
    pub reconciler: Arc<dyn Reconciler>,
    pub client: Client,
    pub config: ControllerConfig,
    /// Cancelled once the shutdown grace period is over.
    pub hard_stop: CancellationToken,
}

/// Label for an error returned by a reconciler: the taxonomy kind when one is in the
/// chain, `reconciler` otherwise.
pub(crate) fn error_label(e: &anyhow::Error) -> &'static str {
    e.chain().find_map(|c| c.downcast_ref::<Error>()).map(|e| e.kind()).unwrap_or("reconciler")
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Workers {
    pub async fn run(self: Arc<Self>, id: usize) {
        debug!(controller = %self.name, worker = id, "controller: worker started");
        while let Some(lease) = self.queue.lease().await {
            let key = lease.key().clone();
            let outcome = self.process(&key).await;
            self.settle(&key, outcome);
            drop(lease);
        }
        debug!(controller = %self.name, worker = id, "controller: worker stopped");
    }

    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<ReconcileResult> {
        let deadline = deadline_after(self.config.reconcile_timeout);
        let ctx = ReconcileContext {
            client: self.client.scoped(deadline),
            deadline,
            cancel: self.hard_stop.child_token(),
        };
        let req = ReconcileRequest::from(key.clone());
        let fut = AssertUnwindSafe(self.reconciler.reconcile(ctx, req)).catch_unwind();
        match tokio::time::timeout_at(deadline, fut).await {
            Err(_) => Err(Error::Transient(format!("reconcile of {} timed out", key)).into()),
            Ok(Err(payload)) => Err(anyhow::anyhow!("reconciler panicked: {}", panic_message(&*payload))),
            Ok(Ok(r)) => r,
        }
    }

    pub(crate) async fn process(&self, key: &ObjectKey) -> Outcome {
        let started = std::time::Instant::now();
        let result = self.reconcile(key).await;
        metrics::histogram!(
            "reconcile_duration_seconds",
            started.elapsed().as_secs_f64(),
            "controller" => self.name.to_string(),
            "kind" => self.primary.to_string()
        );
        let outcome = match result {
            Ok(r) => match (r.requeue_after, r.requeue) {
                (Some(after), _) => Outcome::Requeue(after),
                (None, true) => Outcome::Requeue(self.config.requeue_delay),
                (None, false) => Outcome::Done,
            },
            Err(e) => match e.chain().find_map(|c| c.downcast_ref::<Error>()) {
                // the primary is gone: nothing left to drive
                Some(Error::NotFound(missing)) if missing == key => {
                    debug!(controller = %self.name, key = %key, "controller: primary not found; done");
                    Outcome::Done
                }
                _ => {
                    let label = error_label(&e);
                    warn!(controller = %self.name, key = %key, error_kind = label, error = %format!("{:#}", e), "controller: reconcile failed");
                    metrics::counter!(
                        "reconcile_errors_total", 1u64,
                        "controller" => self.name.to_string(),
                        "kind" => self.primary.to_string(),
                        "error" => label
                    );
                    Outcome::Failed
                }
            },
        };
        let result_label = match outcome {
            Outcome::Done => "ok",
            Outcome::Requeue(_) => "requeue",
            Outcome::Failed => "error",
        };
        metrics::counter!("reconcile_total", 1u64, "controller" => self.name.to_string(), "result" => result_label);
        outcome
    }

    /// Queue bookkeeping for one finished reconcile. `done` follows when the lease drops.
    pub(crate) fn settle(&self, key: &ObjectKey, outcome: Outcome) {
        match outcome {
            Outcome::Failed => self.queue.add_rate_limited(key.clone()),
            Outcome::Requeue(after) => {
                self.queue.forget(key);
                self.queue.add_after(key.clone(), after);
            }
            Outcome::Done => self.queue.forget(key),
        }
    }
}

/// Log a controller's registration.
pub(crate) fn announce(c: &RegisteredController, workers: usize) {
    let kinds: Vec<&str> = c.watched_kinds().collect();
    info!(
        controller = %c.name,
        primary = %c.primary,
        kinds = ?kinds,
        workers,
        "controller: registered"
    );
}
