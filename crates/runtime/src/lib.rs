//! rekon runtime: wires informers, mappers, work queues and reconcilers into
//! level-triggered controllers.
//!
//! ```text
//! store → informer → ResourceEvent → Mapper → WorkQueue → worker → Reconciler → Client → store
//! ```

#![forbid(unsafe_code)]

use std::future::Future;

use async_trait::async_trait;
use rekon_core::{ReconcileRequest, ReconcileResult};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

mod client;
mod controller;
mod manager;
pub mod mapper;

pub use client::Client;
pub use controller::{Controller, RegisteredController};
pub use manager::Manager;
pub use mapper::{dedup_keys, FnMapper, Mapper, OwnerMapper, PredicateMapper, SelfMapper};

/// Per-call context handed to a reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    /// Client whose store calls are bounded by `deadline`.
    pub client: Client,
    pub deadline: Instant,
    /// Cancelled when the process stops waiting for in-flight work.
    pub cancel: CancellationToken,
}

/// Idempotent, level-triggered business logic for one primary kind.
///
/// Implementations re-read state through the client on every call and should treat a
/// missing primary as a clean terminal state.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, ctx: ReconcileContext, req: ReconcileRequest) -> anyhow::Result<ReconcileResult>;
}

/// Adapts an async closure into a [`Reconciler`].
pub struct FnReconciler<F> {
    f: F,
}

impl<F, Fut> FnReconciler<F>
where
    F: Fn(ReconcileContext, ReconcileRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ReconcileResult>> + Send + 'static,
{
    pub fn new(f: F) -> Self { Self { f } }
}

#[async_trait]
impl<F, Fut> Reconciler for FnReconciler<F>
where
    F: Fn(ReconcileContext, ReconcileRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ReconcileResult>> + Send + 'static,
{
    async fn reconcile(&self, ctx: ReconcileContext, req: ReconcileRequest) -> anyhow::Result<ReconcileResult> {
        (self.f)(ctx, req).await
    }
}

/// Readiness as seen by probes: true once every cache finished its initial list, false
/// again after shutdown.
#[derive(Debug, Clone)]
pub struct Health {
    ready: watch::Receiver<bool>,
}

impl Health {
    pub fn is_ready(&self) -> bool { *self.ready.borrow() }

    /// Wait until ready. Returns false if the manager went away first.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.ready.clone();
        loop {
            if *rx.borrow_and_update() { return true; }
            if rx.changed().await.is_err() { return false; }
        }
    }
}
