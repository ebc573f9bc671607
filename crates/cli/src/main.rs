//! rekonctl: runs the bundled controllers against a cluster or an in-memory store.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rekon_core::{ControllerConfig, ObjectStore, WatchFeed};
use rekon_kubehub::KubeBackend;
use rekon_runtime::Manager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod controllers;
mod demo;

#[derive(Parser, Debug)]
#[command(name = "rekonctl", version, about = "Level-triggered reconciliation controllers")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict caches and writes to one namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Workers per controller (overrides REKON_WORKERS)
    #[arg(long = "workers", global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Label every ReplicaSet with the number of pods its template selects
    RunReplicaset,
    /// Track the ConfigMap referenced by objects of a custom kind
    RunConfigmapRef {
        /// GVK key of the referencing kind, e.g. "example.com/v1/Widget"
        gvk: String,
        /// JSON pointer to the referenced ConfigMap name
        #[arg(long = "ref-pointer", default_value = controllers::DEFAULT_REF_POINTER)]
        ref_pointer: String,
    },
    /// Run both controllers against an in-memory store with synthetic churn
    Demo {
        #[arg(long = "replicasets", default_value_t = 3)]
        replicasets: usize,
        #[arg(long = "pods", default_value_t = 2)]
        pods: usize,
        /// Seconds of churn before reporting
        #[arg(long = "secs", default_value_t = 3)]
        secs: u64,
        /// Milliseconds between churn steps
        #[arg(long = "tick-ms", default_value_t = 100)]
        tick_ms: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("REKON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REKON_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trip = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received; shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c; shutting down"),
        }
        trip.cancel();
    });
    token
}

async fn run_manager(mgr: Manager) -> Result<()> {
    let health = mgr.health();
    let shutdown = ctrl_c_token();
    tokio::spawn(async move {
        if health.wait_ready().await { info!("manager: ready"); }
    });
    mgr.run(shutdown).await.context("manager stopped with error")
}

async fn connect(kinds: &[&str], namespace: Option<&str>, config: ControllerConfig) -> Result<Manager> {
    let backend = Arc::new(KubeBackend::connect(kinds, namespace).await.context("connecting to cluster")?);
    let objects: Arc<dyn ObjectStore> = backend.clone();
    let feed: Arc<dyn WatchFeed> = backend;
    Ok(Manager::new(objects, feed, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = ControllerConfig::from_env();
    if let Some(n) = cli.workers.filter(|n| *n > 0) { config.workers = n; }
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let resources = rekon_kubehub::discover().await.context("discovery failed")?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::RunReplicaset => {
            let mut mgr = connect(&[controllers::REPLICASET, controllers::POD], ns, config).await?;
            controllers::add_replicaset_controller(&mut mgr)?;
            run_manager(mgr).await?;
        }
        Commands::RunConfigmapRef { gvk, ref_pointer } => {
            if !ref_pointer.starts_with('/') {
                anyhow::bail!("--ref-pointer must be a JSON pointer starting with '/', got {:?}", ref_pointer);
            }
            let mut mgr = connect(&[gvk.as_str(), controllers::CONFIGMAP], ns, config).await?;
            controllers::add_configmap_ref_controller(&mut mgr, &gvk, &ref_pointer)?;
            run_manager(mgr).await?;
        }
        Commands::Demo { replicasets, pods, secs, tick_ms } => {
            let opts = demo::DemoOptions {
                replicasets,
                pods_per_set: pods,
                duration: Duration::from_secs(secs),
                tick: Duration::from_millis(tick_ms.max(1)),
                settle: Duration::from_secs(1),
            };
            let report = demo::run(config, &opts, ctrl_c_token()).await?;
            match cli.output {
                Output::Human => {
                    for rs in &report.replicasets {
                        let mark = if rs.converged() { "ok" } else { "stale" };
                        println!("{} • pods={} • label={} • {}", rs.name, rs.pods, rs.label.as_deref().unwrap_or("-"), mark);
                    }
                    for w in &report.widgets {
                        let mark = if w.converged() { "ok" } else { "stale" };
                        println!(
                            "{} • {}@{} • label={} • {}",
                            w.name,
                            w.configmap,
                            w.configmap_rv,
                            w.label.as_deref().unwrap_or("-"),
                            mark
                        );
                    }
                    println!("writes: {}", report.writes);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if !report.converged() {
                error!("demo: labels did not converge");
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
