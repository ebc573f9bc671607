//! Runtime configuration with `REKON_*` environment overrides.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Parallel reconcile workers per controller.
    pub workers: usize,
    /// Interval of the unconditional re-enqueue of every primary key.
    pub resync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Delay applied to `ReconcileResult { requeue: true, .. }`.
    pub requeue_delay: Duration,
    pub reconcile_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Capacity of each informer → controller event channel.
    pub event_capacity: usize,
    pub watch_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_interval: Duration::from_secs(300),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            requeue_delay: Duration::from_millis(5),
            reconcile_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            event_capacity: 2048,
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `REKON_WORKERS`, `REKON_RESYNC_SECS`, `REKON_BACKOFF_BASE_MS`,
    /// `REKON_BACKOFF_MAX_SECS`, `REKON_REQUEUE_DELAY_MS`, `REKON_RECONCILE_TIMEOUT_SECS`,
    /// `REKON_SHUTDOWN_GRACE_SECS`, `REKON_EVENT_CAP` and `REKON_WATCH_BACKOFF_MAX_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse("REKON_WORKERS").filter(|n: &usize| *n > 0).unwrap_or(d.workers),
            resync_interval: env_parse("REKON_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync_interval),
            backoff_base: env_parse("REKON_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env_parse("REKON_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            requeue_delay: env_parse("REKON_REQUEUE_DELAY_MS").map(Duration::from_millis).unwrap_or(d.requeue_delay),
            reconcile_timeout: env_parse("REKON_RECONCILE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.reconcile_timeout),
            shutdown_grace: env_parse("REKON_SHUTDOWN_GRACE_SECS").map(Duration::from_secs).unwrap_or(d.shutdown_grace),
            event_capacity: env_parse("REKON_EVENT_CAP").filter(|n: &usize| *n > 0).unwrap_or(d.event_capacity),
            watch_backoff_max: env_parse("REKON_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch_backoff_max),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = %name, value = %raw, "ignoring unparsable config value; using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_and_falls_back() {
        std::env::set_var("REKON_WORKERS", "7");
        std::env::set_var("REKON_RESYNC_SECS", "not-a-number");
        let cfg = ControllerConfig::from_env();
        std::env::remove_var("REKON_WORKERS");
        std::env::remove_var("REKON_RESYNC_SECS");
        assert_eq!(cfg.workers, 7);
        assert_eq!(cfg.resync_interval, ControllerConfig::default().resync_interval);
    }
}
