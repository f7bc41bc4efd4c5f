//! Metrics for [crate::Store].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for [crate::Store].
#[derive(Default)]
pub struct Metrics {
    /// Intervals moved from `next` to `cur`.
    pub commits: Counter,
    /// Intervals discarded from `next`.
    pub aborts: Counter,
    /// Commit requests naming a write this node never received.
    pub commit_failures: Counter,
    /// Commit requests older than committed state.
    pub outdated_requests: Counter,
    /// Recovered intervals installed into `cur`.
    pub recoveries: Counter,
    /// Files with loaded state.
    pub files: Gauge,
}

impl Metrics {
    /// Create and register metrics with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register("commits", "Intervals committed", metrics.commits.clone());
        registry.register("aborts", "Intervals aborted", metrics.aborts.clone());
        registry.register(
            "commit_failures",
            "Commit requests naming a missing write",
            metrics.commit_failures.clone(),
        );
        registry.register(
            "outdated_requests",
            "Commit requests older than committed state",
            metrics.outdated_requests.clone(),
        );
        registry.register(
            "recoveries",
            "Recovered intervals installed",
            metrics.recoveries.clone(),
        );
        registry.register("files", "Files with loaded state", metrics.files.clone());
        metrics
    }
}
