//! Metrics collection for observability
//!
//! Prometheus metrics on a private registry, one per ledger instance.
//!
//! # Metrics
//!
//! - `ledger_operations_total` - Operations by kind and outcome
//! - `ledger_operation_duration_seconds` - Operation latency by kind
//! - `ledger_version_conflicts_total` - Lost compare-and-swap races by kind
//! - `ledger_idempotent_replays_total` - Requests answered from a prior result
//! - `ledger_transfer_compensations_total` - Reversals written for failed credits
//! - `ledger_orphans_recovered_total` - Orphaned transfers resolved at recovery

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Operations by kind and outcome
    pub operations_total: IntCounterVec,

    /// Operation latency histogram
    pub operation_duration: HistogramVec,

    /// Version conflicts by kind
    pub version_conflicts: IntCounterVec,

    /// Idempotent replays
    pub idempotent_replays: IntCounter,

    /// Transfer compensations
    pub compensations_total: IntCounter,

    /// Recovered orphans by resolution
    pub orphans_recovered: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let operations_total = IntCounterVec::new(
            Opts::new("ledger_operations_total", "Ledger operations by kind and outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ledger_operation_duration_seconds",
                "Histogram of ledger operation latencies",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0,
            ]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let version_conflicts = IntCounterVec::new(
            Opts::new(
                "ledger_version_conflicts_total",
                "Compare-and-swap attempts lost to a concurrent writer",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(version_conflicts.clone()))?;

        let idempotent_replays = IntCounter::new(
            "ledger_idempotent_replays_total",
            "Requests answered with a previously committed result",
        )?;
        registry.register(Box::new(idempotent_replays.clone()))?;

        let compensations_total = IntCounter::new(
            "ledger_transfer_compensations_total",
            "Reversals written after a transfer credit failed",
        )?;
        registry.register(Box::new(compensations_total.clone()))?;

        let orphans_recovered = IntCounterVec::new(
            Opts::new(
                "ledger_orphans_recovered_total",
                "Orphaned transfers resolved during recovery",
            ),
            &["resolution"],
        )?;
        registry.register(Box::new(orphans_recovered.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration,
            version_conflicts,
            idempotent_replays,
            compensations_total,
            orphans_recovered,
            registry,
        })
    }

    /// Record a finished operation
    pub fn record_operation(&self, operation: &str, outcome: &str, elapsed: Duration) {
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a lost CAS race
    pub fn record_conflict(&self, operation: &str) {
        self.version_conflicts.with_label_values(&[operation]).inc();
    }

    /// Record an idempotent replay
    pub fn record_replay(&self) {
        self.idempotent_replays.inc();
    }

    /// Record a transfer compensation
    pub fn record_compensation(&self) {
        self.compensations_total.inc();
    }

    /// Record a resolved orphan (`completed` or `compensated`)
    pub fn record_orphan(&self, resolution: &str) {
        self.orphans_recovered.with_label_values(&[resolution]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> crate::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.idempotent_replays.get(), 0);
        assert_eq!(metrics.compensations_total.get(), 0);
    }

    #[test]
    fn test_registries_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.record_compensation();
        assert_eq!(first.compensations_total.get(), 1);
        assert_eq!(second.compensations_total.get(), 0);
    }

    #[test]
    fn test_record_operation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_operation("deposit", "committed", Duration::from_millis(3));
        metrics.record_operation("deposit", "committed", Duration::from_millis(4));
        metrics.record_operation("withdraw", "insufficient_funds", Duration::from_millis(1));

        assert_eq!(
            metrics
                .operations_total
                .with_label_values(&["deposit", "committed"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .operation_duration
                .with_label_values(&["deposit"])
                .get_sample_count(),
            2
        );

        let text = metrics.render().unwrap();
        assert!(text.contains("ledger_operations_total"));
        assert!(text.contains("insufficient_funds"));
    }
}
