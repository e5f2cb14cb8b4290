//! Prometheus metrics for the codemode sandbox pool.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

use crate::pool::PoolStats;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "success", "failure" or "exhausted".
    pub outcome: String,
}

/// Prometheus metrics for a [`SandboxPool`](crate::SandboxPool).
pub struct CodemodeMetrics {
    /// Executions by outcome.
    pub executions_total: Family<OutcomeLabels, Counter>,
    /// Execution wall time in seconds, by outcome.
    pub execution_duration_seconds: Family<OutcomeLabels, Histogram>,
    /// Capability calls authorized by the host.
    pub rpc_calls_total: Counter,
    /// Idle sandboxes.
    pub pool_available: Gauge<i64, AtomicI64>,
    /// Checked-out sandboxes.
    pub pool_in_use: Gauge<i64, AtomicI64>,
}

impl CodemodeMetrics {
    /// Create the metrics and register them with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "codemode_executions",
            "Sandbox executions by outcome",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter())
            });
        registry.register(
            "codemode_execution_duration_seconds",
            "Sandbox execution wall time",
            execution_duration_seconds.clone(),
        );

        let rpc_calls_total = Counter::default();
        registry.register(
            "codemode_rpc_calls",
            "Capability calls authorized by the host",
            rpc_calls_total.clone(),
        );

        let pool_available = Gauge::default();
        registry.register(
            "codemode_pool_available",
            "Idle sandboxes in the pool",
            pool_available.clone(),
        );

        let pool_in_use = Gauge::default();
        registry.register(
            "codemode_pool_in_use",
            "Sandboxes checked out of the pool",
            pool_in_use.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            rpc_calls_total,
            pool_available,
            pool_in_use,
        }
    }

    /// Record one finished execution.
    pub fn record_execution(&self, success: bool, duration_secs: f64, rpc_calls: u64) {
        let labels = OutcomeLabels {
            outcome: if success { "success" } else { "failure" }.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
        self.rpc_calls_total.inc_by(rpc_calls);
    }

    /// Record a caller turned away by a full pool.
    pub fn record_exhausted(&self) {
        let labels = OutcomeLabels {
            outcome: "exhausted".to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
    }

    /// Mirror the pool's occupancy.
    pub fn set_pool(&self, stats: PoolStats) {
        self.pool_available.set(stats.available as i64);
        self.pool_in_use.set(stats.in_use as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn execution_counter_splits_by_outcome() {
        let mut registry = Registry::default();
        let metrics = CodemodeMetrics::new(&mut registry);
        metrics.record_execution(true, 0.5, 2);
        metrics.record_execution(true, 1.0, 1);
        metrics.record_execution(false, 0.1, 0);

        let success = OutcomeLabels {
            outcome: "success".into(),
        };
        assert_eq!(metrics.executions_total.get_or_create(&success).get(), 2);
        assert_eq!(metrics.rpc_calls_total.get(), 3);
    }

    #[test]
    fn exhaustion_is_its_own_outcome() {
        let mut registry = Registry::default();
        let metrics = CodemodeMetrics::new(&mut registry);
        metrics.record_exhausted();

        let labels = OutcomeLabels {
            outcome: "exhausted".into(),
        };
        assert_eq!(metrics.executions_total.get_or_create(&labels).get(), 1);
    }

    #[test]
    fn pool_gauges_mirror_stats() {
        let mut registry = Registry::default();
        let metrics = CodemodeMetrics::new(&mut registry);
        metrics.set_pool(PoolStats {
            available: 2,
            in_use: 3,
            max: 8,
        });
        assert_eq!(metrics.pool_available.get(), 2);
        assert_eq!(metrics.pool_in_use.get(), 3);
    }

    #[test]
    fn metrics_encode_to_text() {
        let mut registry = Registry::default();
        let metrics = CodemodeMetrics::new(&mut registry);
        metrics.record_execution(true, 1.0, 0);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("codemode_executions_total"), "got: {buf}");
        assert!(buf.contains("codemode_pool_in_use"), "got: {buf}");
    }
}
