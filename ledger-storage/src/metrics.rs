//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring ledger stores.
//! Each [`Metrics`] owns its registry, so several stores or tests can
//! coexist in one process.
//!
//! # Metrics
//!
//! - `ledger_store_operation_duration_seconds{operation}` - Store operation latency
//! - `ledger_store_operation_errors_total{operation,kind}` - Failed store operations
//! - `ledger_worker_batch_size` - Models written per worker batch
//! - `ledger_worker_pending_models` - Models waiting for the next batch
//! - `ledger_logs_appended_total` - Log entries appended

use crate::error::Error;
use prometheus::{
    Histogram, HistogramOpts, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Store operation latency
    pub operation_duration: HistogramVec,

    /// Failed store operations
    pub operation_errors: IntCounterVec,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Models buffered behind the in-flight write
    pub pending_models: IntGauge,

    /// Total log entries appended
    pub logs_appended: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ledger_store_operation_duration_seconds",
                "Histogram of store operation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let operation_errors = IntCounterVec::new(
            Opts::new(
                "ledger_store_operation_errors_total",
                "Total number of failed store operations",
            ),
            &["operation", "kind"],
        )?;
        registry.register(Box::new(operation_errors.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("ledger_worker_batch_size", "Histogram of write batch sizes")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let pending_models = IntGauge::new(
            "ledger_worker_pending_models",
            "Models waiting for the next write batch",
        )?;
        registry.register(Box::new(pending_models.clone()))?;

        let logs_appended = IntCounter::new(
            "ledger_logs_appended_total",
            "Total number of log entries appended",
        )?;
        registry.register(Box::new(logs_appended.clone()))?;

        Ok(Self {
            operation_duration,
            operation_errors,
            batch_size,
            pending_models,
            logs_appended,
            registry,
        })
    }

    /// Start timing an operation; the duration is recorded when the timer drops
    pub fn start_timer(&self, operation: &str) -> HistogramTimer {
        self.operation_duration
            .with_label_values(&[operation])
            .start_timer()
    }

    /// Record a failed operation
    pub fn record_error(&self, operation: &str, error: &Error) {
        self.operation_errors
            .with_label_values(&[operation, error.kind().as_str()])
            .inc();
    }

    /// Record batch flush
    pub fn record_batch_flush(&self, batch_size: usize) {
        self.batch_size.observe(batch_size as f64);
    }

    /// Record appended log entries
    pub fn record_logs_appended(&self, count: usize) {
        self.logs_appended.inc_by(count as u64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metric definitions are static and valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.record_logs_appended(3);
        second.record_logs_appended(1);

        assert_eq!(first.logs_appended.get(), 3);
        assert_eq!(second.logs_appended.get(), 1);
    }

    #[test]
    fn test_error_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.record_error("get_transaction", &Error::NotFound("tx 3".to_string()));
        metrics.record_error("get_transaction", &Error::NotFound("tx 4".to_string()));

        let count = metrics
            .operation_errors
            .with_label_values(&["get_transaction", "not_found"])
            .get();
        assert_eq!(count, 2);

        {
            let _timer = metrics.start_timer("commit");
        }
        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "ledger_store_operation_duration_seconds"));
    }
}
