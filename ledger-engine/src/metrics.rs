//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the engine. Each [`Metrics`] owns its
//! own registry, so several ledgers (or tests) can live in one process.
//!
//! # Metrics
//!
//! - `ledger_transactions_submitted_total` - Admitted transactions
//! - `ledger_transactions_rejected_total` - Refused at admission
//! - `ledger_transactions_applied_total` - Committed transactions
//! - `ledger_transactions_cancelled_total` - Rolled back transactions
//! - `ledger_blocks_total` - Sealed blocks
//! - `ledger_block_size` - Histogram of transactions per block
//! - `ledger_apply_duration_seconds` - Histogram of apply latencies
//! - `ledger_mempool_size` - Pooled transactions
//! - `ledger_recovered_total` - Journal entries resolved at startup

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Admitted transactions
    pub submitted_total: IntCounter,

    /// Rejected transactions
    pub rejected_total: IntCounter,

    /// Applied transactions
    pub applied_total: IntCounter,

    /// Cancelled transactions
    pub cancelled_total: IntCounter,

    /// Sealed blocks
    pub blocks_total: IntCounter,

    /// Transactions per block
    pub block_size: Histogram,

    /// Apply duration histogram
    pub apply_duration: Histogram,

    /// Pooled transactions
    pub mempool_size: IntGauge,

    /// Journal entries resolved by recovery
    pub recovered_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: Vec<f64>,
) -> prometheus::Result<Histogram> {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let submitted_total = counter(
            &registry,
            "ledger_transactions_submitted_total",
            "Total number of admitted transactions",
        )?;
        let rejected_total = counter(
            &registry,
            "ledger_transactions_rejected_total",
            "Total number of transactions refused at admission",
        )?;
        let applied_total = counter(
            &registry,
            "ledger_transactions_applied_total",
            "Total number of applied transactions",
        )?;
        let cancelled_total = counter(
            &registry,
            "ledger_transactions_cancelled_total",
            "Total number of cancelled transactions",
        )?;
        let blocks_total = counter(&registry, "ledger_blocks_total", "Total number of sealed blocks")?;
        let block_size = histogram(
            &registry,
            "ledger_block_size",
            "Histogram of transactions per block",
            vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0],
        )?;
        let apply_duration = histogram(
            &registry,
            "ledger_apply_duration_seconds",
            "Histogram of transaction apply latencies",
            vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0],
        )?;

        let mempool_size = IntGauge::new("ledger_mempool_size", "Pooled transactions")?;
        registry.register(Box::new(mempool_size.clone()))?;

        let recovered_total = counter(
            &registry,
            "ledger_recovered_total",
            "Journal entries resolved by startup recovery",
        )?;

        Ok(Self {
            submitted_total,
            rejected_total,
            applied_total,
            cancelled_total,
            blocks_total,
            block_size,
            apply_duration,
            mempool_size,
            recovered_total,
            registry,
        })
    }

    /// Record an admission
    pub fn record_submitted(&self) {
        self.submitted_total.inc();
    }

    /// Record a rejection
    pub fn record_rejected(&self) {
        self.rejected_total.inc();
    }

    /// Record an apply and its latency
    pub fn record_applied(&self, duration_seconds: f64) {
        self.applied_total.inc();
        self.apply_duration.observe(duration_seconds);
    }

    /// Record a cancellation
    pub fn record_cancelled(&self) {
        self.cancelled_total.inc();
    }

    /// Record a sealed block
    pub fn record_block(&self, tx_count: usize) {
        self.blocks_total.inc();
        self.block_size.observe(tx_count as f64);
    }

    /// Update the mempool gauge
    pub fn set_mempool_size(&self, size: usize) {
        self.mempool_size.set(i64::try_from(size).unwrap_or(i64::MAX));
    }

    /// Record a recovered journal entry
    pub fn record_recovered(&self) {
        self.recovered_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
