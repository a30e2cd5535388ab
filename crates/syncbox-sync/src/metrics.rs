//! Prometheus metrics for the sync pipeline
//!
//! One registry per process, shared by the engine and the transfer
//! scheduler. The daemon may expose [`SyncMetrics::encode`] however it likes.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Registry holding all sync metrics
pub struct SyncMetrics {
    registry: Registry,
    /// Counter: sync passes by result (committed, failed, cancelled)
    pub passes_total: IntCounterVec,
    /// Counter: finished transfers by (direction, outcome)
    pub transfers_total: IntCounterVec,
    /// Counter: transient transfer failures that were retried
    pub transfer_retries_total: IntCounterVec,
    /// Counter: bytes moved by direction
    pub bytes_total: IntCounterVec,
    /// Counter: conflicts by winning side
    pub conflicts_total: IntCounterVec,
    /// Gauge: change records waiting for the next pass
    pub pending_changes: IntGauge,
    /// Histogram: pass duration in seconds by result
    pub pass_duration_seconds: HistogramVec,
}

impl SyncMetrics {
    /// Creates a registry with every metric registered
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("syncbox".to_string()), None)?;

        let passes_total = IntCounterVec::new(
            Opts::new("passes_total", "Total sync passes"),
            &["result"],
        )?;
        registry.register(Box::new(passes_total.clone()))?;

        let transfers_total = IntCounterVec::new(
            Opts::new("transfers_total", "Total finished transfers"),
            &["direction", "outcome"],
        )?;
        registry.register(Box::new(transfers_total.clone()))?;

        let transfer_retries_total = IntCounterVec::new(
            Opts::new("transfer_retries_total", "Transient transfer failures retried"),
            &["direction"],
        )?;
        registry.register(Box::new(transfer_retries_total.clone()))?;

        let bytes_total = IntCounterVec::new(
            Opts::new("bytes_total", "Total bytes transferred"),
            &["direction"],
        )?;
        registry.register(Box::new(bytes_total.clone()))?;

        let conflicts_total = IntCounterVec::new(
            Opts::new("conflicts_total", "Total conflicts by winner"),
            &["winner"],
        )?;
        registry.register(Box::new(conflicts_total.clone()))?;

        let pending_changes = IntGauge::new("pending_changes", "Change records awaiting a pass")?;
        registry.register(Box::new(pending_changes.clone()))?;

        let pass_duration_seconds = HistogramVec::new(
            HistogramOpts::new("pass_duration_seconds", "Sync pass duration in seconds")
                .buckets(vec![0.1, 1.0, 10.0, 60.0, f64::INFINITY]),
            &["result"],
        )?;
        registry.register(Box::new(pass_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            passes_total,
            transfers_total,
            transfer_retries_total,
            bytes_total,
            conflicts_total,
            pending_changes,
            pass_duration_seconds,
        })
    }

    // ========================================================================
    // Recording helpers
    // ========================================================================

    pub fn record_pass(&self, result: &str, duration_secs: f64) {
        self.passes_total.with_label_values(&[result]).inc();
        self.pass_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_transfer(&self, direction: &str, outcome: &str) {
        self.transfers_total
            .with_label_values(&[direction, outcome])
            .inc();
    }

    pub fn record_retry(&self, direction: &str) {
        self.transfer_retries_total
            .with_label_values(&[direction])
            .inc();
    }

    pub fn record_bytes(&self, direction: &str, bytes: u64) {
        self.bytes_total.with_label_values(&[direction]).inc_by(bytes);
    }

    pub fn record_conflict(&self, winner: &str) {
        self.conflicts_total.with_label_values(&[winner]).inc();
    }

    pub fn set_pending_changes(&self, count: usize) {
        self.pending_changes
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode all metrics in Prometheus text exposition format
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
