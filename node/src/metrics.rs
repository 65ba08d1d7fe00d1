//! Prometheus metrics for the strata pipeline.
//!
//! [`PipelineMetrics`] owns a dedicated [`Registry`]. Updates are plain
//! atomic operations: they never block and never report errors back into
//! the pipeline.

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge,
    Opts, Registry, TextEncoder,
};

/// Central collection of all pipeline-level Prometheus metrics.
pub struct PipelineMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Transactions delivered to pre-consensus handling.
    pub pre_consensus_transactions: IntCounter,
    /// Transactions delivered to consensus handling.
    pub consensus_transactions: IntCounter,
    pub rounds_handled: IntCounter,
    pub signed_states: IntCounter,
    pub shuffles: IntCounter,
    /// Failures recorded in the pipeline's failure log.
    pub failures: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    pub pre_consensus_queue_size: IntGauge,
    pub consensus_queue_size: IntGauge,
    pub transaction_pool_size: IntGauge,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Time to handle one consensus round, in milliseconds.
    pub round_handle_time_ms: Histogram,
    /// Time to perform one shuffle, in milliseconds.
    pub shuffle_time_ms: Histogram,
}

impl PipelineMetrics {
    /// Create a fresh set of metrics, all registered under a new
    /// [`Registry`].
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Counters
        let pre_consensus_transactions = register_int_counter_with_registry!(
            Opts::new(
                "strata_pre_consensus_transactions_total",
                "Transactions delivered to pre-consensus handling"
            ),
            registry
        )?;

        let consensus_transactions = register_int_counter_with_registry!(
            Opts::new(
                "strata_consensus_transactions_total",
                "Transactions delivered to consensus handling"
            ),
            registry
        )?;

        let rounds_handled = register_int_counter_with_registry!(
            Opts::new("strata_rounds_handled_total", "Consensus rounds handled"),
            registry
        )?;

        let signed_states = register_int_counter_with_registry!(
            Opts::new("strata_signed_states_total", "Signed states created"),
            registry
        )?;

        let shuffles = register_int_counter_with_registry!(
            Opts::new("strata_shuffles_total", "Shuffles performed"),
            registry
        )?;

        let failures = register_int_counter_with_registry!(
            Opts::new("strata_failures_total", "Failures recorded by the pipeline"),
            registry
        )?;

        // Gauges
        let pre_consensus_queue_size = register_int_gauge_with_registry!(
            Opts::new(
                "strata_pre_consensus_queue_size",
                "Events queued for pre-consensus handling"
            ),
            registry
        )?;

        let consensus_queue_size = register_int_gauge_with_registry!(
            Opts::new(
                "strata_consensus_queue_size",
                "Rounds queued for consensus handling"
            ),
            registry
        )?;

        let transaction_pool_size = register_int_gauge_with_registry!(
            Opts::new(
                "strata_transaction_pool_size",
                "Self transactions waiting for an event"
            ),
            registry
        )?;

        // Histograms – exponential buckets covering 0.1 ms → ~1.6 s.
        let round_handle_time_ms = register_histogram_with_registry!(
            HistogramOpts::new(
                "strata_round_handle_time_ms",
                "Consensus round handling time in milliseconds"
            )
            .buckets(prometheus::exponential_buckets(0.1, 2.0, 15)?),
            registry
        )?;

        let shuffle_time_ms = register_histogram_with_registry!(
            HistogramOpts::new("strata_shuffle_time_ms", "Shuffle time in milliseconds")
                .buckets(prometheus::exponential_buckets(0.1, 2.0, 15)?),
            registry
        )?;

        Ok(Self {
            registry,
            pre_consensus_transactions,
            consensus_transactions,
            rounds_handled,
            signed_states,
            shuffles,
            failures,
            pre_consensus_queue_size,
            consensus_queue_size,
            transaction_pool_size,
            round_handle_time_ms,
            shuffle_time_ms,
        })
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
