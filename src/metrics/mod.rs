// Private module declaration
mod server;

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

// Re-export for public API
pub use server::{start_metrics_server, HealthRegistry};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers:
// - Outbox relay throughput, failures, backlog and retention sweeps
// - Event bus dispatch outcomes, split by failure kind so decode failures
//   (poison messages) and handler failures (redelivered) never mix
// - Circuit breaker state in front of the broker
//
// All metrics are registered with one Registry and scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Outbox relay
    pub outbox_published: IntCounterVec,
    pub outbox_publish_failures: IntCounterVec,
    pub outbox_batch_duration: Histogram,
    pub outbox_pending_records: IntGauge,
    pub outbox_stuck_records: IntGauge,
    pub outbox_pruned_records: IntCounter,

    // Event bus
    pub bus_messages_handled: IntCounterVec,
    pub bus_decode_failures: IntCounterVec,
    pub bus_handler_failures: IntCounterVec,
    pub bus_dead_lettered: IntCounterVec,
    pub bus_handler_duration: HistogramVec,

    // Circuit breaker
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let outbox_published = IntCounterVec::new(
            Opts::new("outbox_records_published_total", "Outbox records published to the broker"),
            &["event_type"],
        )?;
        registry.register(Box::new(outbox_published.clone()))?;

        let outbox_publish_failures = IntCounterVec::new(
            Opts::new("outbox_publish_failures_total", "Failed outbox publish attempts"),
            &["event_type"],
        )?;
        registry.register(Box::new(outbox_publish_failures.clone()))?;

        let outbox_batch_duration = Histogram::with_opts(
            HistogramOpts::new("outbox_relay_batch_duration_seconds", "Relay batch duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(outbox_batch_duration.clone()))?;

        let outbox_pending_records =
            IntGauge::new("outbox_pending_records", "Outbox records waiting to be published")?;
        registry.register(Box::new(outbox_pending_records.clone()))?;

        let outbox_stuck_records = IntGauge::new(
            "outbox_stuck_records",
            "Pending outbox records that exhausted their attempts",
        )?;
        registry.register(Box::new(outbox_stuck_records.clone()))?;

        let outbox_pruned_records =
            IntCounter::new("outbox_pruned_records_total", "Published records removed by retention")?;
        registry.register(Box::new(outbox_pruned_records.clone()))?;

        let bus_messages_handled = IntCounterVec::new(
            Opts::new("bus_messages_handled_total", "Messages whose handlers all succeeded"),
            &["event_type"],
        )?;
        registry.register(Box::new(bus_messages_handled.clone()))?;

        let bus_decode_failures = IntCounterVec::new(
            Opts::new("bus_decode_failures_total", "Poison messages that could not be decoded"),
            &["reason"],
        )?;
        registry.register(Box::new(bus_decode_failures.clone()))?;

        let bus_handler_failures = IntCounterVec::new(
            Opts::new("bus_handler_failures_total", "Handler errors causing redelivery"),
            &["event_type", "handler"],
        )?;
        registry.register(Box::new(bus_handler_failures.clone()))?;

        let bus_dead_lettered = IntCounterVec::new(
            Opts::new("bus_dead_lettered_total", "Messages forwarded to the dead-letter topic"),
            &["event_type"],
        )?;
        registry.register(Box::new(bus_dead_lettered.clone()))?;

        let bus_handler_duration = HistogramVec::new(
            HistogramOpts::new("bus_handler_duration_seconds", "Handler invocation duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["event_type"],
        )?;
        registry.register(Box::new(bus_handler_duration.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        Ok(Self {
            registry,
            outbox_published,
            outbox_publish_failures,
            outbox_batch_duration,
            outbox_pending_records,
            outbox_stuck_records,
            outbox_pruned_records,
            bus_messages_handled,
            bus_decode_failures,
            bus_handler_failures,
            bus_dead_lettered,
            bus_handler_duration,
            circuit_breaker_state,
            circuit_breaker_transitions,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_outbox_publish(&self, event_type: &str, success: bool) {
        if success {
            self.outbox_published.with_label_values(&[event_type]).inc();
        } else {
            self.outbox_publish_failures.with_label_values(&[event_type]).inc();
        }
    }

    pub fn observe_relay_batch(&self, duration_secs: f64) {
        self.outbox_batch_duration.observe(duration_secs);
    }

    pub fn update_outbox_backlog(&self, pending: u64, stuck: u64) {
        self.outbox_pending_records.set(pending as i64);
        self.outbox_stuck_records.set(stuck as i64);
    }

    pub fn record_pruned(&self, count: u64) {
        self.outbox_pruned_records.inc_by(count);
    }

    pub fn record_handled(&self, event_type: &str) {
        self.bus_messages_handled.with_label_values(&[event_type]).inc();
    }

    pub fn record_decode_failure(&self, reason: &str) {
        self.bus_decode_failures.with_label_values(&[reason]).inc();
    }

    pub fn record_handler_failure(&self, event_type: &str, handler: &str) {
        self.bus_handler_failures.with_label_values(&[event_type, handler]).inc();
    }

    pub fn record_dead_letter(&self, event_type: &str) {
        self.bus_dead_lettered.with_label_values(&[event_type]).inc();
    }

    pub fn observe_handler(&self, event_type: &str, duration_secs: f64) {
        self.bus_handler_duration.with_label_values(&[event_type]).observe(duration_secs);
    }

    pub fn update_circuit_breaker_state(&self, state: i64) {
        self.circuit_breaker_state.set(state);
    }

    pub fn record_circuit_breaker_transition(&self, from_state: &str, to_state: &str) {
        self.circuit_breaker_transitions.with_label_values(&[from_state, to_state]).inc();
    }
}
