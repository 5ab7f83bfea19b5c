//! Prometheus metrics for the engine.

use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collection shared across partition workers.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub events_total: CounterVec,
    pub errors_total: CounterVec,
    pub window_transitions_total: CounterVec,
    pub join_matches_total: Counter,
    pub notifications_total: Counter,
    pub gap_frames_total: Counter,
    pub processing_latency: HistogramVec,
    pub store_entries: Gauge,
    pub subscribers: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_total = CounterVec::new(
            Opts::new("freshet_events_total", "Events ingested"),
            &["partition"],
        )
        .expect("failed to create events_total counter");

        let errors_total = CounterVec::new(
            Opts::new("freshet_errors_total", "Rejected or failed events by kind"),
            &["kind"],
        )
        .expect("failed to create errors_total counter");

        let window_transitions_total = CounterVec::new(
            Opts::new(
                "freshet_window_transitions_total",
                "Window lifecycle transitions",
            ),
            &["transition"],
        )
        .expect("failed to create window_transitions_total counter");

        let join_matches_total = Counter::new("freshet_join_matches_total", "Joined records produced")
            .expect("failed to create join_matches_total counter");

        let notifications_total = Counter::new(
            "freshet_notifications_total",
            "Change notifications published",
        )
        .expect("failed to create notifications_total counter");

        let gap_frames_total = Counter::new(
            "freshet_gap_frames_total",
            "Gap frames enqueued for slow subscribers",
        )
        .expect("failed to create gap_frames_total counter");

        let processing_latency = HistogramVec::new(
            HistogramOpts::new(
                "freshet_processing_latency_seconds",
                "Per-event processing latency",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
            ]),
            &["partition"],
        )
        .expect("failed to create processing_latency histogram");

        let store_entries = Gauge::new("freshet_store_entries", "Live state store entries")
            .expect("failed to create store_entries gauge");

        let subscribers = Gauge::new("freshet_subscribers", "Live push subscribers")
            .expect("failed to create subscribers gauge");

        registry
            .register(Box::new(events_total.clone()))
            .expect("failed to register events_total");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("failed to register errors_total");
        registry
            .register(Box::new(window_transitions_total.clone()))
            .expect("failed to register window_transitions_total");
        registry
            .register(Box::new(join_matches_total.clone()))
            .expect("failed to register join_matches_total");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("failed to register notifications_total");
        registry
            .register(Box::new(gap_frames_total.clone()))
            .expect("failed to register gap_frames_total");
        registry
            .register(Box::new(processing_latency.clone()))
            .expect("failed to register processing_latency");
        registry
            .register(Box::new(store_entries.clone()))
            .expect("failed to register store_entries");
        registry
            .register(Box::new(subscribers.clone()))
            .expect("failed to register subscribers");

        Self {
            registry: Arc::new(registry),
            events_total,
            errors_total,
            window_transitions_total,
            join_matches_total,
            notifications_total,
            gap_frames_total,
            processing_latency,
            store_entries,
            subscribers,
        }
    }

    /// Record an ingested event.
    pub fn record_event(&self, partition: u32) {
        self.events_total
            .with_label_values(&[&partition.to_string()])
            .inc();
    }

    /// Record a rejected or failed event by error kind.
    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    /// Record a window lifecycle transition.
    pub fn record_transition(&self, transition: &str) {
        self.window_transitions_total
            .with_label_values(&[transition])
            .inc();
    }

    /// Get Prometheus text output.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
