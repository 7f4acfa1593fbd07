//! Prometheus metrics for the hub.
//!
//! Each hub owns its own registry so tests and embedded hubs never collide
//! on the process-global default registry.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "zeroclaw_sync";

pub struct HubMetrics {
    registry: Registry,
    pub messages_received: IntCounterVec,
    pub messages_rejected: IntCounterVec,
    pub operations_enqueued: IntCounter,
    pub operations_processed: IntCounter,
    pub operations_failed: IntCounter,
    pub operations_superseded: IntCounter,
    pub delivery_retries: IntCounter,
    pub conflicts_detected: IntCounter,
    pub conflicts_resolved: IntCounter,
    pub conflicts_escalated: IntCounter,
    pub offline_parked: IntCounter,
    pub offline_dropped: IntCounter,
    /// Writes the persistent store refused, labelled by what was written.
    pub store_failures: IntCounterVec,
    pub queue_depth: IntGauge,
    pub active_devices: IntGauge,
    pub connections: IntGauge,
    /// Enqueue-to-completion latency of sync operations, in seconds.
    pub delivery_latency: Histogram,
}

impl HubMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let messages_received = IntCounterVec::new(
            Opts::new("messages_received_total", "Inbound envelopes by type").namespace(NAMESPACE),
            &["type"],
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let messages_rejected = IntCounterVec::new(
            Opts::new("messages_rejected_total", "Inbound envelopes rejected by reason")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        registry.register(Box::new(messages_rejected.clone()))?;

        let store_failures = IntCounterVec::new(
            Opts::new("store_failures_total", "Failed writes to the persistent store")
                .namespace(NAMESPACE),
            &["record"],
        )?;
        registry.register(Box::new(store_failures.clone()))?;

        let delivery_latency = Histogram::with_opts(
            HistogramOpts::new(
                "operation_latency_seconds",
                "Time from enqueue to completion of a sync operation",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(delivery_latency.clone()))?;

        Ok(Self {
            messages_received,
            messages_rejected,
            operations_enqueued: counter("operations_enqueued_total", "Sync operations enqueued")?,
            operations_processed: counter(
                "operations_processed_total",
                "Sync operations that reached every target",
            )?,
            operations_failed: counter(
                "operations_failed_total",
                "Sync operations that exhausted their attempts",
            )?,
            operations_superseded: counter(
                "operations_superseded_total",
                "Pending operations replaced by a newer value",
            )?,
            delivery_retries: counter("delivery_retries_total", "Operations requeued after a failure")?,
            conflicts_detected: counter("conflicts_detected_total", "Sync conflicts detected")?,
            conflicts_resolved: counter("conflicts_resolved_total", "Sync conflicts resolved")?,
            conflicts_escalated: counter(
                "conflicts_escalated_total",
                "Sync conflicts parked for manual review",
            )?,
            offline_parked: counter("offline_parked_total", "Envelopes parked for offline devices")?,
            offline_dropped: counter(
                "offline_dropped_total",
                "Envelopes dropped because an offline queue was full",
            )?,
            store_failures,
            queue_depth: gauge("queue_depth", "Operations waiting in the sync queue")?,
            active_devices: gauge("active_devices", "Devices currently considered active")?,
            connections: gauge("connections", "Authenticated persistent connections")?,
            delivery_latency,
            registry,
        })
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let families = self.registry.gather();
        if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
