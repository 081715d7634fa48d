//! Prometheus metrics for the response router
//!
//! Exposed at the API server's /metrics endpoint.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// All router metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Queue metrics
    pub messages_enqueued: IntCounter,
    pub messages_rejected: IntCounterVec,
    pub queue_depth: IntGauge,

    // Broker metrics
    pub messages_sent: IntCounter,
    pub messages_dropped: IntCounter,
    pub reconnects_total: IntCounter,
    pub restarts_total: IntCounter,
    pub connection_open: IntGauge,

    // API metrics
    pub request_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_enqueued = IntCounter::with_opts(Opts::new(
            "router_messages_enqueued_total",
            "Total commands accepted into the outbound queue",
        ))
        .unwrap();

        let messages_rejected = IntCounterVec::new(
            Opts::new(
                "router_messages_rejected_total",
                "Total commands not enqueued, by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let queue_depth = IntGauge::with_opts(Opts::new(
            "router_queue_depth",
            "Commands waiting in the outbound queue",
        ))
        .unwrap();

        let messages_sent = IntCounter::with_opts(Opts::new(
            "router_messages_sent_total",
            "Total commands published to the broker",
        ))
        .unwrap();

        let messages_dropped = IntCounter::with_opts(Opts::new(
            "router_messages_dropped_total",
            "Total commands lost to encode or transport failures",
        ))
        .unwrap();

        let reconnects_total = IntCounter::with_opts(Opts::new(
            "router_reconnects_total",
            "Total broker reconnect attempts",
        ))
        .unwrap();

        let restarts_total = IntCounter::with_opts(Opts::new(
            "router_restarts_total",
            "Total full restarts of the broker pipeline",
        ))
        .unwrap();

        let connection_open = IntGauge::with_opts(Opts::new(
            "router_connection_open",
            "1 while the broker connection is open",
        ))
        .unwrap();

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "router_request_duration_seconds",
                "Time spent handling command API requests",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )
        .unwrap();

        registry
            .register(Box::new(messages_enqueued.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_rejected.clone()))
            .unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(messages_sent.clone())).unwrap();
        registry
            .register(Box::new(messages_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(reconnects_total.clone()))
            .unwrap();
        registry.register(Box::new(restarts_total.clone())).unwrap();
        registry
            .register(Box::new(connection_open.clone()))
            .unwrap();
        registry
            .register(Box::new(request_duration.clone()))
            .unwrap();

        Metrics {
            registry,
            messages_enqueued,
            messages_rejected,
            queue_depth,
            messages_sent,
            messages_dropped,
            reconnects_total,
            restarts_total,
            connection_open,
            request_duration,
        }
    }

    pub fn message_rejected(&self, reason: &str) {
        self.messages_rejected.with_label_values(&[reason]).inc();
    }

    pub fn connection_opened(&self) {
        self.connection_open.set(1);
    }

    pub fn connection_closed(&self) {
        self.connection_open.set(0);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_registry_exports_router_metrics() {
        let metrics = Metrics::new();
        metrics.messages_enqueued.inc();
        metrics.message_rejected("queue_full");
        metrics.connection_opened();

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        for expected in [
            "router_messages_enqueued_total 1",
            "router_messages_rejected_total{reason=\"queue_full\"} 1",
            "router_queue_depth 0",
            "router_connection_open 1",
            "router_request_duration_seconds_count 0",
        ] {
            assert!(text.contains(expected), "missing {}", expected);
        }
        assert_eq!(metrics.connection_open.get(), 1);
    }
}
