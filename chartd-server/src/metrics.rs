//! Prometheus metrics for the chartd server.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Prometheus metrics for the chartd server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Total requests by operation type.
    pub requests_total: CounterVec,
    /// Total errors by error code.
    pub errors_total: CounterVec,
    /// Request duration histogram by operation.
    pub request_duration: HistogramVec,
    /// Registered definitions.
    pub definitions_total: Gauge,
    /// Live instances.
    pub instances_total: Gauge,
    /// Open subscriber channels.
    pub subscribers_active: Gauge,
    /// Notifications forwarded to subscribers by kind.
    pub notifications_forwarded_total: CounterVec,
    /// Outbound sends by route.
    pub sends_total: CounterVec,
    /// Outbound sends that failed or could not be routed, by route.
    pub send_failures_total: CounterVec,
    /// Sends scheduled but not yet fired or canceled.
    pub sends_pending: Gauge,
    /// Pending sends canceled before firing.
    pub sends_canceled_total: Counter,
    /// Cancel requests that found nothing to cancel.
    pub cancel_misses_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "chartd_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "chartd_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Requests
        let requests_total = CounterVec::new(
            Opts::new("chartd_requests_total", "Total requests by operation"),
            &["operation"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("chartd_errors_total", "Total errors by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "chartd_request_duration_seconds",
                "Request duration in seconds by operation",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        // Registries
        let definitions_total = Gauge::with_opts(Opts::new(
            "chartd_definitions_total",
            "Number of registered machine definitions",
        ))?;
        registry.register(Box::new(definitions_total.clone()))?;

        let instances_total = Gauge::with_opts(Opts::new(
            "chartd_instances_total",
            "Number of live machine instances",
        ))?;
        registry.register(Box::new(instances_total.clone()))?;

        // Subscriptions
        let subscribers_active = Gauge::with_opts(Opts::new(
            "chartd_subscribers_active",
            "Number of open subscriber channels",
        ))?;
        registry.register(Box::new(subscribers_active.clone()))?;

        let notifications_forwarded_total = CounterVec::new(
            Opts::new(
                "chartd_notifications_forwarded_total",
                "Total notifications forwarded to subscribers by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(notifications_forwarded_total.clone()))?;

        // Sends
        let sends_total = CounterVec::new(
            Opts::new("chartd_sends_total", "Total outbound sends by route"),
            &["route"],
        )?;
        registry.register(Box::new(sends_total.clone()))?;

        let send_failures_total = CounterVec::new(
            Opts::new(
                "chartd_send_failures_total",
                "Outbound sends that failed or could not be routed",
            ),
            &["route"],
        )?;
        registry.register(Box::new(send_failures_total.clone()))?;

        let sends_pending = Gauge::with_opts(Opts::new(
            "chartd_sends_pending",
            "Sends scheduled but not yet fired or canceled",
        ))?;
        registry.register(Box::new(sends_pending.clone()))?;

        let sends_canceled_total = Counter::with_opts(Opts::new(
            "chartd_sends_canceled_total",
            "Pending sends canceled before firing",
        ))?;
        registry.register(Box::new(sends_canceled_total.clone()))?;

        let cancel_misses_total = Counter::with_opts(Opts::new(
            "chartd_cancel_misses_total",
            "Cancel requests that matched no pending send",
        ))?;
        registry.register(Box::new(cancel_misses_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            errors_total,
            request_duration,
            definitions_total,
            instances_total,
            subscribers_active,
            notifications_forwarded_total,
            sends_total,
            send_failures_total,
            sends_pending,
            sends_canceled_total,
            cancel_misses_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
