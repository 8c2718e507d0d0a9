// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

// Re-export for public API
pub use server::{components_handler, health_handler, metrics_handler, start_metrics_server};

// ============================================================================
// Metrics Module - Prometheus metrics for the event pipeline
// ============================================================================
//
// Provides metrics for:
// - Publishing (confirmed publishes, failures by reason)
// - Consumption (deliveries by disposition, handler latency)
// - Dead-lettering
// - Outbox backlog (pending records awaiting the relay)
// - Retry attempts and circuit breaker state
// - Component health
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for a service process
pub struct Metrics {
    registry: Registry,

    // Publishing
    pub events_published: IntCounterVec,
    pub publish_failures: IntCounterVec,

    // Consumption
    pub deliveries: IntCounterVec,
    pub handler_duration: HistogramVec,
    pub dead_letters: IntCounterVec,

    // Outbox
    pub outbox_pending: IntGauge,
    pub outbox_relayed: IntCounter,

    // Domain
    pub orders_created: IntCounterVec,
    pub invoices_created: IntCounter,
    pub duplicate_events: IntCounter,

    // Retry / Circuit Breaker
    pub retry_attempts_total: IntCounterVec,
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,

    // Health
    pub health_status: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Publishing
        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Events confirmed by the broker"),
            &["queue", "event_type"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let publish_failures = IntCounterVec::new(
            Opts::new("publish_failures_total", "Publishes that failed or were refused"),
            &["queue", "reason"],
        )?;
        registry.register(Box::new(publish_failures.clone()))?;

        // Consumption
        let deliveries = IntCounterVec::new(
            Opts::new("deliveries_total", "Deliveries settled by the consumer"),
            &["queue", "disposition"],
        )?;
        registry.register(Box::new(deliveries.clone()))?;

        let handler_duration = HistogramVec::new(
            HistogramOpts::new("handler_duration_seconds", "Message handler duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["queue"],
        )?;
        registry.register(Box::new(handler_duration.clone()))?;

        let dead_letters = IntCounterVec::new(
            Opts::new("dead_letters_total", "Messages routed to a dead-letter queue"),
            &["queue", "reason"],
        )?;
        registry.register(Box::new(dead_letters.clone()))?;

        // Outbox
        let outbox_pending = IntGauge::new(
            "outbox_pending_records",
            "Outbox records committed but not yet published",
        )?;
        registry.register(Box::new(outbox_pending.clone()))?;

        let outbox_relayed = IntCounter::new(
            "outbox_relayed_total",
            "Outbox records published by the relay",
        )?;
        registry.register(Box::new(outbox_relayed.clone()))?;

        // Domain
        let orders_created = IntCounterVec::new(
            Opts::new("orders_created_total", "Orders committed"),
            &["dispatch_mode"],
        )?;
        registry.register(Box::new(orders_created.clone()))?;

        let invoices_created = IntCounter::new("invoices_created_total", "Invoices created")?;
        registry.register(Box::new(invoices_created.clone()))?;

        let duplicate_events = IntCounter::new(
            "duplicate_events_total",
            "Redelivered events whose effect already existed",
        )?;
        registry.register(Box::new(duplicate_events.clone()))?;

        // Retry / Circuit Breaker
        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

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

        // Health
        let health_status = IntGauge::new(
            "health_status",
            "Overall health (0=Unhealthy, 1=Degraded, 2=Healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        Ok(Self {
            registry,
            events_published,
            publish_failures,
            deliveries,
            handler_duration,
            dead_letters,
            outbox_pending,
            outbox_relayed,
            orders_created,
            invoices_created,
            duplicate_events,
            retry_attempts_total,
            circuit_breaker_state,
            circuit_breaker_transitions,
            health_status,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_published(&self, queue: &str, event_type: &str) {
        self.events_published.with_label_values(&[queue, event_type]).inc();
    }

    pub fn record_publish_failure(&self, queue: &str, reason: &str) {
        self.publish_failures.with_label_values(&[queue, reason]).inc();
    }

    /// Record how a delivery was settled and how long its handler ran
    pub fn record_delivery(&self, queue: &str, disposition: &str, duration_secs: f64) {
        self.deliveries.with_label_values(&[queue, disposition]).inc();
        self.handler_duration.with_label_values(&[queue]).observe(duration_secs);
    }

    pub fn record_dead_letter(&self, queue: &str, reason: &str) {
        self.dead_letters.with_label_values(&[queue, reason]).inc();
    }

    pub fn record_retry_attempt(&self, operation: &str) {
        self.retry_attempts_total.with_label_values(&[operation]).inc();
    }

    pub fn set_outbox_pending(&self, pending: usize) {
        self.outbox_pending.set(pending as i64);
    }

    /// Helper to update circuit breaker state, counting transitions
    pub fn update_circuit_breaker_state(&self, from: &str, to: &str, gauge: i64) {
        if from != to {
            self.circuit_breaker_transitions.with_label_values(&[from, to]).inc();
        }
        self.circuit_breaker_state.set(gauge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_published("orders", "OrderCreated");
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_delivery() {
        let metrics = Metrics::new().unwrap();
        metrics.record_delivery("orders", "ack", 0.05);
        metrics.record_delivery("orders", "requeue", 0.01);
        metrics.record_delivery("orders", "ack", 0.02);

        let gathered = metrics.registry.gather();
        let deliveries = gathered.iter().find(|m| m.name() == "deliveries_total").unwrap();
        assert_eq!(deliveries.metric.len(), 2); // ack and requeue label sets
    }

    #[test]
    fn test_record_dead_letter() {
        let metrics = Metrics::new().unwrap();
        metrics.record_dead_letter("orders", "malformed");
        metrics.record_dead_letter("orders", "malformed");

        let gathered = metrics.registry.gather();
        let dead = gathered.iter().find(|m| m.name() == "dead_letters_total").unwrap();
        assert_eq!(dead.metric[0].counter.value, Some(2.0));
    }

    #[test]
    fn test_circuit_breaker_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.update_circuit_breaker_state("closed", "open", 1);
        metrics.update_circuit_breaker_state("open", "open", 1);

        let gathered = metrics.registry.gather();
        let state = gathered.iter().find(|m| m.name() == "circuit_breaker_state").unwrap();
        assert_eq!(state.metric[0].gauge.value, Some(1.0));
        let transitions = gathered
            .iter()
            .find(|m| m.name() == "circuit_breaker_transitions_total")
            .unwrap();
        assert_eq!(transitions.metric[0].counter.value, Some(1.0));
    }

    #[test]
    fn test_outbox_pending_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.set_outbox_pending(7);
        assert_eq!(metrics.outbox_pending.get(), 7);
    }
}
