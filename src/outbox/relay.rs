use kameo::actor::ActorRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::OutboxStore;
use crate::actors::{HealthMonitorActor, HealthStatus, UpdateHealth};
use crate::messaging::Publisher;
use crate::metrics::Metrics;
use crate::storage::StoreError;
use crate::utils::{IsTransient, RetryConfig};

// ============================================================================
// Outbox Relay
// ============================================================================
//
// Publishes committed outbox records in creation order. A failed publish
// stops the pass at that record (later records wait behind it, preserving
// FIFO) and the relay backs off exponentially before trying again. Records
// are never dropped; the pending count is exported for reconciliation.
// A head record the broker refuses outright (unknown queue, rejected) marks
// the relay unhealthy, since retrying alone will not clear it.
//
// Wakes on `notifier()` (signalled after each commit) or every
// `poll_interval`, whichever comes first.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RelayOptions {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub backoff: RetryConfig,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            backoff: RetryConfig::relay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPass {
    /// Every pending record was published
    Drained { published: usize },
    /// Publishing stopped at a record that could not be published
    Blocked {
        published: usize,
        error: String,
        transient: bool,
        attempts: u32,
    },
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<Publisher>,
    notify: Arc<Notify>,
    options: RelayOptions,
    metrics: Option<Arc<Metrics>>,
    health: Option<ActorRef<HealthMonitorActor>>,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<Publisher>, options: RelayOptions) -> Self {
        Self {
            store,
            publisher,
            notify: Arc::new(Notify::new()),
            options,
            metrics: None,
            health: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: ActorRef<HealthMonitorActor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Signal this after committing outbox records to publish them without
    /// waiting for the next poll.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Publish pending records until none are left or one fails.
    pub async fn relay_pending(&self) -> Result<RelayPass, StoreError> {
        let mut published = 0;

        loop {
            let batch = self.store.fetch_pending(self.options.batch_size).await?;
            let batch_len = batch.len();

            for record in batch {
                match self.publisher.publish_raw(&record.queue, record.to_message()).await {
                    Ok(()) => {
                        if let Err(e) = self.store.mark_published(record.id).await {
                            // Published but not marked: it goes out again on the next pass
                            tracing::error!(outbox_id = %record.id, error = %e, "Failed to mark outbox record published");
                            return Err(e);
                        }
                        published += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.outbox_relayed.inc();
                        }
                        tracing::debug!(
                            outbox_id = %record.id,
                            event_id = %record.event_id,
                            queue = %record.queue,
                            "Relayed outbox record"
                        );
                    }
                    Err(e) => {
                        let error = e.to_string();
                        let transient = e.is_transient();
                        let attempts = record.attempts + 1;
                        self.store.record_failure(record.id, &error).await?;
                        if transient {
                            tracing::warn!(
                                outbox_id = %record.id,
                                attempts,
                                error = %error,
                                "Outbox publish failed, holding later records"
                            );
                        } else {
                            tracing::error!(
                                outbox_id = %record.id,
                                queue = %record.queue,
                                attempts,
                                error = %error,
                                "Broker refused outbox record, relay stalled until it is fixed"
                            );
                        }
                        return Ok(RelayPass::Blocked {
                            published,
                            error,
                            transient,
                            attempts,
                        });
                    }
                }
            }

            if batch_len < self.options.batch_size {
                return Ok(RelayPass::Drained { published });
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            batch_size = self.options.batch_size,
            "Outbox relay started"
        );

        let mut failures = 0u32;
        loop {
            let wait = match self.relay_pending().await {
                Ok(RelayPass::Drained { published }) => {
                    if failures > 0 {
                        tracing::info!(published, "Outbox relay recovered");
                        self.report(HealthStatus::Healthy).await;
                    }
                    failures = 0;
                    None
                }
                Ok(RelayPass::Blocked {
                    error,
                    transient,
                    attempts,
                    ..
                }) => {
                    failures += 1;
                    let status = if transient {
                        HealthStatus::Degraded(error)
                    } else {
                        HealthStatus::Unhealthy(error)
                    };
                    self.report_with_details(status, format!("head record attempts: {attempts}"))
                        .await;
                    Some(self.options.backoff.delay_for(failures))
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(error = %e, "Outbox store unavailable");
                    self.report(HealthStatus::Unhealthy(e.to_string())).await;
                    Some(self.options.backoff.delay_for(failures))
                }
            };

            self.update_pending_gauge().await;

            match wait {
                None => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                },
                Some(delay) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry_attempt("outbox.relay");
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!("Outbox relay stopped");
    }

    async fn update_pending_gauge(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match self.store.pending_count().await {
            Ok(pending) => metrics.set_outbox_pending(pending),
            Err(e) => tracing::debug!(error = %e, "Could not count pending outbox records"),
        }
    }

    async fn report(&self, status: HealthStatus) {
        self.send_health(UpdateHealth::new("outbox_relay", status)).await;
    }

    async fn report_with_details(&self, status: HealthStatus, details: String) {
        self.send_health(UpdateHealth::new("outbox_relay", status).with_details(details))
            .await;
    }

    async fn send_health(&self, update: UpdateHealth) {
        if let Some(health) = &self.health {
            if health.tell(update).send().await.is_err() {
                tracing::debug!("Health monitor unavailable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::GetSystemHealth;
    use crate::contracts::{EventEnvelope, OrderCreatedMessage};
    use kameo::Actor;
    use crate::messaging::{ConnectionManager, InMemoryBroker};
    use crate::outbox::OutboxRecord;
    use crate::storage::{InMemoryStore, Order, OrderStore};
    use uuid::Uuid;

    async fn commit_order(store: &InMemoryStore, amount: i64) {
        commit_order_to(store, "orders", amount).await;
    }

    async fn commit_order_to(store: &InMemoryStore, queue: &str, amount: i64) {
        let order = Order::new(Uuid::new_v4(), amount);
        let envelope = EventEnvelope::new(OrderCreatedMessage {
            order_id: order.id,
            amount,
            customer_id: Some(order.customer_id),
        });
        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.enqueue_outbox(&OutboxRecord::from_envelope(queue, &envelope).unwrap())
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    async fn relay(broker: &InMemoryBroker, store: &InMemoryStore) -> OutboxRelay {
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            RetryConfig::connect(1, Duration::from_millis(1)),
        ));
        let publisher = Arc::new(Publisher::new(connections));
        publisher.declare_work_queue("orders").await.unwrap();
        OutboxRelay::new(Arc::new(store.clone()), publisher, RelayOptions {
            poll_interval: Duration::from_millis(10),
            batch_size: 2,
            backoff: RetryConfig::connect(1, Duration::from_millis(5)),
        })
    }

    fn amounts(broker: &InMemoryBroker) -> Vec<i64> {
        broker
            .messages("orders")
            .iter()
            .map(|m| {
                EventEnvelope::<OrderCreatedMessage>::from_slice(&m.body)
                    .unwrap()
                    .payload
                    .amount
            })
            .collect()
    }

    #[tokio::test]
    async fn test_relays_in_commit_order_across_batches() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let relay = relay(&broker, &store).await;

        for amount in 1..=5 {
            commit_order(&store, amount).await;
        }

        let pass = relay.relay_pending().await.unwrap();
        assert_eq!(pass, RelayPass::Drained { published: 5 });
        assert_eq!(amounts(&broker), vec![1, 2, 3, 4, 5]);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_record_pending() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let relay = relay(&broker, &store).await;

        commit_order(&store, 1).await;
        commit_order(&store, 2).await;

        broker.set_reachable(false);
        broker.kill_connections();
        let pass = relay.relay_pending().await.unwrap();
        assert!(matches!(pass, RelayPass::Blocked { published: 0, .. }));

        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());
        assert_eq!(pending[1].attempts, 0);

        broker.set_reachable(true);
        let pass = relay.relay_pending().await.unwrap();
        assert_eq!(pass, RelayPass::Drained { published: 2 });
        assert_eq!(amounts(&broker), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_wakes_on_notify_and_stops_on_shutdown() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let relay = relay(&broker, &store).await;
        let notify = relay.notifier();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(relay.run(shutdown.clone()));

        commit_order(&store, 42).await;
        notify.notify_one();

        for _ in 0..100 {
            if broker.queue_depth("orders") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(amounts(&broker), vec![42]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_record_blocks_as_permanent() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let relay = relay(&broker, &store).await;

        commit_order_to(&store, "ledger", 1).await;
        commit_order(&store, 2).await;

        let pass = relay.relay_pending().await.unwrap();
        match pass {
            RelayPass::Blocked {
                published,
                transient,
                attempts,
                error,
            } => {
                assert_eq!(published, 0);
                assert!(!transient);
                assert_eq!(attempts, 1);
                assert!(error.contains("ledger"));
            }
            other => panic!("unexpected pass: {other:?}"),
        }
        assert_eq!(broker.queue_depth("orders"), 0);
        assert_eq!(store.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_reports_refused_record_unhealthy() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let monitor = HealthMonitorActor::spawn(HealthMonitorActor::new());
        let relay = relay(&broker, &store).await.with_health(monitor.clone());

        commit_order_to(&store, "ledger", 1).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(relay.run(shutdown.clone()));

        let mut relay_health = None;
        for _ in 0..100 {
            let health = monitor.ask(GetSystemHealth).send().await.unwrap();
            if let Some(component) = health.components.get("outbox_relay") {
                relay_health = Some(component.clone());
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        let relay_health = relay_health.expect("relay never reported health");
        assert!(relay_health.status.is_unhealthy());
        assert_eq!(relay_health.details.as_deref(), Some("head record attempts: 1"));

        let health = monitor.ask(GetSystemHealth).send().await.unwrap();
        assert!(health.overall_status.is_unhealthy());
    }

    #[tokio::test]
    async fn test_run_reports_broker_outage_degraded() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let monitor = HealthMonitorActor::spawn(HealthMonitorActor::new());
        let relay = relay(&broker, &store).await.with_health(monitor.clone());

        commit_order(&store, 1).await;
        broker.set_reachable(false);
        broker.kill_connections();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(relay.run(shutdown.clone()));

        let mut status = None;
        for _ in 0..100 {
            let health = monitor.ask(GetSystemHealth).send().await.unwrap();
            if let Some(component) = health.components.get("outbox_relay") {
                status = Some(component.status.clone());
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert!(matches!(status, Some(HealthStatus::Degraded(_))));
    }
}
