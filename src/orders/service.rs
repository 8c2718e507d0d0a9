use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::contracts::{EventEnvelope, OrderCreatedMessage};
use crate::messaging::{PublishError, Publisher};
use crate::metrics::Metrics;
use crate::outbox::OutboxRecord;
use crate::storage::{Order, OrderStore, OrderTransaction, StoreError};

// ============================================================================
// Order Service
// ============================================================================
//
// Creates an order and dispatches its OrderCreated event.
//
// Outbox (default):
//   BEGIN → INSERT order → INSERT outbox record → COMMIT → wake relay
//   The event is published asynchronously, at least once.
//
// Direct:
//   BEGIN → INSERT order → publish (await confirm) → COMMIT
//   A failed publish rolls the order back and surfaces PublishError.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Outbox,
    Direct,
}

impl DispatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchMode::Outbox => "outbox",
            DispatchMode::Direct => "direct",
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outbox" => Ok(DispatchMode::Outbox),
            "direct" => Ok(DispatchMode::Direct),
            other => Err(format!("unknown dispatch mode '{other}' (expected outbox or direct)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub amount: i64,
    pub customer_id: Option<Uuid>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrderServiceError {
    #[error("invalid order: {0}")]
    Invalid(String),

    #[error("order event could not be published: {0}")]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct OrderService {
    store: Arc<dyn OrderStore>,
    publisher: Arc<Publisher>,
    queue: String,
    mode: DispatchMode,
    default_customer: Uuid,
    relay_notify: Option<Arc<Notify>>,
    metrics: Option<Arc<Metrics>>,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        publisher: Arc<Publisher>,
        queue: impl Into<String>,
        mode: DispatchMode,
        default_customer: Uuid,
    ) -> Self {
        Self {
            store,
            publisher,
            queue: queue.into(),
            mode,
            default_customer,
            relay_notify: None,
            metrics: None,
        }
    }

    /// Wake the outbox relay after each commit.
    pub fn with_relay_notify(mut self, notify: Arc<Notify>) -> Self {
        self.relay_notify = Some(notify);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn create_order(&self, command: CreateOrder) -> Result<Order, OrderServiceError> {
        if command.amount <= 0 {
            return Err(OrderServiceError::Invalid(format!(
                "amount must be a positive integer, got {}",
                command.amount
            )));
        }

        let order = Order::new(
            command.customer_id.unwrap_or(self.default_customer),
            command.amount,
        );
        let envelope = EventEnvelope::new(OrderCreatedMessage {
            order_id: order.id,
            amount: order.amount,
            customer_id: Some(order.customer_id),
        });

        tracing::info!(
            order_id = %order.id,
            amount = order.amount,
            mode = self.mode.as_str(),
            "Creating order"
        );

        let mut tx = self.store.begin().await?;
        let result = match self.mode {
            DispatchMode::Outbox => self.write_with_outbox(tx.as_mut(), &order, &envelope).await,
            DispatchMode::Direct => self.write_and_publish(tx.as_mut(), &order, &envelope).await,
        };

        if let Err(e) = result {
            if let Err(rollback) = tx.rollback().await {
                tracing::error!(order_id = %order.id, error = %rollback, "Rollback failed");
            }
            tracing::warn!(order_id = %order.id, error = %e, "Order not created");
            return Err(e);
        }

        if let Err(e) = tx.commit().await {
            if self.mode == DispatchMode::Direct {
                // The event is already on the queue; consumers look the order up by id
                tracing::error!(
                    order_id = %order.id,
                    event_id = %envelope.event_id,
                    error = %e,
                    "Commit failed after OrderCreated was published"
                );
            }
            return Err(e.into());
        }

        if let Some(notify) = &self.relay_notify {
            notify.notify_one();
        }
        if let Some(metrics) = &self.metrics {
            metrics.orders_created.with_label_values(&[self.mode.as_str()]).inc();
        }

        tracing::info!(order_id = %order.id, event_id = %envelope.event_id, "Order created");
        Ok(order)
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Option<Order>, OrderServiceError> {
        Ok(self.store.get_order(id).await?)
    }

    async fn write_with_outbox(
        &self,
        tx: &mut dyn OrderTransaction,
        order: &Order,
        envelope: &EventEnvelope<OrderCreatedMessage>,
    ) -> Result<(), OrderServiceError> {
        tx.insert_order(order).await?;
        tx.enqueue_outbox(&OutboxRecord::from_envelope(&self.queue, envelope)?)
            .await?;
        Ok(())
    }

    async fn write_and_publish(
        &self,
        tx: &mut dyn OrderTransaction,
        order: &Order,
        envelope: &EventEnvelope<OrderCreatedMessage>,
    ) -> Result<(), OrderServiceError> {
        tx.insert_order(order).await?;
        self.publisher.publish(&self.queue, envelope).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{ConnectionManager, InMemoryBroker};
    use crate::outbox::OutboxStore;
    use crate::storage::InMemoryStore;
    use crate::utils::RetryConfig;
    use std::time::Duration;

    async fn service(
        broker: &InMemoryBroker,
        store: &InMemoryStore,
        mode: DispatchMode,
    ) -> OrderService {
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            RetryConfig::connect(1, Duration::from_millis(1)),
        ));
        let publisher = Arc::new(Publisher::new(connections));
        publisher.declare_work_queue("orders").await.unwrap();
        OrderService::new(Arc::new(store.clone()), publisher, "orders", mode, Uuid::nil())
    }

    #[test]
    fn test_dispatch_mode_parsing() {
        assert_eq!("outbox".parse::<DispatchMode>().unwrap(), DispatchMode::Outbox);
        assert_eq!(" Direct ".parse::<DispatchMode>().unwrap(), DispatchMode::Direct);
        assert!("fire-and-forget".parse::<DispatchMode>().is_err());
    }

    #[tokio::test]
    async fn test_outbox_mode_commits_order_with_pending_event() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let service = service(&broker, &store, DispatchMode::Outbox).await;

        let order = service
            .create_order(CreateOrder { amount: 100, customer_id: None })
            .await
            .unwrap();

        assert_eq!(order.customer_id, Uuid::nil());
        assert_eq!(store.get_order(order.id).await.unwrap(), Some(order.clone()));
        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        // Nothing reaches the broker until the relay runs
        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[tokio::test]
    async fn test_outbox_mode_succeeds_while_broker_is_down() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let service = service(&broker, &store, DispatchMode::Outbox).await;
        broker.set_reachable(false);
        broker.kill_connections();

        service
            .create_order(CreateOrder { amount: 10, customer_id: None })
            .await
            .unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_direct_mode_publishes_before_commit() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let service = service(&broker, &store, DispatchMode::Direct).await;

        let order = service
            .create_order(CreateOrder { amount: 100, customer_id: None })
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("orders"), 1);
        assert!(store.get_order(order.id).await.unwrap().is_some());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_direct_mode_publish_failure_rolls_back() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let service = service(&broker, &store, DispatchMode::Direct).await;
        broker.set_reachable(false);
        broker.kill_connections();

        let err = service
            .create_order(CreateOrder { amount: 100, customer_id: None })
            .await
            .unwrap_err();

        assert!(matches!(err, OrderServiceError::Publish(_)));
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_positive_amount_is_rejected() {
        let broker = InMemoryBroker::new();
        let store = InMemoryStore::new();
        let service = service(&broker, &store, DispatchMode::Outbox).await;

        for amount in [0, -5] {
            let err = service
                .create_order(CreateOrder { amount, customer_id: None })
                .await
                .unwrap_err();
            assert!(matches!(err, OrderServiceError::Invalid(_)));
        }
        assert_eq!(store.order_count().await, 0);
    }
}
