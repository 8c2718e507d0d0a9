use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{Invoice, Order};
use super::store::{InvoiceInsert, InvoiceStore, OrderStore, OrderTransaction, StoreError};
use crate::outbox::{OutboxRecord, OutboxStore};

// ============================================================================
// In-memory store
// ============================================================================
//
// Orders, outbox records and invoices behind one lock. Transactions buffer
// their writes and apply them atomically on commit. `set_available(false)`
// makes every operation fail with `Unavailable`, standing in for a database
// outage.
//
// ============================================================================

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    // Commit order is FIFO order
    outbox: Vec<OutboxRecord>,
    invoices: HashMap<Uuid, Invoice>,
}

#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn invoice_count(&self) -> usize {
        self.state.lock().await.invoices.len()
    }

    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.outbox.clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        }
    }
}

struct MemoryTransaction {
    store: InMemoryStore,
    orders: Vec<Order>,
    outbox: Vec<OutboxRecord>,
}

#[async_trait]
impl OrderTransaction for MemoryTransaction {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.store.check_available()?;
        if order.amount <= 0 {
            return Err(StoreError::Invalid(format!("amount must be positive, got {}", order.amount)));
        }
        self.orders.push(order.clone());
        Ok(())
    }

    async fn enqueue_outbox(&mut self, record: &OutboxRecord) -> Result<(), StoreError> {
        self.store.check_available()?;
        self.outbox.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { store, orders, outbox } = *self;
        store.check_available()?;
        let mut state = store.state.lock().await;

        if let Some(existing) = orders.iter().find(|o| state.orders.contains_key(&o.id)) {
            return Err(StoreError::Conflict(format!("order {} already exists", existing.id)));
        }
        for order in orders {
            state.orders.insert(order.id, order);
        }
        state.outbox.extend(outbox);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        tracing::debug!(
            orders = self.orders.len(),
            outbox = self.outbox.len(),
            "Rolled back in-memory transaction"
        );
        Ok(())
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn OrderTransaction>, StoreError> {
        self.check_available()?;
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            orders: Vec::new(),
            outbox: Vec::new(),
        }))
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .outbox
            .iter()
            .filter(|r| r.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(record) = state.outbox.iter_mut().find(|r| r.id == id) {
            record.published_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(record) = state.outbox.iter_mut().find(|r| r.id == id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .outbox
            .iter()
            .filter(|r| r.is_pending())
            .count())
    }
}

#[async_trait]
impl InvoiceStore for InMemoryStore {
    async fn create_for_order(&self, invoice: &Invoice) -> Result<InvoiceInsert, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.invoices.get(&invoice.order_id) {
            return Ok(InvoiceInsert::AlreadyExists(existing.clone()));
        }
        state.invoices.insert(invoice.order_id, invoice.clone());
        Ok(InvoiceInsert::Created(invoice.clone()))
    }

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Invoice>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.invoices.get(&order_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{EventEnvelope, OrderCreatedMessage};

    fn record_for(order: &Order) -> OutboxRecord {
        let envelope = EventEnvelope::new(OrderCreatedMessage {
            order_id: order.id,
            amount: order.amount,
            customer_id: Some(order.customer_id),
        });
        OutboxRecord::from_envelope("orders", &envelope).unwrap()
    }

    #[tokio::test]
    async fn test_commit_applies_order_and_outbox_together() {
        let store = InMemoryStore::new();
        let order = Order::new(Uuid::new_v4(), 100);

        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.enqueue_outbox(&record_for(&order)).await.unwrap();
        assert_eq!(store.order_count().await, 0);

        tx.commit().await.unwrap();
        assert_eq!(store.get_order(order.id).await.unwrap(), Some(order));
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let store = InMemoryStore::new();
        let order = Order::new(Uuid::new_v4(), 100);

        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.enqueue_outbox(&record_for(&order)).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_outage_fails_commit() {
        let store = InMemoryStore::new();
        let order = Order::new(Uuid::new_v4(), 100);

        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        store.set_available(false);

        assert!(matches!(tx.commit().await, Err(StoreError::Unavailable(_))));
        store.set_available(true);
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_invoice_creation_is_idempotent_per_order() {
        let store = InMemoryStore::new();
        let order_id = Uuid::new_v4();

        let first = store.create_for_order(&Invoice::for_order(order_id)).await.unwrap();
        let InvoiceInsert::Created(created) = first else {
            panic!("first insert should create");
        };

        let second = store.create_for_order(&Invoice::for_order(order_id)).await.unwrap();
        assert_eq!(second, InvoiceInsert::AlreadyExists(created.clone()));
        assert_eq!(store.invoice_count().await, 1);
        assert_eq!(store.find_by_order(order_id).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn test_outbox_failure_bookkeeping() {
        let store = InMemoryStore::new();
        let order = Order::new(Uuid::new_v4(), 5);
        let record = record_for(&order);

        let mut tx = store.begin().await.unwrap();
        tx.enqueue_outbox(&record).await.unwrap();
        tx.commit().await.unwrap();

        store.record_failure(record.id, "broker down").await.unwrap();
        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("broker down"));

        store.mark_published(record.id).await.unwrap();
        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }
}
