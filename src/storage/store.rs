use async_trait::async_trait;
use uuid::Uuid;

use super::models::{Invoice, Order};
use crate::outbox::OutboxRecord;
use crate::utils::IsTransient;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The database cannot be reached or refused the connection
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("database error in {operation}: {message}")]
    Database { operation: &'static str, message: String },
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Database { .. })
    }
}

/// Writes that must commit together.
#[async_trait]
pub trait OrderTransaction: Send {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn enqueue_outbox(&mut self, record: &OutboxRecord) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn OrderTransaction>, StoreError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceInsert {
    Created(Invoice),
    /// An invoice for the order already existed; nothing was written
    AlreadyExists(Invoice),
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Create the invoice unless one already exists for its order.
    async fn create_for_order(&self, invoice: &Invoice) -> Result<InvoiceInsert, StoreError>;

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Invoice>, StoreError>;
}
