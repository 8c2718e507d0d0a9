use async_trait::async_trait;
use uuid::Uuid;

use super::OutboxRecord;
use crate::storage::StoreError;

/// Relay-side view of the outbox table. Records are written by
/// `OrderTransaction::enqueue_outbox`.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unpublished records, oldest first.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError>;

    /// Count a failed publish attempt and remember why it failed.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn pending_count(&self) -> Result<usize, StoreError>;
}
