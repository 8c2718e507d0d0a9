//! Postgres-backed stores.
//!
//! One `PgStore` implements the order, outbox and invoice stores over a
//! shared `PgPool`. Order rows and outbox rows are written in the same
//! database transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check violation) | `23514` | `Invalid` |
//! | Database (other) | Any other | `Database` |
//! | Io / Tls / PoolTimedOut / PoolClosed | N/A | `Unavailable` |
//! | Other | N/A | `Database` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::models::{Invoice, Order, OrderStatus};
use super::store::{InvoiceInsert, InvoiceStore, OrderStore, OrderTransaction, StoreError};
use crate::outbox::{OutboxRecord, OutboxStore};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database {
                operation: "migrate",
                message: e.to_string(),
            })?;

        tracing::info!("Connected to Postgres, migrations applied");
        Ok(Self::new(pool))
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = format!("{} failed: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(message),
                Some("23514") => StoreError::Invalid(message),
                _ => StoreError::Database { operation, message },
            }
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("{operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("{operation}: {e}")),
        sqlx::Error::PoolTimedOut => StoreError::Unavailable(format!("{operation}: pool timed out")),
        sqlx::Error::PoolClosed => StoreError::Unavailable(format!("{operation}: pool closed")),
        other => StoreError::Database {
            operation,
            message: other.to_string(),
        },
    }
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_order", e);
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(Order {
        id: row.try_get("id").map_err(decode)?,
        customer_id: row.try_get("customer_id").map_err(decode)?,
        amount: row.try_get("amount").map_err(decode)?,
        status: status.parse::<OrderStatus>().map_err(StoreError::Invalid)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_invoice", e);
    Ok(Invoice {
        id: row.try_get("id").map_err(decode)?,
        order_id: row.try_get("order_id").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_outbox", e);
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    Ok(OutboxRecord {
        id: row.try_get("id").map_err(decode)?,
        queue: row.try_get("queue").map_err(decode)?,
        event_type: row.try_get("event_type").map_err(decode)?,
        event_id: row.try_get("event_id").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        published_at: row.try_get::<Option<DateTime<Utc>>, _>("published_at").map_err(decode)?,
    })
}

pub struct PgOrderTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OrderTransaction for PgOrderTransaction {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, customer_id, amount, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(order.id)
        .bind(order.customer_id)
        .bind(order.amount)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;
        Ok(())
    }

    async fn enqueue_outbox(&mut self, record: &OutboxRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (id, queue, event_type, event_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(&record.queue)
        .bind(&record.event_type)
        .bind(record.event_id)
        .bind(&record.payload)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue_outbox", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn OrderTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PgOrderTransaction { tx }))
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            "SELECT id, customer_id, amount, status, created_at FROM orders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_order", e))?;

        row.as_ref().map(order_from_row).transpose()
    }
}

// One relay per database: FIFO order comes from `seq`, which only holds
// while a single relay publishes.
#[async_trait]
impl OutboxStore for PgStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue, event_type, event_id, payload, created_at,
                   attempts, last_error, published_at
            FROM outbox_messages
            WHERE published_at IS NULL
            ORDER BY seq ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_pending", e))?;

        rows.iter().map(outbox_from_row).collect()
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox_messages SET published_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_messages SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox_messages WHERE published_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_count", e))?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl InvoiceStore for PgStore {
    async fn create_for_order(&self, invoice: &Invoice) -> Result<InvoiceInsert, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO invoices (id, order_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_id) DO NOTHING
            RETURNING id, order_id, created_at
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.order_id)
        .bind(invoice.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_invoice", e))?;

        if let Some(row) = inserted {
            return Ok(InvoiceInsert::Created(invoice_from_row(&row)?));
        }

        match self.find_by_order(invoice.order_id).await? {
            Some(existing) => Ok(InvoiceInsert::AlreadyExists(existing)),
            None => Err(StoreError::Database {
                operation: "create_invoice",
                message: format!("invoice for order {} neither inserted nor found", invoice.order_id),
            }),
        }
    }

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Invoice>, StoreError> {
        let row = sqlx::query("SELECT id, order_id, created_at FROM invoices WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_invoice", e))?;

        row.as_ref().map(invoice_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_unavailable() {
        assert!(matches!(
            map_sqlx_error("begin_transaction", sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("begin_transaction", sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn test_other_errors_are_database_errors() {
        let err = map_sqlx_error("get_order", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database { operation: "get_order", .. }));
    }
}
