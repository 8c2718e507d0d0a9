// ============================================================================
// Storage Module
// ============================================================================
//
// Persistence for orders, invoices and the outbox.
//
// - models   - Order, OrderStatus, Invoice
// - store    - store traits and StoreError
// - memory   - in-process implementation (local runs and tests)
// - postgres - sqlx implementation with migrations under ./migrations
//
// ============================================================================

mod memory;
mod models;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use models::{Invoice, Order, OrderStatus};
pub use postgres::PgStore;
pub use store::{InvoiceInsert, InvoiceStore, OrderStore, OrderTransaction, StoreError};
