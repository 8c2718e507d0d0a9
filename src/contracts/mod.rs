// ============================================================================
// Message Contracts
// ============================================================================
//
// Versioned schemas for events exchanged between the orders and invoices
// services. Encoding is a UTF-8 JSON envelope (see `event.rs`).
//
// ============================================================================

mod event;
mod order_created;

pub use event::{DeserializationError, DomainEvent, EventEnvelope};
pub use order_created::OrderCreatedMessage;
