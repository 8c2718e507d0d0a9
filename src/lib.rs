//! Order and invoice services connected by an event pipeline.
//!
//! The orders service commits an order together with an outbox record; a
//! relay publishes the `OrderCreated` event to a durable queue. The invoices
//! service consumes it with manual acknowledgment and creates one invoice per
//! order, however often the event is delivered.

pub mod actors;
pub mod config;
pub mod contracts;
pub mod invoices;
pub mod messaging;
pub mod metrics;
pub mod orders;
pub mod outbox;
pub mod storage;
pub mod telemetry;
pub mod utils;
