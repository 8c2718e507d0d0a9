// ============================================================================
// Invoices service
// ============================================================================
//
// Consumes OrderCreated and creates the order's invoice.
//
// ============================================================================

mod handler;

pub use handler::OrderCreatedHandler;
