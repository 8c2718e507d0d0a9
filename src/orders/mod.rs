// ============================================================================
// Orders service
// ============================================================================
//
// Transactional order creation plus the HTTP routes that expose it.
//
// ============================================================================

mod http;
mod service;

pub use http::{cors, routes, CreateOrderRequest};
pub use service::{CreateOrder, DispatchMode, OrderService, OrderServiceError};
