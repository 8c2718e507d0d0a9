pub mod circuit_breaker;
pub mod retry;
pub mod shutdown;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use retry::{retry_on_transient, IsTransient, RetryConfig, RetryResult};
pub use shutdown::cancel_on_shutdown_signal;
