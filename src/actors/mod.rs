// ============================================================================
// Actors Module
// ============================================================================
//
// Actor-based infrastructure for process-wide concerns.
//
// Structure:
// - core/           - Health types shared by every component
// - infrastructure/ - Concrete infrastructure actors (health monitor)
//
// Note: Message handling runs in the consumer's task pool, NOT in actors.
//       Actors are reserved for infrastructure concerns only.
//
// ============================================================================

// Private module declarations
mod core;
mod infrastructure;

// Re-export for public API
pub use self::core::{ComponentHealth, HealthStatus};
pub use infrastructure::{GetSystemHealth, HealthMonitorActor, SystemHealth, UpdateHealth};
