// ============================================================================
// Infrastructure Actors
// ============================================================================
//
// Reusable infrastructure actors for system concerns:
// - Health monitoring
//
// ============================================================================

// Private module declarations
mod health_monitor;

// Re-export for public API
pub use health_monitor::{GetSystemHealth, HealthMonitorActor, SystemHealth, UpdateHealth};
