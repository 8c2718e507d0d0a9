// ============================================================================
// Core Actor Abstractions
// ============================================================================
//
// Types shared between the health monitor and the components reporting to it.
//
// ============================================================================

mod health;

// Re-export core types
pub use health::*;
