// ============================================================================
// Transactional Outbox
// ============================================================================
//
// The order row and the intent to publish its event commit together; the
// relay turns committed intents into confirmed broker publishes. Every
// committed order therefore reaches the broker at least once, or stays
// visible as a pending record.
//
// ============================================================================

mod record;
mod relay;
mod store;

pub use record::OutboxRecord;
pub use relay::{OutboxRelay, RelayOptions, RelayPass};
pub use store::OutboxStore;
