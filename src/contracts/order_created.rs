use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{DeserializationError, DomainEvent};

/// Emitted by the orders service once an order row exists.
///
/// `orderId` and `amount` are required; `customerId` is informational.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedMessage {
    pub order_id: Uuid,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<Uuid>,
}

impl DomainEvent for OrderCreatedMessage {
    fn event_type() -> &'static str {
        "OrderCreated"
    }

    fn event_version() -> u32 {
        1
    }

    fn validate(&self) -> Result<(), DeserializationError> {
        if self.amount <= 0 {
            return Err(DeserializationError::InvalidField {
                field: "amount",
                reason: format!("must be positive, got {}", self.amount),
            });
        }
        Ok(())
    }
}
