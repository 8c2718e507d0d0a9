use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contracts::{DomainEvent, EventEnvelope};
use crate::messaging::{OutgoingMessage, HEADER_EVENT_TYPE, HEADER_MESSAGE_ID};

/// Event intent written in the same transaction as the state change it
/// describes. `payload` is the serialized envelope, published verbatim.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub queue: String,
    pub event_type: String,
    pub event_id: Uuid,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn from_envelope<E: DomainEvent>(
        queue: impl Into<String>,
        envelope: &EventEnvelope<E>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::now_v7(),
            queue: queue.into(),
            event_type: envelope.event_type.clone(),
            event_id: envelope.event_id,
            payload: envelope.to_bytes()?,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            published_at: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.published_at.is_none()
    }

    pub fn to_message(&self) -> OutgoingMessage {
        OutgoingMessage::persistent(self.payload.clone())
            .with_header(HEADER_EVENT_TYPE, self.event_type.clone())
            .with_header(HEADER_MESSAGE_ID, self.event_id.to_string())
    }
}
