use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Event Envelope - wire format shared by every queue
// ============================================================================
//
// {
//   "eventId": "0190...",
//   "eventType": "OrderCreated",
//   "version": 1,
//   "occurredAt": "2025-01-01T00:00:00Z",
//   "payload": { ... }
// }
//
// Unknown fields are ignored at every level. Required fields are never
// defaulted: a missing field is a `DeserializationError`.
//
// ============================================================================

/// Contract implemented by every event type that travels over a queue.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn event_type() -> &'static str
    where
        Self: Sized;

    /// Highest schema version this build understands.
    fn event_version() -> u32
    where
        Self: Sized,
    {
        1
    }

    /// Field-level checks that serde cannot express.
    fn validate(&self) -> Result<(), DeserializationError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializationError {
    #[error("message body is empty")]
    Empty,

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("expected event type {expected}, found {found}")]
    UnexpectedEventType { expected: &'static str, found: String },

    #[error("unsupported {event_type} version {version} (max {supported})")]
    UnsupportedVersion {
        event_type: String,
        version: u32,
        supported: u32,
    },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<E> {
    pub event_id: Uuid,
    pub event_type: String,
    pub version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: E,
}

impl<E: DomainEvent> EventEnvelope<E> {
    pub fn new(payload: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: E::event_type().to_string(),
            version: E::event_version(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode and validate a delivery body.
    pub fn from_slice(body: &[u8]) -> Result<Self, DeserializationError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(DeserializationError::Empty);
        }

        let raw: EventEnvelope<serde_json::Value> = serde_json::from_slice(body)?;

        if raw.event_type != E::event_type() {
            return Err(DeserializationError::UnexpectedEventType {
                expected: E::event_type(),
                found: raw.event_type,
            });
        }
        if raw.version == 0 || raw.version > E::event_version() {
            return Err(DeserializationError::UnsupportedVersion {
                event_type: raw.event_type,
                version: raw.version,
                supported: E::event_version(),
            });
        }

        let payload: E = serde_json::from_value(raw.payload)?;
        payload.validate()?;

        Ok(Self {
            event_id: raw.event_id,
            event_type: raw.event_type,
            version: raw.version,
            occurred_at: raw.occurred_at,
            payload,
        })
    }
}
