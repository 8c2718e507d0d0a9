use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::utils::IsTransient;

// ============================================================================
// Broker Abstractions
// ============================================================================
//
// The pipeline is written against these traits; the broker primitive is a
// set of durable queues with manual acknowledgment.
//
//   Transport ──connect──▶ Connection ──open_channel──▶ Channel
//
// A Channel is owned by exactly one producer or consumer role. Every delivery
// handed out by `consume` must be settled on the same channel with exactly
// one of `ack`, `requeue` or `dead_letter`. Deliveries still unsettled when
// the channel or connection goes away are redelivered by the broker.
//
// ============================================================================

pub type DeliveryTag = u64;

pub const HEADER_DELIVERY_COUNT: &str = "x-delivery-count";
pub const HEADER_DEATH_REASON: &str = "x-death-reason";
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";
pub const HEADER_EVENT_TYPE: &str = "x-event-type";
pub const HEADER_MESSAGE_ID: &str = "x-message-id";

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}.dead-letter")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// True when the connection (or the channel on top of it) is gone and a
    /// reconnect is the remedy.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BrokerError::Unreachable(_) | BrokerError::ConnectionClosed | BrokerError::ChannelClosed
        )
    }
}

impl IsTransient for BrokerError {
    fn is_transient(&self) -> bool {
        self.is_connection_loss() || matches!(self, BrokerError::Transport(_))
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Messages survive broker restarts
    pub durable: bool,
    /// Where `dead_letter` routes messages
    pub dead_letter_queue: Option<String>,
    /// Ready messages beyond this limit are rejected at publish time
    pub max_length: Option<usize>,
}

impl QueueOptions {
    /// Durable work queue paired with `<queue>.dead-letter`.
    pub fn work_queue(queue: &str) -> Self {
        Self {
            durable: true,
            dead_letter_queue: Some(dead_letter_queue_name(queue)),
            max_length: None,
        }
    }

    pub fn dead_letter() -> Self {
        Self {
            durable: true,
            dead_letter_queue: None,
            max_length: None,
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// Message handed to the broker by a publisher.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// Ask the broker to persist the message before confirming
    pub persistent: bool,
    /// Partitioning / routing key; brokers without keys ignore it
    pub key: Option<String>,
}

impl OutgoingMessage {
    pub fn persistent(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: BTreeMap::new(),
            persistent: true,
            key: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A message as delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// The broker has handed this message out before
    pub redelivered: bool,
    /// 1 on first delivery, incremented on every requeue or redelivery
    pub delivery_count: u32,
}

impl Delivery {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Deliveries for one consumer. The stream ends (or yields an error) when the
/// consumer is cancelled or the underlying connection is lost.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    /// Returns once the broker confirmed the message (publisher confirm), not
    /// when the bytes left the socket.
    async fn publish(&self, queue: &str, message: OutgoingMessage) -> Result<(), BrokerError>;

    /// Start consuming with manual acknowledgment. At most `prefetch`
    /// deliveries are outstanding (unsettled) at any time.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Return the message to its queue for another delivery.
    async fn requeue(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Route the message to the queue's dead-letter queue.
    async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), BrokerError>;

    async fn close(&self);

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    async fn close(&self);

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short label for logs ("memory", "redpanda")
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_is_transient() {
        assert!(BrokerError::ConnectionClosed.is_transient());
        assert!(BrokerError::ChannelClosed.is_connection_loss());
        assert!(!BrokerError::QueueNotFound("orders".into()).is_transient());
        assert!(!BrokerError::Rejected("full".into()).is_transient());
    }

    #[test]
    fn test_work_queue_pairs_dead_letter_queue() {
        let options = QueueOptions::work_queue("orders");
        assert!(options.durable);
        assert_eq!(options.dead_letter_queue.as_deref(), Some("orders.dead-letter"));
    }
}
