use std::sync::Arc;
use tokio::sync::Mutex;

use super::broker::{
    dead_letter_queue_name, BrokerError, OutgoingMessage, QueueOptions, HEADER_EVENT_TYPE,
    HEADER_MESSAGE_ID,
};
use super::connection::{ConnectionError, ConnectionManager};
use crate::contracts::{DomainEvent, EventEnvelope};
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, IsTransient};

// ============================================================================
// Publisher
// ============================================================================
//
// Hands serialized events to a named queue over the publisher's own channel.
// `publish` returns Ok only after the broker confirmed the message.
//
// Publishes are serialized on the channel, so events published by one
// Publisher to one queue keep their order. Connection-level failures move
// the circuit breaker towards open; caller mistakes (unknown queue, rejected
// payload) do not.
//
// ============================================================================

pub const PUBLISHER_CHANNEL: &str = "publisher";

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher channel closed")]
    ChannelClosed,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("circuit breaker open, broker considered unavailable")]
    CircuitOpen,

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("broker transport error: {0}")]
    Transport(String),
}

impl PublishError {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            PublishError::ChannelClosed => "channel_closed",
            PublishError::QueueNotFound(_) => "queue_not_found",
            PublishError::Rejected(_) => "rejected",
            PublishError::CircuitOpen => "circuit_open",
            PublishError::Serialization(_) => "serialization",
            PublishError::Connection(_) => "connection",
            PublishError::Transport(_) => "transport",
        }
    }
}

impl From<BrokerError> for PublishError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::QueueNotFound(queue) => PublishError::QueueNotFound(queue),
            BrokerError::Rejected(reason) => PublishError::Rejected(reason),
            BrokerError::ChannelClosed | BrokerError::ConnectionClosed => PublishError::ChannelClosed,
            BrokerError::Unreachable(_) => PublishError::Connection(ConnectionError::Broker(err)),
            BrokerError::UnknownDeliveryTag(_) | BrokerError::Transport(_) => {
                PublishError::Transport(err.to_string())
            }
        }
    }
}

impl IsTransient for PublishError {
    fn is_transient(&self) -> bool {
        !matches!(
            self,
            PublishError::QueueNotFound(_) | PublishError::Rejected(_) | PublishError::Serialization(_)
        )
    }
}

pub struct Publisher {
    connections: Arc<ConnectionManager>,
    channel_name: String,
    breaker: CircuitBreaker,
    metrics: Option<Arc<Metrics>>,
    // Held across a publish so messages leave in call order
    in_order: Mutex<()>,
}

impl Publisher {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            channel_name: PUBLISHER_CHANNEL.to_string(),
            breaker: CircuitBreaker::new("publisher", CircuitBreakerConfig::default()),
            metrics: None,
            in_order: Mutex::new(()),
        }
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new("publisher", config);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle to the breaker, for the health monitor
    pub fn circuit_breaker(&self) -> CircuitBreaker {
        self.breaker.clone()
    }

    /// Declare `queue` as a durable work queue together with its
    /// dead-letter queue. Safe to call repeatedly.
    pub async fn declare_work_queue(&self, queue: &str) -> Result<(), PublishError> {
        let channel = self.connections.open_channel(&self.channel_name).await?;
        channel
            .declare_queue(&dead_letter_queue_name(queue), &QueueOptions::dead_letter())
            .await?;
        channel
            .declare_queue(queue, &QueueOptions::work_queue(queue))
            .await?;
        tracing::info!(queue, "Declared work queue");
        Ok(())
    }

    /// Serialize `envelope` and publish it persistently to `queue`.
    pub async fn publish<E: DomainEvent>(
        &self,
        queue: &str,
        envelope: &EventEnvelope<E>,
    ) -> Result<(), PublishError> {
        let body = envelope.to_bytes()?;
        let message = OutgoingMessage::persistent(body)
            .with_header(HEADER_EVENT_TYPE, envelope.event_type.clone())
            .with_header(HEADER_MESSAGE_ID, envelope.event_id.to_string());

        self.publish_raw(queue, message).await?;
        tracing::debug!(
            queue,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "Published event"
        );
        Ok(())
    }

    /// Publish an already serialized message.
    pub async fn publish_raw(&self, queue: &str, message: OutgoingMessage) -> Result<(), PublishError> {
        let event_type = message
            .headers
            .get(HEADER_EVENT_TYPE)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let result = self.send(queue, message).await;

        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(()) => metrics.record_published(queue, &event_type),
                Err(e) => metrics.record_publish_failure(queue, e.reason()),
            }
        }
        if let Err(e) = &result {
            tracing::warn!(queue, error = %e, "Publish failed");
        }
        result
    }

    async fn send(&self, queue: &str, mut message: OutgoingMessage) -> Result<(), PublishError> {
        // Unkeyed messages share the queue's key so they stay on one partition
        if message.key.is_none() {
            message = message.with_key(queue);
        }
        let _in_order = self.in_order.lock().await;

        let outcome = self
            .breaker
            .call(self.try_send(queue, message), |e: &PublishError| e.is_transient())
            .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(CircuitBreakerError::CircuitOpen) => Err(PublishError::CircuitOpen),
            Err(CircuitBreakerError::OperationFailed(e)) => {
                if matches!(e, PublishError::ChannelClosed | PublishError::Transport(_)) {
                    self.connections.discard_channel(&self.channel_name).await;
                }
                Err(e)
            }
        }
    }

    async fn try_send(&self, queue: &str, message: OutgoingMessage) -> Result<(), PublishError> {
        let channel = self.connections.open_channel(&self.channel_name).await?;
        channel.publish(queue, message).await?;
        Ok(())
    }
}
