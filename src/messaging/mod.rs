// ============================================================================
// Messaging Module
// ============================================================================
//
// Producer/consumer protocol over a broker with durable queues and manual
// acknowledgment.
//
// - broker      - Transport / Connection / Channel traits and wire types
// - memory      - in-process broker (default for local runs and tests)
// - redpanda    - Kafka-protocol broker via rdkafka
// - connection  - ConnectionManager: one connection, named channels
// - publisher   - confirmed, ordered publishing behind a circuit breaker
// - consumer    - dispatcher with ack / requeue / dead-letter policy
//
// ============================================================================

mod broker;
mod connection;
mod consumer;
mod memory;
mod offsets;
mod publisher;
mod redpanda;

pub use broker::{
    dead_letter_queue_name, BrokerError, Channel, Connection, Delivery, DeliveryStream,
    DeliveryTag, OutgoingMessage, QueueOptions, Transport, HEADER_DEATH_REASON,
    HEADER_DELIVERY_COUNT, HEADER_EVENT_TYPE, HEADER_MESSAGE_ID, HEADER_ORIGINAL_QUEUE,
};
pub use connection::{ConnectionError, ConnectionManager};
pub use consumer::{
    decide, ConsumeOptions, Consumer, ConsumerError, DeliveryContext, Disposition, HandlerError,
    MessageHandler, ProcessingFailure,
};
pub use memory::{InMemoryBroker, QueuedMessage};
pub use publisher::{PublishError, Publisher, PUBLISHER_CHANNEL};
pub use redpanda::{RedpandaConfig, RedpandaTransport};
