use async_trait::async_trait;
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
    Offset, TopicPartitionList,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::broker::{
    dead_letter_queue_name, BrokerError, Channel, Connection, Delivery, DeliveryStream,
    DeliveryTag, OutgoingMessage, QueueOptions, Transport, HEADER_DEATH_REASON,
    HEADER_DELIVERY_COUNT, HEADER_ORIGINAL_QUEUE,
};
use super::offsets::OffsetTracker;

// ============================================================================
// Redpanda (Kafka protocol) transport
// ============================================================================
//
// Maps the queue-with-manual-ack primitive onto topics:
//
// - publish     → idempotent produce with acks=all, awaiting the delivery report
// - consume     → one StreamConsumer per call, auto commit disabled
// - ack         → commit the lowest contiguous settled offset (OffsetTracker)
// - requeue     → re-produce with x-delivery-count, then ack the original
// - dead_letter → produce to the dead-letter topic, then ack the original
//
// Records whose offsets were never committed are read again by the next
// consumer in the group, which gives at-least-once redelivery after a crash.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RedpandaConfig {
    pub brokers: String,
    pub group_id: String,
    pub message_timeout: Duration,
    pub partitions: i32,
    pub replication: i32,
}

impl RedpandaConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            message_timeout: Duration::from_secs(5),
            partitions: 1,
            replication: 1,
        }
    }

    fn base(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config
    }
}

fn map_kafka_error(queue: &str, err: KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::UnknownTopic) => {
            BrokerError::QueueNotFound(queue.to_string())
        }
        Some(RDKafkaErrorCode::QueueFull)
        | Some(RDKafkaErrorCode::MessageSizeTooLarge)
        | Some(RDKafkaErrorCode::PolicyViolation) => BrokerError::Rejected(err.to_string()),
        Some(RDKafkaErrorCode::AllBrokersDown) | Some(RDKafkaErrorCode::BrokerTransportFailure) => {
            BrokerError::Unreachable(err.to_string())
        }
        _ => BrokerError::Transport(err.to_string()),
    }
}

pub struct RedpandaTransport {
    config: RedpandaConfig,
}

impl RedpandaTransport {
    pub fn new(config: RedpandaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for RedpandaTransport {
    fn name(&self) -> &'static str {
        "redpanda"
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let producer: FutureProducer = self
            .config
            .base()
            .set("message.timeout.ms", self.config.message_timeout.as_millis().to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        // Metadata fetch blocks; it doubles as the reachability check.
        let probe = producer.clone();
        let timeout = self.config.message_timeout;
        tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?
        .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        tracing::info!(brokers = %self.config.brokers, "Connected to Redpanda");

        Ok(Arc::new(RedpandaConnection {
            config: self.config.clone(),
            producer,
            closed: CancellationToken::new(),
        }))
    }
}

struct RedpandaConnection {
    config: RedpandaConfig,
    producer: FutureProducer,
    closed: CancellationToken,
}

#[async_trait]
impl Connection for RedpandaConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(Arc::new(RedpandaChannel {
            shared: Arc::new(ChannelShared {
                config: self.config.clone(),
                producer: self.producer.clone(),
                closed: self.closed.child_token(),
                next_id: AtomicU64::new(1),
                consumers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                dead_letter_targets: Mutex::new(HashMap::new()),
            }),
        }))
    }

    async fn close(&self) {
        self.closed.cancel();
        let producer = self.producer.clone();
        let timeout = self.config.message_timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;
        match flushed {
            Ok(Ok(())) => tracing::info!("Redpanda connection closed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Producer flush failed on close"),
            Err(e) => tracing::warn!(error = %e, "Producer flush task failed"),
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

struct ConsumerEntry {
    consumer: Arc<StreamConsumer>,
    offsets: OffsetTracker,
}

struct PendingDelivery {
    consumer_id: u64,
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<String>,
    body: Vec<u8>,
    headers: BTreeMap<String, String>,
    delivery_count: u32,
    _permit: OwnedSemaphorePermit,
}

/// Copy of an unsettled record, re-produced by requeue and dead_letter.
struct Replay {
    topic: String,
    key: Option<String>,
    body: Vec<u8>,
    headers: BTreeMap<String, String>,
    delivery_count: u32,
}

struct ChannelShared {
    config: RedpandaConfig,
    producer: FutureProducer,
    closed: CancellationToken,
    next_id: AtomicU64,
    consumers: Mutex<HashMap<u64, ConsumerEntry>>,
    pending: Mutex<HashMap<DeliveryTag, PendingDelivery>>,
    dead_letter_targets: Mutex<HashMap<String, String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owned copy of a received record; `BorrowedMessage` cannot outlive the poll.
struct Received {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<String>,
    body: Vec<u8>,
    headers: BTreeMap<String, String>,
}

impl Received {
    fn from_message(message: &BorrowedMessage<'_>) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|header| {
                        let value = std::str::from_utf8(header.value?).ok()?;
                        Some((header.key.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .and_then(|k| std::str::from_utf8(k).ok())
                .map(str::to_string),
            body: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
        }
    }
}

impl ChannelShared {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        body: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), BrokerError> {
        let mut owned = OwnedHeaders::new();
        for (name, value) in headers {
            owned = owned.insert(Header {
                key: name.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(body).headers(owned);
        if let Some(key) = key {
            record = record.key(key);
        }

        self.producer
            .send(record, Timeout::After(self.config.message_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| map_kafka_error(topic, e))
    }

    fn register(&self, consumer_id: u64, received: Received, permit: OwnedSemaphorePermit) -> Delivery {
        let prior = received
            .headers
            .get(HEADER_DELIVERY_COUNT)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let delivery_count = prior + 1;
        let tag = self.next_id.fetch_add(1, Ordering::SeqCst);

        if let Some(entry) = lock(&self.consumers).get_mut(&consumer_id) {
            entry.offsets.track(received.partition, received.offset);
        }

        let delivery = Delivery {
            tag,
            queue: received.topic.clone(),
            body: received.body.clone(),
            headers: received.headers.clone(),
            redelivered: delivery_count > 1,
            delivery_count,
        };

        lock(&self.pending).insert(
            tag,
            PendingDelivery {
                consumer_id,
                topic: received.topic,
                partition: received.partition,
                offset: received.offset,
                key: received.key,
                body: received.body,
                headers: received.headers,
                delivery_count,
                _permit: permit,
            },
        );

        delivery
    }

    fn replay(&self, tag: DeliveryTag) -> Result<Replay, BrokerError> {
        let pending = lock(&self.pending);
        let entry = pending.get(&tag).ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        Ok(Replay {
            topic: entry.topic.clone(),
            key: entry.key.clone(),
            body: entry.body.clone(),
            headers: entry.headers.clone(),
            delivery_count: entry.delivery_count,
        })
    }

    fn settle(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let entry = lock(&self.pending)
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;

        let mut consumers = lock(&self.consumers);
        let Some(consumer) = consumers.get_mut(&entry.consumer_id) else {
            return Err(BrokerError::ChannelClosed);
        };
        if let Some(next) = consumer.offsets.complete(entry.partition, entry.offset) {
            let mut positions = TopicPartitionList::new();
            positions
                .add_partition_offset(&entry.topic, entry.partition, Offset::Offset(next))
                .map_err(|e| map_kafka_error(&entry.topic, e))?;
            consumer
                .consumer
                .commit(&positions, CommitMode::Async)
                .map_err(|e| map_kafka_error(&entry.topic, e))?;
        }
        Ok(())
    }
}

pub struct RedpandaChannel {
    shared: Arc<ChannelShared>,
}

#[async_trait]
impl Channel for RedpandaChannel {
    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;

        let admin: AdminClient<DefaultClientContext> = self
            .shared
            .config
            .base()
            .create()
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        let topic = NewTopic::new(
            queue,
            self.shared.config.partitions,
            TopicReplication::Fixed(self.shared.config.replication),
        );
        let results = admin
            .create_topics(&[topic], &AdminOptions::new())
            .await
            .map_err(|e| map_kafka_error(queue, e))?;

        for result in results {
            match result {
                Ok(name) => tracing::info!(topic = %name, "Created topic"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(BrokerError::Transport(format!("create topic {name}: {code}")));
                }
            }
        }

        if options.max_length.is_some() {
            tracing::debug!(topic = %queue, "max_length is not enforced by Redpanda topics");
        }
        if let Some(dlq) = &options.dead_letter_queue {
            lock(&self.shared.dead_letter_targets).insert(queue.to_string(), dlq.clone());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutgoingMessage) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        self.shared
            .produce(queue, message.key.as_deref(), &message.body, &message.headers)
            .await
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        self.shared.ensure_open()?;

        let consumer: StreamConsumer = self
            .shared
            .config
            .base()
            .set("group.id", &self.shared.config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        consumer
            .subscribe(&[queue])
            .map_err(|e| map_kafka_error(queue, e))?;

        let consumer = Arc::new(consumer);
        let consumer_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.consumers).insert(
            consumer_id,
            ConsumerEntry {
                consumer: consumer.clone(),
                offsets: OffsetTracker::default(),
            },
        );

        tracing::info!(
            topic = %queue,
            group_id = %self.shared.config.group_id,
            prefetch,
            "Subscribed to Redpanda topic"
        );

        let permits = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
        let shared = self.shared.clone();

        let stream = futures_util::stream::unfold(
            (shared, consumer, permits, false),
            move |(shared, consumer, permits, finished)| async move {
                if finished {
                    return None;
                }

                let permit = tokio::select! {
                    _ = shared.closed.cancelled() => None,
                    permit = permits.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    return Some((Err(BrokerError::ChannelClosed), (shared, consumer, permits, true)));
                };

                let received = tokio::select! {
                    _ = shared.closed.cancelled() => None,
                    result = consumer.recv() => Some(result.map(|message| Received::from_message(&message))),
                };

                match received {
                    None => Some((Err(BrokerError::ChannelClosed), (shared, consumer, permits, true))),
                    Some(Err(e)) => {
                        let err = BrokerError::Transport(e.to_string());
                        Some((Err(err), (shared, consumer, permits, true)))
                    }
                    Some(Ok(received)) => {
                        let delivery = shared.register(consumer_id, received, permit);
                        Some((Ok(delivery), (shared, consumer, permits, false)))
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        self.shared.settle(tag)
    }

    async fn requeue(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        let mut replay = self.shared.replay(tag)?;
        replay
            .headers
            .insert(HEADER_DELIVERY_COUNT.to_string(), replay.delivery_count.to_string());

        self.shared
            .produce(&replay.topic, replay.key.as_deref(), &replay.body, &replay.headers)
            .await?;
        self.shared.settle(tag)
    }

    async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        let mut replay = self.shared.replay(tag)?;
        let target = lock(&self.shared.dead_letter_targets)
            .get(&replay.topic)
            .cloned()
            .unwrap_or_else(|| dead_letter_queue_name(&replay.topic));

        let headers = &mut replay.headers;
        headers.insert(HEADER_DEATH_REASON.to_string(), reason.to_string());
        headers.insert(HEADER_ORIGINAL_QUEUE.to_string(), replay.topic.clone());
        headers.insert(HEADER_DELIVERY_COUNT.to_string(), replay.delivery_count.to_string());

        self.shared
            .produce(&target, replay.key.as_deref(), &replay.body, &replay.headers)
            .await?;
        self.shared.settle(tag)
    }

    async fn close(&self) {
        self.shared.closed.cancel();
        let consumers: Vec<ConsumerEntry> = lock(&self.shared.consumers).drain().map(|(_, c)| c).collect();
        for entry in consumers {
            entry.consumer.unsubscribe();
        }
        let abandoned = {
            let mut pending = lock(&self.shared.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        if abandoned > 0 {
            tracing::info!(abandoned, "Closed channel with unsettled deliveries; they will be redelivered");
        }
    }

    fn is_open(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_topic_maps_to_queue_not_found() {
        let err = map_kafka_error(
            "orders",
            KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition),
        );
        assert!(matches!(err, BrokerError::QueueNotFound(q) if q == "orders"));
    }

    #[test]
    fn test_queue_full_maps_to_rejected() {
        let err = map_kafka_error("orders", KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull));
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[test]
    fn test_all_brokers_down_is_connection_loss() {
        let err = map_kafka_error(
            "orders",
            KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown),
        );
        assert!(err.is_connection_loss());
    }

    #[test]
    fn test_config_defaults() {
        let config = RedpandaConfig::new("127.0.0.1:9092", "invoices");
        assert_eq!(config.partitions, 1);
        assert_eq!(config.message_timeout, Duration::from_secs(5));
    }
}
