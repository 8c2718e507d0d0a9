//! In-process broker with durable queues and manual acknowledgment.
//!
//! Queues live as long as the `InMemoryBroker` value, so they survive
//! connection loss but not the process. Semantics follow a classic work
//! queue: FIFO delivery, broker-side prefetch per consumer, requeue to the
//! head of the queue, dead-lettering into the queue's configured
//! dead-letter queue, and redelivery of every unsettled delivery when its
//! channel or connection closes.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use super::broker::{
    BrokerError, Channel, Connection, Delivery, DeliveryStream, DeliveryTag, OutgoingMessage,
    QueueOptions, Transport, HEADER_DEATH_REASON, HEADER_DELIVERY_COUNT, HEADER_ORIGINAL_QUEUE,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    headers: BTreeMap<String, String>,
    delivery_count: u32,
    redelivered: bool,
}

/// Snapshot of a message sitting in a queue, for inspection.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub delivery_count: u32,
}

impl QueuedMessage {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
}

struct ConsumerState {
    channel_id: u64,
    queue: String,
    prefetch: usize,
    outstanding: usize,
    active: bool,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    consumer_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, (u64, bool)>,
    consumers: HashMap<u64, ConsumerState>,
    unacked: HashMap<DeliveryTag, Unacked>,
}

impl Inner {
    fn channel_status(&self, channel_id: u64) -> Result<(), BrokerError> {
        let Some((connection_id, open)) = self.channels.get(&channel_id) else {
            return Err(BrokerError::ChannelClosed);
        };
        if !self.connections.get(connection_id).copied().unwrap_or(false) {
            Err(BrokerError::ConnectionClosed)
        } else if !open {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn take_unacked(&mut self, channel_id: u64, tag: DeliveryTag) -> Result<Unacked, BrokerError> {
        match self.unacked.get(&tag) {
            Some(entry) if entry.channel_id == channel_id => {}
            _ => return Err(BrokerError::UnknownDeliveryTag(tag)),
        }
        let entry = self
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        if let Some(consumer) = self.consumers.get_mut(&entry.consumer_id) {
            consumer.outstanding = consumer.outstanding.saturating_sub(1);
        }
        Ok(entry)
    }

    fn return_to_queue(&mut self, entry: Unacked) {
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            let mut message = entry.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    fn close_channel(&mut self, channel_id: u64) -> usize {
        if let Some((_, open)) = self.channels.get_mut(&channel_id) {
            *open = false;
        }
        for consumer in self.consumers.values_mut() {
            if consumer.channel_id == channel_id {
                consumer.active = false;
            }
        }
        self.consumers.retain(|_, c| c.channel_id != channel_id);

        // Highest tags first so the oldest delivery ends up at the head.
        let mut tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let returned = tags.len();
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                self.return_to_queue(entry);
            }
        }
        returned
    }

    fn close_connection(&mut self, connection_id: u64) -> usize {
        self.connections.insert(connection_id, false);
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, (conn, open))| *conn == connection_id && *open)
            .map(|(id, _)| *id)
            .collect();
        channel_ids
            .into_iter()
            .map(|channel_id| self.close_channel(channel_id))
            .sum()
    }
}

struct BrokerState {
    inner: Mutex<Inner>,
    notify: Notify,
    reachable: AtomicBool,
    next_id: AtomicU64,
}

impl BrokerState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// In-process broker. Cloning shares the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                inner: Mutex::new(Inner::default()),
                notify: Notify::new(),
                reachable: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate the broker host going down (or coming back) for new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Drop every open connection, as a network partition or consumer crash
    /// would. Unsettled deliveries go back to their queues. Returns the number
    /// of deliveries returned.
    pub fn kill_connections(&self) -> usize {
        let returned = {
            let mut inner = self.state.lock();
            let open: Vec<u64> = inner
                .connections
                .iter()
                .filter(|(_, open)| **open)
                .map(|(id, _)| *id)
                .collect();
            open.into_iter().map(|id| inner.close_connection(id)).sum::<usize>()
        };
        tracing::warn!(returned, "In-memory broker dropped all connections");
        self.state.notify.notify_waiters();
        returned
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Delivered but not yet settled messages from `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unacked
            .values()
            .filter(|entry| entry.queue == queue)
            .count()
    }

    /// Ready messages in `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| QueuedMessage {
                        body: m.body.clone(),
                        headers: m.headers.clone(),
                        delivery_count: m.delivery_count,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Messages dead-lettered from `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<QueuedMessage> {
        self.messages(&super::broker::dead_letter_queue_name(queue))
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("in-memory broker is offline".to_string()));
        }
        let id = self.state.next_id();
        self.state.lock().connections.insert(id, true);
        tracing::debug!(connection_id = id, "In-memory connection opened");
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    id: u64,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel_id = self.state.next_id();
        {
            let mut inner = self.state.lock();
            if !inner.connections.get(&self.id).copied().unwrap_or(false) {
                return Err(BrokerError::ConnectionClosed);
            }
            inner.channels.insert(channel_id, (self.id, true));
        }
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            id: channel_id,
        }))
    }

    async fn close(&self) {
        let returned = self.state.lock().close_connection(self.id);
        if returned > 0 {
            tracing::info!(connection_id = self.id, returned, "Returned unsettled deliveries on close");
        }
        self.state.notify.notify_waiters();
    }

    fn is_open(&self) -> bool {
        self.state
            .lock()
            .connections
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    id: u64,
}

struct ConsumerCursor {
    state: Arc<BrokerState>,
    consumer_id: u64,
    channel_id: u64,
    finished: bool,
}

enum NextDelivery {
    Ready(Delivery),
    Closed(BrokerError),
    Wait,
}

fn poll_next(inner: &mut Inner, state: &BrokerState, consumer_id: u64, channel_id: u64) -> NextDelivery {
    if let Err(err) = inner.channel_status(channel_id) {
        return NextDelivery::Closed(err);
    }
    let (queue_name, can_take) = match inner.consumers.get(&consumer_id) {
        Some(c) if c.active => (c.queue.clone(), c.outstanding < c.prefetch),
        _ => return NextDelivery::Closed(BrokerError::ChannelClosed),
    };
    if !can_take {
        return NextDelivery::Wait;
    }
    let Some(mut message) = inner
        .queues
        .get_mut(&queue_name)
        .and_then(|q| q.ready.pop_front())
    else {
        return NextDelivery::Wait;
    };

    message.delivery_count += 1;
    let tag = state.next_id();
    let delivery = Delivery {
        tag,
        queue: queue_name.clone(),
        body: message.body.clone(),
        headers: message.headers.clone(),
        redelivered: message.redelivered,
        delivery_count: message.delivery_count,
    };
    if let Some(consumer) = inner.consumers.get_mut(&consumer_id) {
        consumer.outstanding += 1;
    }
    inner.unacked.insert(
        tag,
        Unacked {
            queue: queue_name,
            channel_id,
            consumer_id,
            message,
        },
    );
    NextDelivery::Ready(delivery)
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let mut inner = self.state.lock();
        inner.channel_status(self.id)?;
        inner
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState {
                options: options.clone(),
                ready: VecDeque::new(),
            });
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutgoingMessage) -> Result<(), BrokerError> {
        {
            let mut inner = self.state.lock();
            inner.channel_status(self.id)?;
            let target = inner
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            if let Some(max) = target.options.max_length {
                if target.ready.len() >= max {
                    return Err(BrokerError::Rejected(format!(
                        "queue {queue} is full ({max} messages)"
                    )));
                }
            }
            target.ready.push_back(StoredMessage {
                body: message.body,
                headers: message.headers,
                delivery_count: 0,
                redelivered: false,
            });
        }
        self.state.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        let consumer_id = self.state.next_id();
        {
            let mut inner = self.state.lock();
            inner.channel_status(self.id)?;
            if !inner.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
            inner.consumers.insert(
                consumer_id,
                ConsumerState {
                    channel_id: self.id,
                    queue: queue.to_string(),
                    prefetch: usize::from(prefetch.max(1)),
                    outstanding: 0,
                    active: true,
                },
            );
        }

        let cursor = ConsumerCursor {
            state: self.state.clone(),
            consumer_id,
            channel_id: self.id,
            finished: false,
        };

        let stream = futures_util::stream::unfold(cursor, |mut cursor| async move {
            if cursor.finished {
                return None;
            }
            loop {
                let state = cursor.state.clone();
                let notified = state.notify.notified();
                let polled = {
                    let mut inner = state.lock();
                    poll_next(&mut inner, &state, cursor.consumer_id, cursor.channel_id)
                };
                match polled {
                    NextDelivery::Ready(delivery) => return Some((Ok(delivery), cursor)),
                    NextDelivery::Closed(err) => {
                        cursor.finished = true;
                        return Some((Err(err), cursor));
                    }
                    NextDelivery::Wait => notified.await,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        {
            let mut inner = self.state.lock();
            inner.channel_status(self.id)?;
            inner.take_unacked(self.id, tag)?;
        }
        self.state.notify.notify_waiters();
        Ok(())
    }

    async fn requeue(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        {
            let mut inner = self.state.lock();
            inner.channel_status(self.id)?;
            let entry = inner.take_unacked(self.id, tag)?;
            inner.return_to_queue(entry);
        }
        self.state.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), BrokerError> {
        {
            let mut inner = self.state.lock();
            inner.channel_status(self.id)?;
            let entry = inner.take_unacked(self.id, tag)?;

            let target = inner
                .queues
                .get(&entry.queue)
                .and_then(|q| q.options.dead_letter_queue.clone());

            match target.and_then(|name| inner.queues.get_mut(&name)) {
                Some(dlq) => {
                    let mut headers = entry.message.headers;
                    headers.insert(HEADER_DEATH_REASON.to_string(), reason.to_string());
                    headers.insert(HEADER_ORIGINAL_QUEUE.to_string(), entry.queue.clone());
                    headers.insert(
                        HEADER_DELIVERY_COUNT.to_string(),
                        entry.message.delivery_count.to_string(),
                    );
                    dlq.ready.push_back(StoredMessage {
                        body: entry.message.body,
                        headers,
                        delivery_count: 0,
                        redelivered: false,
                    });
                }
                None => {
                    tracing::warn!(
                        queue = %entry.queue,
                        reason,
                        "No dead-letter queue configured, discarding message"
                    );
                }
            }
        }
        self.state.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().close_channel(self.id);
        self.state.notify.notify_waiters();
    }

    fn is_open(&self) -> bool {
        self.state.lock().channel_status(self.id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::broker::dead_letter_queue_name;
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn setup(queue: &str) -> (InMemoryBroker, Arc<dyn Connection>, Arc<dyn Channel>) {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel
            .declare_queue(&dead_letter_queue_name(queue), &QueueOptions::dead_letter())
            .await
            .unwrap();
        channel
            .declare_queue(queue, &QueueOptions::work_queue(queue))
            .await
            .unwrap();
        (broker, connection, channel)
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery within timeout")
            .expect("stream open")
            .expect("delivery ok")
    }

    #[tokio::test]
    async fn test_publish_to_missing_queue_fails() {
        let (_broker, _conn, channel) = setup("orders").await;
        let err = channel
            .publish("nope", OutgoingMessage::persistent(b"{}".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn test_max_length_rejects_publish() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap().open_channel().await.unwrap();
        channel
            .declare_queue("small", &QueueOptions::dead_letter().with_max_length(1))
            .await
            .unwrap();

        channel.publish("small", OutgoingMessage::persistent(vec![1])).await.unwrap();
        let err = channel
            .publish("small", OutgoingMessage::persistent(vec![2]))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_prefetch_limits_outstanding_deliveries() {
        let (broker, _conn, channel) = setup("orders").await;
        for i in 0..3u8 {
            channel.publish("orders", OutgoingMessage::persistent(vec![i])).await.unwrap();
        }

        let mut stream = channel.consume("orders", 2).await.unwrap();
        let first = next(&mut stream).await;
        let _second = next(&mut stream).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "third delivery must wait for an ack");
        assert_eq!(broker.unacked_count("orders"), 2);

        channel.ack(first.tag).await.unwrap();
        let third = next(&mut stream).await;
        assert_eq!(third.body, vec![2]);
    }

    #[tokio::test]
    async fn test_requeue_increments_delivery_count() {
        let (_broker, _conn, channel) = setup("orders").await;
        channel.publish("orders", OutgoingMessage::persistent(b"a".to_vec())).await.unwrap();

        let mut stream = channel.consume("orders", 1).await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.delivery_count, 1);
        assert!(!first.redelivered);

        channel.requeue(first.tag).await.unwrap();
        let second = next(&mut stream).await;
        assert_eq!(second.delivery_count, 2);
        assert!(second.redelivered);
    }

    #[tokio::test]
    async fn test_dead_letter_routes_with_reason() {
        let (broker, _conn, channel) = setup("orders").await;
        channel.publish("orders", OutgoingMessage::persistent(b"bad".to_vec())).await.unwrap();

        let mut stream = channel.consume("orders", 1).await.unwrap();
        let delivery = next(&mut stream).await;
        channel.dead_letter(delivery.tag, "malformed").await.unwrap();

        let dead = broker.dead_letters("orders");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"bad".to_vec());
        assert_eq!(dead[0].header(HEADER_DEATH_REASON), Some("malformed"));
        assert_eq!(dead[0].header(HEADER_ORIGINAL_QUEUE), Some("orders"));
        assert_eq!(broker.queue_depth("orders"), 0);
        assert_eq!(broker.unacked_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_killed_connection_redelivers_unacked() {
        let (broker, _conn, channel) = setup("orders").await;
        channel.publish("orders", OutgoingMessage::persistent(b"x".to_vec())).await.unwrap();

        let mut stream = channel.consume("orders", 1).await.unwrap();
        let delivery = next(&mut stream).await;

        assert_eq!(broker.kill_connections(), 1);
        let closed = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(closed, Err(BrokerError::ConnectionClosed)));
        assert!(channel.ack(delivery.tag).await.is_err());
        assert_eq!(broker.queue_depth("orders"), 1);

        let channel = broker.connect().await.unwrap().open_channel().await.unwrap();
        let mut stream = channel.consume("orders", 1).await.unwrap();
        let again = next(&mut stream).await;
        assert!(again.redelivered);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        assert!(matches!(
            broker.connect().await.err(),
            Some(BrokerError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_from_another_channel_is_rejected() {
        let (_broker, conn, channel) = setup("orders").await;
        channel.publish("orders", OutgoingMessage::persistent(b"x".to_vec())).await.unwrap();
        let mut stream = channel.consume("orders", 1).await.unwrap();
        let delivery = next(&mut stream).await;

        let other = conn.open_channel().await.unwrap();
        assert!(matches!(
            other.ack(delivery.tag).await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
        channel.ack(delivery.tag).await.unwrap();
    }
}
