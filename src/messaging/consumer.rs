use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use kameo::actor::ActorRef;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::broker::{
    dead_letter_queue_name, BrokerError, Channel, Delivery, DeliveryStream, DeliveryTag,
    QueueOptions,
};
use super::connection::{ConnectionError, ConnectionManager};
use crate::actors::{HealthMonitorActor, HealthStatus, UpdateHealth};
use crate::contracts::{DeserializationError, DomainEvent, EventEnvelope};
use crate::metrics::Metrics;
use crate::utils::RetryConfig;

// ============================================================================
// Consumer / Dispatcher
// ============================================================================
//
// Per delivery:
//
//   Delivered → Processing → Acknowledged
//                          → Requeued       (handler failure, count <= N)
//                          → Dead-lettered  (bad payload, permanent failure,
//                                            or count > N)
//
// Every delivery ends in exactly one explicit ack, requeue or dead-letter.
// Handlers for up to `prefetch` deliveries run concurrently; each settles by
// its own tag, so acks may complete out of delivery order.
//
// A handler that panics or overruns `handler_timeout` is treated as a
// transient failure. When the delivery stream breaks (connection loss,
// consumer cancelled by the broker) the dispatcher reopens its channel and
// subscribes again; unsettled deliveries come back from the broker.
//
// ============================================================================

/// Broker metadata handed to the handler alongside the decoded event.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub tag: DeliveryTag,
    pub queue: String,
    pub delivery_count: u32,
    pub redelivered: bool,
    pub headers: BTreeMap<String, String>,
}

impl From<&Delivery> for DeliveryContext {
    fn from(delivery: &Delivery) -> Self {
        Self {
            tag: delivery.tag,
            queue: delivery.queue.clone(),
            delivery_count: delivery.delivery_count,
            redelivered: delivery.redelivered,
            headers: delivery.headers.clone(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Worth another attempt (store unavailable, downstream timeout)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help; dead-letter right away
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        HandlerError::Transient(err.to_string())
    }

    pub fn permanent(err: impl std::fmt::Display) -> Self {
        HandlerError::Permanent(err.to_string())
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: DomainEvent;

    async fn handle(
        &self,
        envelope: EventEnvelope<Self::Message>,
        ctx: &DeliveryContext,
    ) -> Result<(), HandlerError>;
}

#[derive(Clone, Debug)]
pub struct ConsumeOptions {
    /// Maximum unsettled deliveries (and concurrent handlers)
    pub prefetch: u16,
    /// N: a failing delivery is requeued while its delivery count is <= N
    pub max_redeliveries: u32,
    pub handler_timeout: Duration,
    /// How long shutdown waits for in-flight handlers
    pub drain_timeout: Duration,
    /// Backoff between resubscribe attempts after the stream breaks
    pub resubscribe: RetryConfig,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 10,
            max_redeliveries: 3,
            handler_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            resubscribe: RetryConfig::relay(),
        }
    }
}

/// Why processing a delivery did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingFailure {
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl ProcessingFailure {
    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingFailure::Deserialization(_) => "deserialization",
            ProcessingFailure::Handler(HandlerError::Transient(_)) => "transient",
            ProcessingFailure::Handler(HandlerError::Permanent(_)) => "permanent",
            ProcessingFailure::Timeout(_) => "timeout",
            ProcessingFailure::Panicked(_) => "panic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter(String),
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
            Disposition::DeadLetter(_) => "dead_letter",
        }
    }
}

/// Map a processing outcome to the settlement of its delivery.
pub fn decide(
    outcome: &Result<(), ProcessingFailure>,
    delivery_count: u32,
    max_redeliveries: u32,
) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(failure @ ProcessingFailure::Deserialization(_))
        | Err(failure @ ProcessingFailure::Handler(HandlerError::Permanent(_))) => {
            Disposition::DeadLetter(failure.to_string())
        }
        Err(_) if delivery_count <= max_redeliveries => Disposition::Requeue,
        Err(failure) => Disposition::DeadLetter(format!(
            "gave up after {delivery_count} deliveries: {failure}"
        )),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct Consumer<H: MessageHandler> {
    connections: Arc<ConnectionManager>,
    queue: String,
    channel_name: String,
    handler: Arc<H>,
    options: ConsumeOptions,
    metrics: Option<Arc<Metrics>>,
    health: Option<ActorRef<HealthMonitorActor>>,
}

enum StreamEnd {
    Shutdown,
    Broken,
}

impl<H: MessageHandler> Consumer<H> {
    pub fn new(
        connections: Arc<ConnectionManager>,
        queue: impl Into<String>,
        handler: H,
        options: ConsumeOptions,
    ) -> Self {
        let queue = queue.into();
        Self {
            connections,
            channel_name: format!("consumer:{queue}"),
            queue,
            handler: Arc::new(handler),
            options,
            metrics: None,
            health: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: ActorRef<HealthMonitorActor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Consume until `shutdown` is cancelled, then drain.
    ///
    /// Fails only when the first subscription cannot be established (broker
    /// unreachable within the connection budget, queue cannot be declared).
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut channel = self.subscribe_channel().await?;
        let mut attempt = 0u32;

        loop {
            let stream = match channel.consume(&self.queue, self.options.prefetch).await {
                Ok(stream) => stream,
                Err(e) if e.is_connection_loss() => {
                    tracing::warn!(queue = %self.queue, error = %e, "Subscribe failed, reconnecting");
                    match self.resubscribe(&shutdown, &mut attempt).await {
                        Some(next) => {
                            channel = next;
                            continue;
                        }
                        None => break,
                    }
                }
                Err(e) => return Err(e.into()),
            };

            attempt = 0;
            self.report(HealthStatus::Healthy).await;
            tracing::info!(
                queue = %self.queue,
                prefetch = self.options.prefetch,
                max_redeliveries = self.options.max_redeliveries,
                "Consuming"
            );

            match self.dispatch(stream, &channel, &mut tasks, &shutdown).await {
                StreamEnd::Shutdown => break,
                StreamEnd::Broken => {
                    self.report(HealthStatus::Degraded("resubscribing".to_string())).await;
                    match self.resubscribe(&shutdown, &mut attempt).await {
                        Some(next) => channel = next,
                        None => break,
                    }
                }
            }
        }

        self.drain(&mut tasks).await;
        // Unsettled deliveries go back to the queue with the channel
        self.connections.discard_channel(&self.channel_name).await;
        self.report(HealthStatus::Unhealthy("stopped".to_string())).await;
        tracing::info!(queue = %self.queue, "Consumer stopped");
        Ok(())
    }

    async fn subscribe_channel(&self) -> Result<Arc<dyn Channel>, ConsumerError> {
        let channel = self.connections.open_channel(&self.channel_name).await?;
        channel
            .declare_queue(&dead_letter_queue_name(&self.queue), &QueueOptions::dead_letter())
            .await?;
        channel
            .declare_queue(&self.queue, &QueueOptions::work_queue(&self.queue))
            .await?;
        Ok(channel)
    }

    async fn dispatch(
        &self,
        mut stream: DeliveryStream,
        channel: &Arc<dyn Channel>,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!(queue = %self.queue, in_flight = tasks.len(), "Shutdown requested, no longer accepting deliveries");
                    return StreamEnd::Shutdown;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(queue = %self.queue, error = %e, "Delivery task failed");
                    }
                }

                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        let span = tracing::info_span!(
                            "delivery",
                            queue = %delivery.queue,
                            tag = delivery.tag,
                            delivery_count = delivery.delivery_count,
                        );
                        let task = process_delivery(
                            self.handler.clone(),
                            channel.clone(),
                            delivery,
                            self.options.clone(),
                            self.metrics.clone(),
                        );
                        tasks.spawn(task.instrument(span));
                    }
                    Some(Err(e)) => {
                        tracing::warn!(queue = %self.queue, error = %e, "Delivery stream failed");
                        return StreamEnd::Broken;
                    }
                    None => {
                        tracing::warn!(queue = %self.queue, "Consumer cancelled by broker");
                        return StreamEnd::Broken;
                    }
                }
            }
        }
    }

    /// Reopen the consumer channel, backing off until it works or shutdown
    /// is requested.
    async fn resubscribe(
        &self,
        shutdown: &CancellationToken,
        attempt: &mut u32,
    ) -> Option<Arc<dyn Channel>> {
        self.connections.discard_channel(&self.channel_name).await;

        loop {
            *attempt += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_retry_attempt("consumer.resubscribe");
            }

            let result = tokio::select! {
                _ = shutdown.cancelled() => return None,
                result = self.subscribe_channel() => result,
            };

            match result {
                Ok(channel) => {
                    tracing::info!(queue = %self.queue, attempt = *attempt, "Resubscribed");
                    return Some(channel);
                }
                Err(ConsumerError::Connection(ConnectionError::Closed)) => return None,
                Err(e) => {
                    let delay = self.options.resubscribe.delay_for(*attempt);
                    tracing::warn!(
                        queue = %self.queue,
                        attempt = *attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Resubscribe failed, retrying after delay"
                    );
                    self.report(HealthStatus::Unhealthy(e.to_string())).await;
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        let in_flight = tasks.len();
        tracing::info!(queue = %self.queue, in_flight, "Draining in-flight deliveries");

        let drained = tokio::time::timeout(self.options.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(queue = %self.queue, error = %e, "Delivery task failed during drain");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                queue = %self.queue,
                remaining = tasks.len(),
                "Drain deadline reached, aborting handlers; their deliveries will be redelivered"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    async fn report(&self, status: HealthStatus) {
        if let Some(health) = &self.health {
            let update = UpdateHealth::new(self.channel_name.clone(), status);
            if health.tell(update).send().await.is_err() {
                tracing::debug!("Health monitor unavailable");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_handler<H: MessageHandler>(
    handler: &H,
    delivery: &Delivery,
    timeout: Duration,
) -> Result<(), ProcessingFailure> {
    let envelope = EventEnvelope::<H::Message>::from_slice(&delivery.body)?;
    let ctx = DeliveryContext::from(delivery);

    tracing::debug!(event_id = %envelope.event_id, event_type = %envelope.event_type, "Handling event");

    let guarded = AssertUnwindSafe(handler.handle(envelope, &ctx)).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Err(_) => Err(ProcessingFailure::Timeout(timeout)),
        Ok(Err(panic)) => Err(ProcessingFailure::Panicked(panic_message(panic.as_ref()))),
        Ok(Ok(result)) => result.map_err(ProcessingFailure::from),
    }
}

async fn process_delivery<H: MessageHandler>(
    handler: Arc<H>,
    channel: Arc<dyn Channel>,
    delivery: Delivery,
    options: ConsumeOptions,
    metrics: Option<Arc<Metrics>>,
) {
    let started = Instant::now();
    let outcome = run_handler(handler.as_ref(), &delivery, options.handler_timeout).await;
    let disposition = decide(&outcome, delivery.delivery_count, options.max_redeliveries);

    match &outcome {
        Ok(()) => tracing::debug!("Handled"),
        Err(failure) => tracing::warn!(
            failure = failure.label(),
            error = %failure,
            disposition = disposition.as_str(),
            "Processing failed"
        ),
    }

    let settled = match &disposition {
        Disposition::Ack => channel.ack(delivery.tag).await,
        Disposition::Requeue => channel.requeue(delivery.tag).await,
        Disposition::DeadLetter(reason) => channel.dead_letter(delivery.tag, reason).await,
    };

    if let Err(e) = settled {
        // The broker redelivers whatever this channel left unsettled
        tracing::warn!(
            error = %e,
            disposition = disposition.as_str(),
            "Could not settle delivery, it will be redelivered"
        );
        return;
    }

    if let Some(metrics) = &metrics {
        metrics.record_delivery(&delivery.queue, disposition.as_str(), started.elapsed().as_secs_f64());
        if let (Disposition::DeadLetter(_), Err(failure)) = (&disposition, &outcome) {
            metrics.record_dead_letter(&delivery.queue, failure.label());
        }
    }
    if let Disposition::DeadLetter(reason) = &disposition {
        tracing::error!(reason = %reason, "Delivery dead-lettered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::OrderCreatedMessage;
    use crate::messaging::broker::{OutgoingMessage, Transport, HEADER_DEATH_REASON};
    use crate::messaging::memory::InMemoryBroker;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn transient() -> Result<(), ProcessingFailure> {
        Err(ProcessingFailure::Handler(HandlerError::Transient("db down".into())))
    }

    #[test]
    fn test_decide_success_acks() {
        assert_eq!(decide(&Ok(()), 1, 3), Disposition::Ack);
        assert_eq!(decide(&Ok(()), 9, 3), Disposition::Ack);
    }

    #[test]
    fn test_decide_requeues_within_bound() {
        for count in 1..=3 {
            assert_eq!(decide(&transient(), count, 3), Disposition::Requeue);
        }
        assert!(matches!(decide(&transient(), 4, 3), Disposition::DeadLetter(_)));
    }

    #[test]
    fn test_decide_dead_letters_bad_payload_immediately() {
        let outcome = Err(ProcessingFailure::Deserialization(DeserializationError::Empty));
        assert!(matches!(decide(&outcome, 1, 3), Disposition::DeadLetter(_)));

        let outcome = Err(ProcessingFailure::Handler(HandlerError::Permanent("bad".into())));
        assert!(matches!(decide(&outcome, 1, 3), Disposition::DeadLetter(_)));
    }

    #[test]
    fn test_decide_timeout_and_panic_are_retried() {
        let timeout = Err(ProcessingFailure::Timeout(Duration::from_millis(5)));
        let panic = Err(ProcessingFailure::Panicked("boom".into()));
        assert_eq!(decide(&timeout, 1, 3), Disposition::Requeue);
        assert_eq!(decide(&panic, 2, 3), Disposition::Requeue);
    }

    #[test]
    fn test_zero_redeliveries_dead_letters_first_failure() {
        assert!(matches!(decide(&transient(), 1, 0), Disposition::DeadLetter(_)));
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Hang,
        Slow(Duration),
    }

    #[derive(Default)]
    struct Counters {
        calls: AtomicU32,
        in_flight: AtomicU32,
        peak: AtomicU32,
        done: AtomicU32,
    }

    struct TestHandler {
        behaviour: Behaviour,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl MessageHandler for TestHandler {
        type Message = OrderCreatedMessage;

        async fn handle(
            &self,
            _envelope: EventEnvelope<OrderCreatedMessage>,
            _ctx: &DeliveryContext,
        ) -> Result<(), HandlerError> {
            let counters = &self.counters;
            counters.calls.fetch_add(1, Ordering::SeqCst);
            let running = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            counters.peak.fetch_max(running, Ordering::SeqCst);

            let result = match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(HandlerError::transient("always failing")),
                Behaviour::Panic => panic!("handler bug"),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                Behaviour::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
            };

            counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            if result.is_ok() {
                counters.done.fetch_add(1, Ordering::SeqCst);
            }
            result
        }
    }

    fn options() -> ConsumeOptions {
        ConsumeOptions {
            prefetch: 4,
            max_redeliveries: 2,
            handler_timeout: Duration::from_millis(50),
            drain_timeout: Duration::from_millis(500),
            resubscribe: RetryConfig::connect(3, Duration::from_millis(5)),
        }
    }

    async fn start(
        broker: &InMemoryBroker,
        behaviour: Behaviour,
    ) -> (Arc<Counters>, CancellationToken, tokio::task::JoinHandle<Result<(), ConsumerError>>) {
        start_with(broker, behaviour, options()).await
    }

    async fn start_with(
        broker: &InMemoryBroker,
        behaviour: Behaviour,
        options: ConsumeOptions,
    ) -> (Arc<Counters>, CancellationToken, tokio::task::JoinHandle<Result<(), ConsumerError>>) {
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            RetryConfig::connect(3, Duration::from_millis(1)),
        ));
        let counters = Arc::new(Counters::default());
        let handler = TestHandler {
            behaviour,
            counters: counters.clone(),
        };
        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(connections, "orders", handler, options);
        let handle = tokio::spawn(consumer.run(shutdown.clone()));
        (counters, shutdown, handle)
    }

    async fn publish(broker: &InMemoryBroker, body: Vec<u8>) {
        let connection = broker.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel
            .declare_queue("orders.dead-letter", &QueueOptions::dead_letter())
            .await
            .unwrap();
        channel
            .declare_queue("orders", &QueueOptions::work_queue("orders"))
            .await
            .unwrap();
        channel
            .publish("orders", OutgoingMessage::persistent(body))
            .await
            .unwrap();
        connection.close().await;
    }

    fn order_body() -> Vec<u8> {
        EventEnvelope::new(OrderCreatedMessage {
            order_id: Uuid::new_v4(),
            amount: 100,
            customer_id: None,
        })
        .to_bytes()
        .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_success_acks_delivery() {
        let broker = InMemoryBroker::new();
        publish(&broker, order_body()).await;
        let (counters, shutdown, handle) = start(&broker, Behaviour::Succeed).await;

        wait_until(|| counters.calls.load(Ordering::SeqCst) == 1 && broker.unacked_count("orders") == 0).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.queue_depth("orders"), 0);
        assert!(broker.dead_letters("orders").is_empty());
    }

    #[tokio::test]
    async fn test_null_message_is_dead_lettered_without_calling_handler() {
        let broker = InMemoryBroker::new();
        publish(&broker, b"null".to_vec()).await;
        publish(&broker, Vec::new()).await;
        let (counters, shutdown, handle) = start(&broker, Behaviour::Succeed).await;

        wait_until(|| broker.dead_letters("orders").len() == 2).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
        let dead = broker.dead_letters("orders");
        assert!(dead[0].header(HEADER_DEATH_REASON).is_some());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_bounded() {
        let broker = InMemoryBroker::new();
        publish(&broker, order_body()).await;
        let (counters, shutdown, handle) = start(&broker, Behaviour::Panic).await;

        wait_until(|| broker.dead_letters("orders").len() == 1).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        // first delivery plus max_redeliveries
        assert_eq!(counters.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let broker = InMemoryBroker::new();
        publish(&broker, order_body()).await;
        let (counters, shutdown, handle) = start(&broker, Behaviour::Hang).await;

        wait_until(|| broker.dead_letters("orders").len() == 1).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(counters.calls.load(Ordering::SeqCst), 3);
        let dead = &broker.dead_letters("orders")[0];
        assert!(dead.header(HEADER_DEATH_REASON).unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_failing_handler_dead_letters_after_bound() {
        let broker = InMemoryBroker::new();
        publish(&broker, order_body()).await;
        let (counters, shutdown, handle) = start(&broker, Behaviour::Fail).await;

        wait_until(|| broker.dead_letters("orders").len() == 1).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(counters.calls.load(Ordering::SeqCst), 3);
        let dead = &broker.dead_letters("orders")[0];
        assert_eq!(dead.header("x-delivery-count"), Some("3"));
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_startup() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let (_counters, _shutdown, handle) = start(&broker, Behaviour::Succeed).await;

        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(ConsumerError::Connection(ConnectionError::Exhausted { .. }))
        ));
    }

    fn slow_options(prefetch: u16, drain_timeout: Duration) -> ConsumeOptions {
        ConsumeOptions {
            prefetch,
            handler_timeout: Duration::from_secs(30),
            drain_timeout,
            ..options()
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_handlers() {
        let broker = InMemoryBroker::new();
        publish(&broker, order_body()).await;
        publish(&broker, order_body()).await;
        let (counters, shutdown, handle) = start_with(
            &broker,
            Behaviour::Slow(Duration::from_millis(200)),
            slow_options(4, Duration::from_secs(5)),
        )
        .await;

        wait_until(|| counters.calls.load(Ordering::SeqCst) == 2).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(counters.done.load(Ordering::SeqCst), 2);
        assert_eq!(broker.queue_depth("orders"), 0);
        assert_eq!(broker.unacked_count("orders"), 0);
        assert!(broker.dead_letters("orders").is_empty());
    }

    #[tokio::test]
    async fn test_drain_deadline_returns_delivery_to_queue() {
        let broker = InMemoryBroker::new();
        publish(&broker, order_body()).await;
        let (counters, shutdown, handle) = start_with(
            &broker,
            Behaviour::Slow(Duration::from_secs(10)),
            slow_options(4, Duration::from_millis(100)),
        )
        .await;

        wait_until(|| counters.calls.load(Ordering::SeqCst) == 1).await;
        let stopping = Instant::now();
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(stopping.elapsed() < Duration::from_secs(2));
        assert_eq!(counters.done.load(Ordering::SeqCst), 0);
        assert_eq!(broker.unacked_count("orders"), 0);

        let returned = broker.messages("orders");
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].delivery_count, 1);
        assert!(broker.dead_letters("orders").is_empty());
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently_up_to_prefetch() {
        let broker = InMemoryBroker::new();
        for _ in 0..8 {
            publish(&broker, order_body()).await;
        }
        let (counters, shutdown, handle) = start_with(
            &broker,
            Behaviour::Slow(Duration::from_millis(100)),
            slow_options(4, Duration::from_secs(5)),
        )
        .await;

        wait_until(|| counters.done.load(Ordering::SeqCst) == 8).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(counters.peak.load(Ordering::SeqCst), 4);
        assert_eq!(broker.queue_depth("orders"), 0);
        assert_eq!(broker.unacked_count("orders"), 0);
    }
}
