use kameo::actor::ActorRef;
use kameo::Actor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use order_events::actors::HealthMonitorActor;
use order_events::config::{BrokerUrl, Config, DatabaseUrl};
use order_events::invoices::OrderCreatedHandler;
use order_events::messaging::{ConnectionManager, Consumer};
use order_events::metrics::{start_metrics_server, Metrics};
use order_events::storage::{InMemoryStore, InvoiceStore, PgStore};
use order_events::telemetry;
use order_events::utils::cancel_on_shutdown_signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let config = Config::from_env()?;

    tracing::info!(
        queue = %config.orders_queue,
        prefetch = config.consumer_prefetch,
        max_redeliveries = config.max_redeliveries,
        "🚀 Starting invoices service"
    );
    if config.broker == BrokerUrl::Memory {
        tracing::warn!("Using the in-process memory broker; only events published by this process arrive");
    }

    // Installed first so SIGTERM during startup still drains and closes
    let shutdown = CancellationToken::new();
    cancel_on_shutdown_signal(shutdown.clone())?;

    // === 1. Metrics and health ===
    let metrics = Arc::new(Metrics::new()?);
    let monitor = HealthMonitorActor::spawn(HealthMonitorActor::new().with_metrics(metrics.clone()));

    let metrics_server = tokio::spawn(start_metrics_server(
        metrics.clone(),
        monitor.clone(),
        config.metrics_port,
    ));

    let connections = Arc::new(ConnectionManager::new(config.transport(), config.connect_retry()));
    let result = connections
        .close_after(run(&config, connections.clone(), metrics, monitor, shutdown))
        .await;
    metrics_server.abort();

    match &result {
        Ok(()) => tracing::info!("👋 Invoices service stopped"),
        Err(e) => tracing::error!(error = %e, "Invoices service failed"),
    }
    result
}

async fn run(
    config: &Config,
    connections: Arc<ConnectionManager>,
    metrics: Arc<Metrics>,
    monitor: ActorRef<HealthMonitorActor>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    // === 2. Invoice store ===
    let store: Arc<dyn InvoiceStore> = match &config.database {
        DatabaseUrl::Memory => Arc::new(InMemoryStore::new()),
        DatabaseUrl::Postgres(url) => Arc::new(PgStore::connect(url).await?),
    };

    // === 3. Consumer ===
    connections.connect().await?;

    let handler = OrderCreatedHandler::new(store).with_metrics(metrics.clone());
    let consumer = Consumer::new(
        connections,
        config.orders_queue.clone(),
        handler,
        config.consume_options(),
    )
    .with_metrics(metrics)
    .with_health(monitor);

    // Returns once shutdown is signalled and in-flight deliveries drained
    consumer.run(shutdown).await?;
    Ok(())
}
