use actix_web::{web, App, HttpServer};
use kameo::Actor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use order_events::actors::HealthMonitorActor;
use order_events::config::{BrokerUrl, Config, DatabaseUrl};
use order_events::messaging::{ConnectionManager, Publisher};
use order_events::metrics::Metrics;
use order_events::orders::{self, OrderService};
use order_events::outbox::{OutboxRelay, OutboxStore};
use order_events::storage::{InMemoryStore, OrderStore, PgStore};
use order_events::telemetry;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let config = Config::from_env()?;

    tracing::info!(
        http_addr = %config.http_addr,
        queue = %config.orders_queue,
        dispatch_mode = config.dispatch_mode.as_str(),
        "🚀 Starting orders service"
    );
    if config.broker == BrokerUrl::Memory {
        tracing::warn!("Using the in-process memory broker; no other process will see these events");
    }

    // === 1. Metrics and health ===
    let metrics = Arc::new(Metrics::new()?);

    // === 2. Stores ===
    let (order_store, outbox_store): (Arc<dyn OrderStore>, Arc<dyn OutboxStore>) =
        match &config.database {
            DatabaseUrl::Memory => {
                let store = InMemoryStore::new();
                (Arc::new(store.clone()), Arc::new(store))
            }
            DatabaseUrl::Postgres(url) => {
                let store = PgStore::connect(url).await?;
                (Arc::new(store.clone()), Arc::new(store))
            }
        };

    // From here on the broker connection is released on every exit path
    let connections = Arc::new(ConnectionManager::new(config.transport(), config.connect_retry()));
    let result = connections
        .close_after(run(&config, connections.clone(), metrics, order_store, outbox_store))
        .await;

    match &result {
        Ok(()) => tracing::info!("👋 Orders service stopped"),
        Err(e) => tracing::error!(error = %e, "Orders service failed"),
    }
    result
}

async fn run(
    config: &Config,
    connections: Arc<ConnectionManager>,
    metrics: Arc<Metrics>,
    order_store: Arc<dyn OrderStore>,
    outbox_store: Arc<dyn OutboxStore>,
) -> anyhow::Result<()> {
    // === 3. Broker connection and publisher ===
    connections.connect().await?;

    let publisher = Arc::new(Publisher::new(connections.clone()).with_metrics(metrics.clone()));
    publisher.declare_work_queue(&config.orders_queue).await?;

    let monitor = HealthMonitorActor::spawn(
        HealthMonitorActor::new()
            .with_metrics(metrics.clone())
            .with_circuit_breaker(publisher.circuit_breaker(), Duration::from_secs(5)),
    );

    // === 4. Outbox relay and order service ===
    let relay = OutboxRelay::new(outbox_store, publisher.clone(), config.relay_options())
        .with_metrics(metrics.clone())
        .with_health(monitor.clone());

    let service = OrderService::new(
        order_store,
        publisher,
        config.orders_queue.clone(),
        config.dispatch_mode,
        config.default_customer_id,
    )
    .with_relay_notify(relay.notifier())
    .with_metrics(metrics.clone());

    // === 5. HTTP ===
    let service = web::Data::new(service);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(orders::cors())
            .app_data(service.clone())
            .app_data(web::Data::new(metrics.clone()))
            .app_data(web::Data::new(monitor.clone()))
            .configure(orders::routes)
    })
    .bind(config.http_addr)?
    .run();

    // The relay starts once the listener is bound and stops on any return
    let shutdown = CancellationToken::new();
    let _stop_relay = shutdown.clone().drop_guard();
    let relay_task = tokio::spawn(relay.run(shutdown.child_token()));

    // Returns after Ctrl-C / SIGTERM once in-flight requests finished
    let served = server.await;

    tracing::info!("Shutting down orders service");
    shutdown.cancel();
    if let Err(e) = relay_task.await {
        tracing::error!(error = %e, "Outbox relay task failed");
    }

    served?;
    Ok(())
}
