use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use kameo::actor::ActorRef;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

use super::Metrics;
use crate::actors::{GetSystemHealth, HealthMonitorActor};

/// Serve /metrics, /health and /health/components until the server stops.
pub async fn start_metrics_server(
    metrics: Arc<Metrics>,
    monitor: ActorRef<HealthMonitorActor>,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(metrics.clone()))
            .app_data(web::Data::new(monitor.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
            .route("/health/components", web::get().to(components_handler))
    })
    .bind(("0.0.0.0", port))?
    .run();
    server.await
}

pub async fn metrics_handler(metrics: web::Data<Arc<Metrics>>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

/// Liveness probe
pub async fn health_handler() -> impl Responder {
    HttpResponse::Ok().content_type("text/plain").body("OK")
}

/// Aggregated component health; 503 when any component is unhealthy
pub async fn components_handler(monitor: web::Data<ActorRef<HealthMonitorActor>>) -> HttpResponse {
    match monitor.ask(GetSystemHealth).send().await {
        Ok(health) if health.overall_status.is_unhealthy() => {
            HttpResponse::ServiceUnavailable().json(health)
        }
        Ok(health) => HttpResponse::Ok().json(health),
        Err(_) => {
            tracing::error!("Health monitor did not answer");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "unhealthy",
                "reason": "health monitor unavailable"
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{HealthStatus, UpdateHealth};
    use actix_web::{http::StatusCode, test};
    use kameo::Actor;

    #[actix_web::test]
    async fn test_metrics_endpoint_exposes_registry() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.record_published("orders", "OrderCreated");

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(metrics.clone()))
                .route("/metrics", web::get().to(metrics_handler)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("events_published_total"));
    }

    #[actix_web::test]
    async fn test_components_unhealthy_returns_503() {
        let monitor = HealthMonitorActor::spawn(HealthMonitorActor::new());
        monitor
            .tell(UpdateHealth::new("broker", HealthStatus::Unhealthy("connection lost".into())))
            .send()
            .await
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(monitor.clone()))
                .route("/health/components", web::get().to(components_handler))
                .route("/health", web::get().to(health_handler)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health/components").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
