use actix_cors::Cors;
use actix_web::error::JsonPayloadError;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::service::{CreateOrder, OrderService, OrderServiceError};
use crate::metrics::{components_handler, health_handler, metrics_handler};
use crate::storage::StoreError;

// ============================================================================
// Orders HTTP surface
// ============================================================================
//
// POST /orders             {amount, customerId?} → 201 Order
// GET  /orders/{id}        → 200 Order | 404
// GET  /health             → 200 OK
// GET  /health/components  → aggregated component health
// GET  /metrics            → Prometheus text format
//
// Browsers may call every route from any origin (see `cors`).
//
// Callers register `web::Data<OrderService>`, `web::Data<Arc<Metrics>>` and
// `web::Data<ActorRef<HealthMonitorActor>>` on the App.
//
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub amount: Value,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
}

impl CreateOrderRequest {
    /// Accepts an integer or a string holding one, like `"100"`.
    fn amount(&self) -> Result<i64, OrderServiceError> {
        let parsed = match &self.amount {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        match parsed {
            Some(amount) if amount > 0 => Ok(amount),
            _ => Err(OrderServiceError::Invalid(format!(
                "amount must be a positive integer, got {}",
                self.amount
            ))),
        }
    }
}

impl ResponseError for OrderServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            OrderServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
            OrderServiceError::Publish(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrderServiceError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            OrderServiceError::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
            OrderServiceError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            OrderServiceError::Store(StoreError::Database { .. })
            | OrderServiceError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_string()
        }))
    }
}

pub async fn create_order(
    service: web::Data<OrderService>,
    body: web::Json<CreateOrderRequest>,
) -> Result<HttpResponse, OrderServiceError> {
    let amount = body.amount()?;
    let order = service
        .create_order(CreateOrder {
            amount,
            customer_id: body.customer_id,
        })
        .await?;
    Ok(HttpResponse::Created().json(order))
}

pub async fn get_order(
    service: web::Data<OrderService>,
    id: web::Path<Uuid>,
) -> Result<HttpResponse, OrderServiceError> {
    match service.get_order(id.into_inner()).await? {
        Some(order) => Ok(HttpResponse::Ok().json(order)),
        None => Ok(HttpResponse::NotFound().json(serde_json::json!({
            "error": "order not found"
        }))),
    }
}

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let message = err.to_string();
    actix_web::error::InternalError::from_response(
        err,
        HttpResponse::BadRequest().json(serde_json::json!({ "error": message })),
    )
    .into()
}

/// Any origin, method and header; wrap the App with it.
pub fn cors() -> Cors {
    Cors::permissive()
}

/// Register the orders routes on an App.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .route("/orders", web::post().to(create_order))
        .route("/orders/{id}", web::get().to(get_order))
        .route("/health", web::get().to(health_handler))
        .route("/health/components", web::get().to(components_handler))
        .route("/metrics", web::get().to(metrics_handler));
}
