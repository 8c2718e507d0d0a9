use async_trait::async_trait;
use std::sync::Arc;

use crate::contracts::{EventEnvelope, OrderCreatedMessage};
use crate::messaging::{DeliveryContext, HandlerError, MessageHandler};
use crate::metrics::Metrics;
use crate::storage::{Invoice, InvoiceInsert, InvoiceStore};
use crate::utils::IsTransient;

/// Creates one invoice per order.
///
/// Redelivered events find the existing invoice and succeed without writing,
/// so at-least-once delivery yields exactly one invoice per `orderId`.
pub struct OrderCreatedHandler {
    store: Arc<dyn InvoiceStore>,
    metrics: Option<Arc<Metrics>>,
}

impl OrderCreatedHandler {
    pub fn new(store: Arc<dyn InvoiceStore>) -> Self {
        Self { store, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl MessageHandler for OrderCreatedHandler {
    type Message = OrderCreatedMessage;

    async fn handle(
        &self,
        envelope: EventEnvelope<OrderCreatedMessage>,
        ctx: &DeliveryContext,
    ) -> Result<(), HandlerError> {
        let order_id = envelope.payload.order_id;

        let outcome = self
            .store
            .create_for_order(&Invoice::for_order(order_id))
            .await
            .map_err(|e| {
                if e.is_transient() {
                    HandlerError::transient(e)
                } else {
                    HandlerError::permanent(e)
                }
            })?;

        match outcome {
            InvoiceInsert::Created(invoice) => {
                if let Some(metrics) = &self.metrics {
                    metrics.invoices_created.inc();
                }
                tracing::info!(
                    invoice_id = %invoice.id,
                    order_id = %order_id,
                    amount = envelope.payload.amount,
                    event_id = %envelope.event_id,
                    "Invoice created"
                );
            }
            InvoiceInsert::AlreadyExists(invoice) => {
                if let Some(metrics) = &self.metrics {
                    metrics.duplicate_events.inc();
                }
                tracing::info!(
                    invoice_id = %invoice.id,
                    order_id = %order_id,
                    event_id = %envelope.event_id,
                    delivery_count = ctx.delivery_count,
                    "Invoice already exists, skipping duplicate event"
                );
            }
        }
        Ok(())
    }
}
