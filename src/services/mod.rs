pub mod notifications;
pub mod orders;
pub mod payments;
pub mod reconciliation;
pub mod shipments;
pub mod stock;
pub mod transitions;

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::carrier::CarrierApi;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::outbox::{self, OutboxHandler};
use crate::events::EventSender;
use crate::gateway::PaymentGateway;

use self::notifications::{NotificationService, OrderNotification};
use self::orders::OrdersService;
use self::payments::PaymentsService;
use self::reconciliation::ReconciliationService;
use self::shipments::ShipmentsService;
use self::stock::StockService;
use self::transitions::TransitionService;

/// All services wired onto their shared dependencies. Cheap to clone;
/// everything inside is reference-counted.
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrdersService>,
    pub payments: Arc<PaymentsService>,
    pub shipments: Arc<ShipmentsService>,
    pub stock: Arc<StockService>,
    pub transitions: Arc<TransitionService>,
    pub notifications: Arc<NotificationService>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl AppServices {
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        carrier: Arc<dyn CarrierApi>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let transitions = Arc::new(TransitionService::new(
            db.clone(),
            event_sender.clone(),
            config.idempotency_ttl_hours,
        ));
        let payments = Arc::new(PaymentsService::new(db.clone(), gateway));
        let shipments = Arc::new(ShipmentsService::new(
            db.clone(),
            carrier,
            config.carrier.name.clone(),
            event_sender.clone(),
        ));
        let stock = Arc::new(StockService::new(db.clone()));
        let notifications = Arc::new(NotificationService::new(
            &config.notifications,
            event_sender.clone(),
        ));
        let orders = Arc::new(OrdersService::new(
            db.clone(),
            payments.clone(),
            shipments.clone(),
            transitions.clone(),
            event_sender,
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            db,
            payments.clone(),
            transitions.clone(),
            config.reconciliation.clone(),
        ));
        Self {
            orders,
            payments,
            shipments,
            stock,
            transitions,
            notifications,
            reconciliation,
        }
    }

    /// Outbox handler backed by these services; hand it to the worker.
    pub fn dispatcher(&self) -> Arc<SideEffectDispatcher> {
        Arc::new(SideEffectDispatcher {
            shipments: self.shipments.clone(),
            notifications: self.notifications.clone(),
        })
    }
}

/// Executes committed outbox rows against the adapters. Retryable
/// failures bubble up so the worker can back off; permanent ones are
/// logged and dropped so the queue does not wedge.
pub struct SideEffectDispatcher {
    shipments: Arc<ShipmentsService>,
    notifications: Arc<NotificationService>,
}

#[async_trait]
impl OutboxHandler for SideEffectDispatcher {
    async fn handle(
        &self,
        event_type: &str,
        aggregate_id: &str,
        payload: &Value,
    ) -> Result<(), ServiceError> {
        match event_type {
            outbox::EVENT_CREATE_SHIPMENT => {
                let order_id = Uuid::parse_str(aggregate_id).map_err(|_| {
                    ServiceError::EventError(format!(
                        "outbox aggregate id {} is not a uuid",
                        aggregate_id
                    ))
                })?;
                match self.shipments.ensure_shipment(order_id).await {
                    Ok(_) => Ok(()),
                    // The order moved on before the worker got here,
                    // e.g. it was cancelled. No retry will change that.
                    Err(ServiceError::PreconditionFailed(reason)) => {
                        warn!(%order_id, %reason, "shipment creation no longer applicable, dropping");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            outbox::EVENT_SEND_NOTIFICATION => {
                let notification: OrderNotification = serde_json::from_value(payload.clone())
                    .map_err(|e| {
                        ServiceError::EventError(format!("bad notification payload: {}", e))
                    })?;
                self.notifications.dispatch(&notification).await
            }
            other => {
                warn!(event_type = other, "unknown outbox event type, dropping");
                Ok(())
            }
        }
    }
}
