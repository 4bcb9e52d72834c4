use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, SqlErr,
    TransactionTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::carrier::{parcel_weight_kg, CarrierApi, CreateShipmentRequest};
use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::payment::{self, Entity as PaymentEntity};
use crate::entities::shipment::{self, Entity as ShipmentEntity};
use crate::entities::tracking_event;
use crate::errors::ServiceError;
use crate::events::{outbox, Event, EventSender};
use crate::services::payments::METHOD_COD;
use crate::state_machine::{OrderStatus, PaymentStatus};

#[derive(Clone)]
pub struct ShipmentsService {
    db: Arc<DatabaseConnection>,
    carrier: Arc<dyn CarrierApi>,
    carrier_name: String,
    event_sender: Option<Arc<EventSender>>,
}

impl ShipmentsService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carrier: Arc<dyn CarrierApi>,
        carrier_name: String,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            carrier,
            carrier_name,
            event_sender,
        }
    }

    pub fn carrier(&self) -> &dyn CarrierApi {
        self.carrier.as_ref()
    }

    /// Create the order's shipment at the carrier, idempotently by
    /// order id: once a tracking number is persisted every later call
    /// is a no-op returning the existing row. Driven by the outbox, so
    /// at-least-once delivery still yields exactly one carrier booking.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn ensure_shipment(&self, order_id: Uuid) -> Result<shipment::Model, ServiceError> {
        if let Some(existing) = self.find_by_order(order_id).await? {
            info!(tracking_number = %existing.tracking_number, "shipment already exists, skipping");
            return Ok(existing);
        }

        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let payment = PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No payment row for order {}", order_id))
            })?;

        let order_status = OrderStatus::parse(&order.status)?;
        let payment_status = PaymentStatus::parse(&payment.status)?;
        if !payment_status.is_shippable() {
            return Err(ServiceError::PreconditionFailed(format!(
                "Order {} payment is {}, not shippable",
                order.order_code, payment_status
            )));
        }
        if !order_status.is_shipment_ready() {
            return Err(ServiceError::PreconditionFailed(format!(
                "Order {} is {}, not ready for shipment",
                order.order_code, order_status
            )));
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        let total_units: i32 = items.iter().map(|i| i.quantity).sum();

        let cod_amount = (payment.method == METHOD_COD
            && payment_status == PaymentStatus::CodPending)
            .then_some(order.total_amount);

        let created = self
            .carrier
            .create_shipment(&CreateShipmentRequest {
                request_id: order.order_code.clone(),
                recipient_address: order.shipping_address.clone(),
                recipient_email: order.customer_email.clone(),
                weight_kg: parcel_weight_kg(total_units),
                cod_amount,
                currency: order.currency.clone(),
                description: format!("Order {}", order.order_code),
            })
            .await?;

        let now = Utc::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let row = shipment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            tracking_number: Set(created.tracking_number.clone()),
            carrier: Set(self.carrier_name.clone()),
            status: Set(order.status.clone()),
            failure_reason: Set(None),
            on_return_leg: Set(false),
            last_event_name: Set(None),
            last_event_at: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        };
        let inserted = match row.insert(&txn).await {
            Ok(model) => model,
            // A concurrent worker won the unique order_id index race;
            // its row is the truth.
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                return self.find_by_order(order_id).await?.ok_or_else(|| {
                    ServiceError::Conflict(format!(
                        "shipment insert for order {} conflicted but no row exists",
                        order_id
                    ))
                });
            }
            Err(e) => return Err(ServiceError::db_error(e)),
        };

        let mut order_active: order::ActiveModel = order.clone().into();
        order_active.tracking_number = Set(Some(created.tracking_number.clone()));
        order_active.updated_at = Set(Some(now));
        order_active
            .update(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let event_row = tracking_event::ActiveModel {
            tracking_number: Set(created.tracking_number.clone()),
            order_id: Set(order_id),
            status: Set(order.status.clone()),
            description: Set("Shipment created with carrier".into()),
            location: Set(None),
            event_at: Set(now),
            raw_payload: Set(serde_json::json!({ "request_id": order.order_code }).to_string()),
            created_at: Set(now),
            ..Default::default()
        };
        event_row.insert(&txn).await.map_err(ServiceError::db_error)?;

        outbox::enqueue(
            &txn,
            "order",
            &order_id.to_string(),
            outbox::EVENT_SEND_NOTIFICATION,
            &serde_json::json!({
                "order_id": order_id,
                "order_code": order.order_code,
                "email": order.customer_email,
                "kind": "dispatched",
            }),
        )
        .await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(tracking_number = %inserted.tracking_number, "shipment created");
        if let Some(sender) = &self.event_sender {
            let event = Event::ShipmentCreated {
                order_id,
                tracking_number: inserted.tracking_number.clone(),
            };
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to send shipment-created event");
            }
        }

        Ok(inserted)
    }

    pub async fn find_by_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<shipment::Model>, ServiceError> {
        ShipmentEntity::find()
            .filter(shipment::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn find_by_tracking(
        &self,
        tracking_number: &str,
    ) -> Result<shipment::Model, ServiceError> {
        ShipmentEntity::find()
            .filter(shipment::Column::TrackingNumber.eq(tracking_number))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No shipment with tracking {}", tracking_number))
            })
    }

    /// Ask the carrier to cancel. Local rows are not touched here; the
    /// caller drives the cancellation transition only after the carrier
    /// accepts.
    pub async fn cancel_at_carrier(&self, tracking_number: &str) -> Result<(), ServiceError> {
        self.carrier.cancel_shipment(tracking_number).await
    }

    pub async fn waybill(&self, tracking_number: &str) -> Result<Vec<u8>, ServiceError> {
        // Confirm we know the shipment before proxying to the carrier.
        self.find_by_tracking(tracking_number).await?;
        self.carrier.get_waybill(tracking_number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mockall::predicate::eq;
    use sea_orm::Database;

    use crate::carrier::MockCarrierApi;

    async fn service_with(carrier: MockCarrierApi) -> ShipmentsService {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("sqlite connection");
        ShipmentsService::new(Arc::new(db), Arc::new(carrier), "stub-carrier".into(), None)
    }

    #[tokio::test]
    async fn cancel_at_carrier_passes_the_tracking_number_through() {
        let mut carrier = MockCarrierApi::new();
        carrier
            .expect_cancel_shipment()
            .with(eq("TRK-4401"))
            .times(1)
            .returning(|_| Ok(()));

        let service = service_with(carrier).await;
        service
            .cancel_at_carrier("TRK-4401")
            .await
            .expect("carrier accepted");
    }

    #[tokio::test]
    async fn a_carrier_refusal_surfaces_as_a_precondition_failure() {
        let mut carrier = MockCarrierApi::new();
        carrier.expect_cancel_shipment().times(1).returning(|_| {
            Err(ServiceError::PreconditionFailed(
                "parcel already picked up".into(),
            ))
        });

        let service = service_with(carrier).await;
        let err = service.cancel_at_carrier("TRK-4402").await.unwrap_err();
        assert!(matches!(err, ServiceError::PreconditionFailed(_)));
    }
}
