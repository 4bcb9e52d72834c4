use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::entities::order::{self, Entity as OrderEntity, Model as OrderModel};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::payment;
use crate::entities::tracking_event::{self, Entity as TrackingEventEntity};
use crate::errors::ServiceError;
use crate::events::{outbox, Event, EventSender};
use crate::services::payments::{PaymentsService, METHOD_COD, METHOD_GATEWAY};
use crate::services::shipments::ShipmentsService;
use crate::services::stock;
use crate::services::transitions::{
    NoOpReason, TransitionOutcome, TransitionRequest, TransitionService,
};
use crate::state_machine::{OrderStatus, PaymentStatus, TransitionSource};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemRequest {
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "At least one item is required"))]
    pub items: Vec<OrderItemRequest>,
    #[validate(length(min = 3, max = 3, message = "Currency must be 3 characters"))]
    pub currency: String,
    #[validate(length(min = 1, message = "Shipping address is required"))]
    pub shipping_address: String,
    pub billing_address: Option<String>,
    #[validate(email(message = "Customer email must be a valid address"))]
    pub customer_email: String,
    pub notes: Option<String>,
    /// `gateway` or `cash_on_delivery`.
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
}

fn default_payment_method() -> String {
    METHOD_GATEWAY.to_owned()
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_code: String,
    pub customer_id: Uuid,
    pub status: String,
    pub payment_status: String,
    pub total_amount: Decimal,
    pub currency: String,
    pub tracking_number: Option<String>,
    pub shipping_address: String,
    pub billing_address: Option<String>,
    pub customer_email: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

impl From<OrderModel> for OrderResponse {
    fn from(model: OrderModel) -> Self {
        Self {
            id: model.id,
            order_code: model.order_code,
            customer_id: model.customer_id,
            status: model.status,
            payment_status: model.payment_status,
            total_amount: model.total_amount,
            currency: model.currency,
            tracking_number: model.tracking_number,
            shipping_address: model.shipping_address,
            billing_address: model.billing_address,
            customer_email: model.customer_email,
            notes: model.notes,
            created_at: model.created_at,
            updated_at: model.updated_at,
            version: model.version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderItemResponse {
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

impl From<order_item::Model> for OrderItemResponse {
    fn from(model: order_item::Model) -> Self {
        Self {
            sku: model.sku,
            name: model.name,
            quantity: model.quantity,
            unit_price: model.unit_price,
            total_price: model.total_price,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderDetailResponse {
    pub order: OrderResponse,
    pub items: Vec<OrderItemResponse>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResponse {
    pub order: OrderDetailResponse,
    /// Present for gateway orders; the customer completes payment there.
    pub redirect_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TrackingEventResponse {
    pub status: String,
    pub description: String,
    pub location: Option<String>,
    pub event_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderTrackingResponse {
    pub order_code: String,
    pub status: String,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub on_return_leg: bool,
    pub events: Vec<TrackingEventResponse>,
}

fn generate_order_code(now: DateTime<Utc>, order_id: Uuid) -> String {
    let mut tail = order_id.simple().to_string();
    tail.truncate(8);
    format!("ORD-{}-{}", now.format("%Y%m%d"), tail.to_uppercase())
}

fn order_total(items: &[OrderItemRequest]) -> Decimal {
    items
        .iter()
        .map(|item| item.unit_price * Decimal::from(item.quantity))
        .sum()
}

fn initial_states(method: &str) -> Result<(OrderStatus, PaymentStatus), ServiceError> {
    match method {
        METHOD_GATEWAY => Ok((OrderStatus::PendingPayment, PaymentStatus::Pending)),
        // Cash on delivery is shippable immediately; the money arrives
        // with the delivery confirmation.
        METHOD_COD => Ok((OrderStatus::ForPacking, PaymentStatus::CodPending)),
        other => Err(ServiceError::ValidationError(format!(
            "Unknown payment method: {}",
            other
        ))),
    }
}

/// Checkout, lookup, and user-facing lifecycle actions. All status
/// mutation after creation goes through the transition service.
#[derive(Clone)]
pub struct OrdersService {
    db: Arc<DatabaseConnection>,
    payments: Arc<PaymentsService>,
    shipments: Arc<ShipmentsService>,
    transitions: Arc<TransitionService>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrdersService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        payments: Arc<PaymentsService>,
        shipments: Arc<ShipmentsService>,
        transitions: Arc<TransitionService>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            payments,
            shipments,
            transitions,
            event_sender,
        }
    }

    /// Create an order: reserve stock, persist order + items + payment in
    /// one transaction, then issue the payment intent. A gateway failure
    /// after the commit unwinds by cancelling the order, which releases
    /// the reservation again.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn checkout(
        &self,
        request: CreateOrderRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        for item in &request.items {
            if item.sku.trim().is_empty() {
                return Err(ServiceError::ValidationError(
                    "Item SKU is required".to_string(),
                ));
            }
            if item.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Quantity for {} must be positive",
                    item.sku
                )));
            }
            if item.unit_price < Decimal::ZERO {
                return Err(ServiceError::ValidationError(format!(
                    "Unit price for {} cannot be negative",
                    item.sku
                )));
            }
        }
        let (order_status, payment_status) = initial_states(&request.payment_method)?;

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_code = generate_order_code(now, order_id);
        let total = order_total(&request.items);
        let lines: Vec<(String, i32)> = request
            .items
            .iter()
            .map(|item| (item.sku.clone(), item.quantity))
            .collect();

        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for checkout");
            ServiceError::db_error(e)
        })?;

        let stock_rows = stock::reserve_for_order(&txn, order_id, &lines).await?;

        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_code: Set(order_code.clone()),
            customer_id: Set(request.customer_id),
            status: Set(order_status.to_string()),
            payment_status: Set(payment_status.to_string()),
            total_amount: Set(total),
            currency: Set(request.currency.clone()),
            tracking_number: Set(None),
            shipping_address: Set(request.shipping_address.clone()),
            billing_address: Set(request.billing_address.clone()),
            customer_email: Set(request.customer_email.clone()),
            notes: Set(request.notes.clone()),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to create order");
            ServiceError::db_error(e)
        })?;

        for (item, stock_row) in request.items.iter().zip(&stock_rows) {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                sku: Set(item.sku.clone()),
                name: Set(stock_row.name.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                total_price: Set(item.unit_price * Decimal::from(item.quantity)),
                created_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        }

        payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            method: Set(request.payment_method.clone()),
            status: Set(payment_status.to_string()),
            amount: Set(total),
            currency: Set(request.currency.clone()),
            transaction_id: Set(None),
            reference_number: Set(None),
            status_changed_at: Set(now),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        if request.payment_method == METHOD_COD {
            // Already shippable; hand the shipment creation to the outbox
            // worker in the same commit.
            outbox::enqueue(
                &txn,
                "order",
                &order_id.to_string(),
                outbox::EVENT_CREATE_SHIPMENT,
                &serde_json::json!({ "order_id": order_id }),
            )
            .await?;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit checkout transaction");
            ServiceError::db_error(e)
        })?;

        counter!("orderflow.orders.created", 1);
        info!(order_id = %order_id, order_code = %order_code, method = %request.payment_method, "order created");
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(Event::OrderCreated(order_id)).await {
                warn!(error = %e, order_id = %order_id, "failed to send order created event");
            }
        }

        let mut redirect_url = None;
        if request.payment_method == METHOD_GATEWAY {
            match self.payments.issue_intent(&order_model).await {
                Ok(intent) => {
                    let advance = TransitionRequest {
                        order_id,
                        target: OrderStatus::Processing,
                        source: TransitionSource::System,
                        external_id: order_id.to_string(),
                        event_signature: "intent_issued".to_owned(),
                        payment_update: None,
                        shipment_update: None,
                    };
                    // The confirmation edge stays reachable from
                    // pending_payment, so a failure here only costs the
                    // intermediate status.
                    if let Err(e) = self.transitions.apply(advance).await {
                        warn!(error = %e, order_id = %order_id, "could not advance order to processing");
                    }
                    redirect_url = Some(intent.redirect_url);
                }
                Err(err) => {
                    warn!(error = %err, order_id = %order_id, "payment intent issuance failed, unwinding checkout");
                    counter!("orderflow.checkout.intent_failed", 1);
                    let compensation = TransitionRequest {
                        order_id,
                        target: OrderStatus::Cancelled,
                        source: TransitionSource::System,
                        external_id: order_id.to_string(),
                        event_signature: "intent_failed".to_owned(),
                        payment_update: None,
                        shipment_update: None,
                    };
                    if let Err(comp) = self.transitions.apply(compensation).await {
                        error!(error = %comp, order_id = %order_id, "checkout compensation failed, order remains pending_payment");
                    }
                    return Err(err);
                }
            }
        }

        let order = self.get_order(order_id).await?;
        Ok(CheckoutResponse {
            order,
            redirect_url,
        })
    }

    /// Resolve an order by UUID or by its external order code.
    pub async fn resolve(&self, reference: &str) -> Result<OrderModel, ServiceError> {
        let found = match Uuid::parse_str(reference) {
            Ok(id) => OrderEntity::find_by_id(id).one(&*self.db).await,
            Err(_) => {
                OrderEntity::find()
                    .filter(order::Column::OrderCode.eq(reference))
                    .one(&*self.db)
                    .await
            }
        }
        .map_err(ServiceError::db_error)?;
        found.ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", reference)))
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetailResponse, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        self.detail(order).await
    }

    /// Build the detail view for an already-loaded order row.
    pub async fn detail(&self, order: OrderModel) -> Result<OrderDetailResponse, ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(OrderDetailResponse {
            order: order.into(),
            items: items.into_iter().map(Into::into).collect(),
        })
    }

    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
        status: Option<OrderStatus>,
        customer_id: Option<Uuid>,
    ) -> Result<OrderListResponse, ServiceError> {
        let page = page.max(1);
        let mut query = OrderEntity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status.to_string()));
        }
        if let Some(customer_id) = customer_id {
            query = query.filter(order::Column::CustomerId.eq(customer_id));
        }

        let paginator = query.paginate(&*self.db, per_page);
        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let orders = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(OrderListResponse {
            orders: orders.into_iter().map(Into::into).collect(),
            total,
            page,
            per_page,
        })
    }

    /// User-initiated cancellation. Accepted only while the parcel has
    /// not been picked up; once a shipment exists the carrier must agree
    /// before any local state moves.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<OrderDetailResponse, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let status = OrderStatus::parse(&order.status)?;

        if status == OrderStatus::Cancelled {
            info!(order_id = %order_id, "order already cancelled");
            return self.get_order(order_id).await;
        }
        if !status.is_pre_pickup() {
            return Err(ServiceError::PreconditionFailed(format!(
                "Order {} cannot be cancelled at this stage ({})",
                order.order_code, status
            )));
        }

        let shipment = self.shipments.find_by_order(order_id).await?;
        if let Some(shipment) = &shipment {
            // Carrier first: if it refuses, nothing local changes.
            self.shipments
                .cancel_at_carrier(&shipment.tracking_number)
                .await?;
        }

        let outcome = self
            .transitions
            .apply(TransitionRequest {
                order_id,
                target: OrderStatus::Cancelled,
                source: TransitionSource::User,
                external_id: order_id.to_string(),
                event_signature: "user_cancel".to_owned(),
                payment_update: None,
                shipment_update: None,
            })
            .await?;

        match outcome {
            TransitionOutcome::Applied { from, .. } => {
                counter!("orderflow.orders.cancelled", 1);
                info!(order_id = %order_id, %from, "order cancelled by user");
                if let Some(shipment) = &shipment {
                    let audit = tracking_event::ActiveModel {
                        tracking_number: Set(shipment.tracking_number.clone()),
                        order_id: Set(order_id),
                        status: Set(OrderStatus::Cancelled.to_string()),
                        description: Set("Cancelled at customer request".to_owned()),
                        location: Set(None),
                        event_at: Set(Utc::now()),
                        raw_payload: Set(serde_json::json!({ "source": "user" }).to_string()),
                        created_at: Set(Utc::now()),
                        ..Default::default()
                    };
                    if let Err(e) = audit.insert(&*self.db).await {
                        warn!(error = %e, order_id = %order_id, "failed to record cancellation tracking event");
                    }
                    if let Some(sender) = &self.event_sender {
                        let event = Event::ShipmentCancelled {
                            order_id,
                            tracking_number: shipment.tracking_number.clone(),
                        };
                        if let Err(e) = sender.send(event).await {
                            warn!(order_id = %order_id, error = %e, "failed to send shipment-cancelled event");
                        }
                    }
                }
            }
            TransitionOutcome::NoOp {
                reason: NoOpReason::Duplicate,
            } => {
                info!(order_id = %order_id, "cancellation already applied by a concurrent request");
            }
            TransitionOutcome::NoOp {
                reason: NoOpReason::Unreachable { from, .. },
            } => {
                // The order advanced between our check and the write.
                return Err(ServiceError::PreconditionFailed(format!(
                    "Order {} cannot be cancelled at this stage ({})",
                    order.order_code, from
                )));
            }
            TransitionOutcome::PaymentApplied { .. } => {}
        }

        self.get_order(order_id).await
    }

    /// Tracking history for the customer-facing view.
    pub async fn tracking(&self, order_id: Uuid) -> Result<OrderTrackingResponse, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let shipment = self.shipments.find_by_order(order_id).await?;
        let events = TrackingEventEntity::find()
            .filter(tracking_event::Column::OrderId.eq(order_id))
            .order_by_asc(tracking_event::Column::EventAt)
            .order_by_asc(tracking_event::Column::Id)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(OrderTrackingResponse {
            order_code: order.order_code,
            status: order.status,
            tracking_number: order.tracking_number,
            carrier: shipment.as_ref().map(|s| s.carrier.clone()),
            on_return_leg: shipment.as_ref().map(|s| s.on_return_leg).unwrap_or(false),
            events: events
                .into_iter()
                .map(|e| TrackingEventResponse {
                    status: e.status,
                    description: e.description,
                    location: e.location,
                    event_at: e.event_at,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn order_code_embeds_date_and_id_prefix() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let code = generate_order_code(at, Uuid::nil());
        assert_eq!(code, "ORD-20240601-00000000");
        assert!(code.len() <= 50);
    }

    #[test]
    fn total_sums_quantity_times_unit_price() {
        let items = vec![
            OrderItemRequest {
                sku: "SKU-A".into(),
                quantity: 2,
                unit_price: dec!(19.99),
            },
            OrderItemRequest {
                sku: "SKU-B".into(),
                quantity: 1,
                unit_price: dec!(5.00),
            },
        ];
        assert_eq!(order_total(&items), dec!(44.98));
    }

    #[test]
    fn initial_states_depend_on_payment_method() {
        assert_eq!(
            initial_states(METHOD_GATEWAY).unwrap(),
            (OrderStatus::PendingPayment, PaymentStatus::Pending)
        );
        assert_eq!(
            initial_states(METHOD_COD).unwrap(),
            (OrderStatus::ForPacking, PaymentStatus::CodPending)
        );
        assert_matches!(
            initial_states("store_credit"),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn checkout_request_rejects_empty_items_and_bad_email() {
        let request = CreateOrderRequest {
            customer_id: Uuid::new_v4(),
            items: vec![],
            currency: "USD".into(),
            shipping_address: "1 Main St".into(),
            billing_address: None,
            customer_email: "buyer@example.com".into(),
            notes: None,
            payment_method: METHOD_GATEWAY.into(),
        };
        assert!(request.validate().is_err());

        let request = CreateOrderRequest {
            customer_id: Uuid::new_v4(),
            items: vec![OrderItemRequest {
                sku: "SKU-A".into(),
                quantity: 1,
                unit_price: dec!(10.00),
            }],
            currency: "USD".into(),
            shipping_address: "1 Main St".into(),
            billing_address: None,
            customer_email: "not-an-email".into(),
            notes: None,
            payment_method: METHOD_GATEWAY.into(),
        };
        assert!(request.validate().is_err());
    }
}
