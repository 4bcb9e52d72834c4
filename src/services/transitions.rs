use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::payment::{self, Entity as PaymentEntity};
use crate::entities::processed_event::{self, Entity as ProcessedEvent};
use crate::entities::shipment::{self, Entity as ShipmentEntity};
use crate::errors::ServiceError;
use crate::events::{outbox, Event, EventSender};
use crate::gateway::GatewayStatus;
use crate::services::stock;
use crate::state_machine::{OrderStatus, PaymentStatus, TransitionSource};

/// Requested change to the payment axis, applied only if valid from
/// the payment's current status.
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub reference_number: Option<String>,
}

/// Carrier-side bookkeeping carried along with a transition.
#[derive(Debug, Clone)]
pub struct ShipmentUpdate {
    pub event_name: String,
    pub event_at: chrono::DateTime<chrono::Utc>,
    pub failure_reason: Option<String>,
    pub on_return_leg: bool,
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub order_id: Uuid,
    pub target: OrderStatus,
    pub source: TransitionSource,
    /// External identity of the event origin: gateway transaction id
    /// or carrier tracking number.
    pub external_id: String,
    /// Distinguishes events from the same origin, e.g. `name|timestamp`
    /// for carrier webhooks or the reported status for the gateway.
    pub event_signature: String,
    pub payment_update: Option<PaymentUpdate>,
    pub shipment_update: Option<ShipmentUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoOpReason {
    /// The (source, external id, signature) triple was already applied.
    Duplicate,
    /// The target is not reachable from the current status.
    Unreachable {
        from: OrderStatus,
        to: OrderStatus,
    },
}

impl NoOpReason {
    /// The typed error this no-op stands in for, for callers that log
    /// or surface the rejection rather than swallowing it.
    pub fn as_error(&self) -> ServiceError {
        match self {
            NoOpReason::Duplicate => {
                ServiceError::DuplicateEvent("event was already applied".to_string())
            }
            NoOpReason::Unreachable { from, to } => {
                ServiceError::invalid_transition(from.as_str(), to.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The order moved. The payment axis may have moved with it.
    Applied { from: OrderStatus, to: OrderStatus },
    /// Only the payment axis moved; the order edge was absent or
    /// unreachable.
    PaymentApplied {
        payment_from: PaymentStatus,
        payment_to: PaymentStatus,
    },
    NoOp { reason: NoOpReason },
}

/// Map a definitive gateway status onto the shared state-machine edge.
/// `None` means nothing definitive happened yet (pending/unknown).
/// Webhook callbacks and the reconciliation poller both go through
/// this table, so a polled result drives exactly the transition its
/// missing webhook would have.
pub fn gateway_transition_for(status: GatewayStatus) -> Option<(OrderStatus, PaymentStatus)> {
    match status {
        GatewayStatus::Succeeded | GatewayStatus::Authorized => {
            Some((OrderStatus::ForPacking, PaymentStatus::Paid))
        }
        GatewayStatus::Failed | GatewayStatus::Voided => {
            Some((OrderStatus::Cancelled, PaymentStatus::Failed))
        }
        GatewayStatus::Refunded | GatewayStatus::Chargeback => {
            Some((OrderStatus::Cancelled, PaymentStatus::Refunded))
        }
        GatewayStatus::Pending | GatewayStatus::Unknown => None,
    }
}

/// Sole mutation entry point for the order/payment/shipment triple.
/// One transaction per call covers the idempotency marker, all three
/// aggregates, the stock ledger when the edge demands it, and the
/// outbox rows for downstream side effects.
#[derive(Clone)]
pub struct TransitionService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<Arc<EventSender>>,
    idempotency_ttl_hours: i64,
}

impl TransitionService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Option<Arc<EventSender>>,
        idempotency_ttl_hours: i64,
    ) -> Self {
        Self {
            db,
            event_sender,
            idempotency_ttl_hours,
        }
    }

    #[instrument(
        skip(self, request),
        fields(
            order_id = %request.order_id,
            target = %request.target,
            source = %request.source,
            external_id = %request.external_id
        )
    )]
    pub async fn apply(&self, request: TransitionRequest) -> Result<TransitionOutcome, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        if !self.mark_processed(&txn, &request).await? {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            counter!("orderflow.transitions.duplicate", 1);
            info!("event already applied, suppressing side effects");
            return Ok(TransitionOutcome::NoOp {
                reason: NoOpReason::Duplicate,
            });
        }

        let order = OrderEntity::find_by_id(request.order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", request.order_id))
            })?;
        let from = OrderStatus::parse(&order.status)
            .map_err(|_| ServiceError::EventError(format!(
                "order {} has unrecognized status {:?}",
                order.id, order.status
            )))?;

        let payment = PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        let shipment = ShipmentEntity::find()
            .filter(shipment::Column::OrderId.eq(order.id))
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let order_edge_ok = from.can_transition_to(request.target);

        // COD collects at the door: the delivery edge is what marks the
        // payment received.
        let mut payment_update = request.payment_update.clone();
        if order_edge_ok && request.target == OrderStatus::Delivered {
            if let Some(ref p) = payment {
                if PaymentStatus::parse(&p.status).ok() == Some(PaymentStatus::CodPending) {
                    payment_update = Some(PaymentUpdate {
                        status: PaymentStatus::Paid,
                        reference_number: None,
                    });
                }
            }
        }

        // The order status the payment write will land next to: the
        // target when the edge is taken, the current status otherwise.
        let settled_status = if order_edge_ok { request.target } else { from };
        let payment_result = self
            .apply_payment_update(&txn, payment.as_ref(), payment_update.as_ref(), settled_status)
            .await?;

        if !order_edge_ok && payment_result.is_none() {
            // Consume the idempotency marker anyway: the DAG only moves
            // forward, so a target unreachable now never becomes
            // reachable by replaying the same event.
            txn.commit().await.map_err(ServiceError::db_error)?;
            counter!("orderflow.transitions.rejected", 1);
            warn!(from = %from, to = %request.target, "transition target unreachable, recorded no-op");
            return Ok(TransitionOutcome::NoOp {
                reason: NoOpReason::Unreachable {
                    from,
                    to: request.target,
                },
            });
        }

        let released = if order_edge_ok {
            self.apply_order_edge(&txn, &order, from, &request, payment.as_ref(), shipment.as_ref())
                .await?
        } else {
            Vec::new()
        };

        let became_paid = matches!(
            payment_result,
            Some((prev, PaymentStatus::Paid)) if prev != PaymentStatus::Paid
        );
        if became_paid && order_edge_ok && request.target.is_shipment_ready() {
            outbox::enqueue(
                &txn,
                "order",
                &order.id.to_string(),
                outbox::EVENT_CREATE_SHIPMENT,
                &serde_json::json!({ "order_id": order.id }),
            )
            .await?;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        self.emit_payment_event(&order, payment.as_ref(), payment_result, &request.external_id)
            .await;

        if order_edge_ok {
            counter!("orderflow.transitions.committed", 1);
            self.emit_post_commit(&order, from, request.target, &request.source, &released)
                .await;
            Ok(TransitionOutcome::Applied {
                from,
                to: request.target,
            })
        } else {
            let (payment_from, payment_to) =
                payment_result.unwrap_or((PaymentStatus::Pending, PaymentStatus::Pending));
            info!(%payment_from, %payment_to, "payment axis updated without an order edge");
            Ok(TransitionOutcome::PaymentApplied {
                payment_from,
                payment_to,
            })
        }
    }

    // Insert the dedupe marker; false means the triple already exists.
    async fn mark_processed(
        &self,
        txn: &DatabaseTransaction,
        request: &TransitionRequest,
    ) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let row = processed_event::ActiveModel {
            source: Set(request.source.to_string()),
            external_id: Set(request.external_id.clone()),
            event_signature: Set(request.event_signature.clone()),
            expires_at: Set(now + chrono::Duration::hours(self.idempotency_ttl_hours)),
            created_at: Set(now),
            ..Default::default()
        };
        let insert = ProcessedEvent::insert(row)
            .on_conflict(
                OnConflict::columns([
                    processed_event::Column::Source,
                    processed_event::Column::ExternalId,
                    processed_event::Column::EventSignature,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec(txn)
            .await;
        match insert {
            Ok(_) => Ok(true),
            Err(DbErr::RecordNotInserted) => Ok(false),
            Err(e) => Err(ServiceError::db_error(e)),
        }
    }

    async fn apply_payment_update(
        &self,
        txn: &DatabaseTransaction,
        payment: Option<&payment::Model>,
        update: Option<&PaymentUpdate>,
        order_status: OrderStatus,
    ) -> Result<Option<(PaymentStatus, PaymentStatus)>, ServiceError> {
        let (Some(payment), Some(update)) = (payment, update) else {
            return Ok(None);
        };
        let current = PaymentStatus::parse(&payment.status).map_err(|_| {
            ServiceError::EventError(format!(
                "payment {} has unrecognized status {:?}",
                payment.id, payment.status
            ))
        })?;

        // A successful charge landing on an order that already closed
        // (cancelled before the gateway confirmed, typically) must not
        // read paid: the money was collected and is owed back.
        let mut target = update.status;
        if target == PaymentStatus::Paid && order_status.is_terminal() {
            warn!(
                payment_id = %payment.id,
                %order_status,
                "successful charge landed on a closed order, flagging for refund"
            );
            counter!("orderflow.payments.refund_flagged", 1);
            target = PaymentStatus::Refunded;
        }

        if current == target || !current.can_transition_to(target) {
            if current != target {
                warn!(
                    payment_id = %payment.id,
                    from = %current,
                    to = %target,
                    "payment status change not allowed, skipping"
                );
            }
            return Ok(None);
        }

        let now = Utc::now();
        let mut active: payment::ActiveModel = payment.clone().into();
        active.status = Set(target.to_string());
        active.status_changed_at = Set(now);
        active.updated_at = Set(Some(now));
        if let Some(ref reference) = update.reference_number {
            active.reference_number = Set(Some(reference.clone()));
        }
        active.update(txn).await.map_err(ServiceError::db_error)?;
        Self::mirror_payment_status(txn, payment.order_id, target).await?;
        Ok(Some((current, target)))
    }

    // The order row carries a denormalized copy of the payment axis so
    // list and detail reads stay single-table. Keep it in lockstep with
    // every payments-table write.
    async fn mirror_payment_status(
        txn: &DatabaseTransaction,
        order_id: Uuid,
        status: PaymentStatus,
    ) -> Result<(), ServiceError> {
        OrderEntity::update_many()
            .col_expr(
                order::Column::PaymentStatus,
                Expr::value(status.to_string()),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .exec(txn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    async fn apply_order_edge(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        from: OrderStatus,
        request: &TransitionRequest,
        payment: Option<&payment::Model>,
        shipment: Option<&shipment::Model>,
    ) -> Result<Vec<stock::ReleasedLine>, ServiceError> {
        let now = Utc::now();
        let target = request.target;

        // Optimistic write: a concurrent transition on the same order
        // loses here and surfaces as a conflict instead of silently
        // clobbering.
        let updated = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(target.to_string()))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Version.eq(order.version))
            .exec(txn)
            .await
            .map_err(ServiceError::db_error)?;
        if updated.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "order {} was modified concurrently",
                order.id
            )));
        }

        if let Some(shipment) = shipment {
            let mut active: shipment::ActiveModel = shipment.clone().into();
            active.status = Set(target.to_string());
            active.updated_at = Set(Some(now));
            if let Some(ref update) = request.shipment_update {
                active.last_event_name = Set(Some(update.event_name.clone()));
                active.last_event_at = Set(Some(update.event_at));
                if update.failure_reason.is_some() {
                    active.failure_reason = Set(update.failure_reason.clone());
                }
                if update.on_return_leg {
                    active.on_return_leg = Set(true);
                }
            }
            active.update(txn).await.map_err(ServiceError::db_error)?;
        }

        let released = match target {
            OrderStatus::Cancelled => {
                let released = stock::release_for_order(txn, order.id, "order cancelled").await?;
                self.mark_payment_for_refund(txn, payment).await?;
                self.enqueue_notification(txn, order, "cancelled").await?;
                released
            }
            OrderStatus::Returned => {
                let released = stock::release_for_order(txn, order.id, "order returned").await?;
                self.enqueue_notification(txn, order, "returned").await?;
                released
            }
            OrderStatus::Delivered => {
                self.enqueue_notification(txn, order, "delivered").await?;
                Vec::new()
            }
            _ => Vec::new(),
        };

        Ok(released)
    }

    // Cancellation refund-marking: money already taken flips to
    // refunded, an uncollected payment is closed out as failed.
    async fn mark_payment_for_refund(
        &self,
        txn: &DatabaseTransaction,
        payment: Option<&payment::Model>,
    ) -> Result<(), ServiceError> {
        let Some(payment) = payment else {
            return Ok(());
        };
        let current = PaymentStatus::parse(&payment.status).ok();
        let next = match current {
            Some(PaymentStatus::Paid) => PaymentStatus::Refunded,
            Some(PaymentStatus::Pending)
            | Some(PaymentStatus::AwaitingForConfirmation)
            | Some(PaymentStatus::CodPending) => PaymentStatus::Failed,
            _ => return Ok(()),
        };
        let now = Utc::now();
        let mut active: payment::ActiveModel = payment.clone().into();
        active.status = Set(next.to_string());
        active.status_changed_at = Set(now);
        active.updated_at = Set(Some(now));
        active.update(txn).await.map_err(ServiceError::db_error)?;
        Self::mirror_payment_status(txn, payment.order_id, next).await?;
        Ok(())
    }

    async fn enqueue_notification(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        kind: &str,
    ) -> Result<(), ServiceError> {
        outbox::enqueue(
            txn,
            "order",
            &order.id.to_string(),
            outbox::EVENT_SEND_NOTIFICATION,
            &serde_json::json!({
                "order_id": order.id,
                "order_code": order.order_code,
                "email": order.customer_email,
                "kind": kind,
            }),
        )
        .await
    }

    async fn emit_payment_event(
        &self,
        order: &order::Model,
        payment: Option<&payment::Model>,
        payment_result: Option<(PaymentStatus, PaymentStatus)>,
        external_id: &str,
    ) {
        let Some(sender) = &self.event_sender else {
            return;
        };
        let transaction_id = payment
            .and_then(|p| p.transaction_id.clone())
            .unwrap_or_else(|| external_id.to_string());
        let event = match payment_result {
            Some((prev, PaymentStatus::Paid)) if prev != PaymentStatus::Paid => {
                Event::PaymentConfirmed {
                    order_id: order.id,
                    transaction_id,
                }
            }
            Some((prev, PaymentStatus::Failed)) if prev != PaymentStatus::Failed => {
                Event::PaymentFailed {
                    order_id: order.id,
                    transaction_id,
                }
            }
            _ => return,
        };
        if let Err(e) = sender.send(event).await {
            warn!(order_id = %order.id, error = %e, "failed to send payment event");
        }
    }

    async fn emit_post_commit(
        &self,
        order: &order::Model,
        from: OrderStatus,
        to: OrderStatus,
        source: &TransitionSource,
        released: &[stock::ReleasedLine],
    ) {
        let Some(sender) = &self.event_sender else {
            return;
        };
        let event = Event::OrderStatusChanged {
            order_id: order.id,
            old_status: from.to_string(),
            new_status: to.to_string(),
            source: source.to_string(),
        };
        if let Err(e) = sender.send(event).await {
            warn!(order_id = %order.id, error = %e, "failed to send status-changed event");
        }
        let extra = match to {
            OrderStatus::Cancelled => Some(Event::OrderCancelled(order.id)),
            OrderStatus::Delivered => Some(Event::OrderDelivered(order.id)),
            OrderStatus::Completed => Some(Event::OrderCompleted(order.id)),
            _ => None,
        };
        if let Some(event) = extra {
            if let Err(e) = sender.send(event).await {
                warn!(order_id = %order.id, error = %e, "failed to send transition event");
            }
        }
        for line in released {
            let event = Event::StockReleased {
                order_id: order.id,
                sku: line.sku.clone(),
                quantity: line.quantity,
            };
            if let Err(e) = sender.send(event).await {
                warn!(order_id = %order.id, error = %e, "failed to send stock-released event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_success_maps_to_packing_and_paid() {
        assert_eq!(
            gateway_transition_for(GatewayStatus::Succeeded),
            Some((OrderStatus::ForPacking, PaymentStatus::Paid))
        );
        assert_eq!(
            gateway_transition_for(GatewayStatus::Authorized),
            Some((OrderStatus::ForPacking, PaymentStatus::Paid))
        );
    }

    #[test]
    fn gateway_failure_cancels_the_order() {
        assert_eq!(
            gateway_transition_for(GatewayStatus::Failed),
            Some((OrderStatus::Cancelled, PaymentStatus::Failed))
        );
        assert_eq!(
            gateway_transition_for(GatewayStatus::Voided),
            Some((OrderStatus::Cancelled, PaymentStatus::Failed))
        );
    }

    #[test]
    fn gateway_refund_marks_payment_refunded() {
        assert_eq!(
            gateway_transition_for(GatewayStatus::Refunded),
            Some((OrderStatus::Cancelled, PaymentStatus::Refunded))
        );
        assert_eq!(
            gateway_transition_for(GatewayStatus::Chargeback),
            Some((OrderStatus::Cancelled, PaymentStatus::Refunded))
        );
    }

    #[test]
    fn indeterminate_gateway_status_drives_nothing() {
        assert_eq!(gateway_transition_for(GatewayStatus::Pending), None);
        assert_eq!(gateway_transition_for(GatewayStatus::Unknown), None);
    }

    #[test]
    fn noop_reasons_map_to_typed_errors() {
        assert!(matches!(
            NoOpReason::Duplicate.as_error(),
            ServiceError::DuplicateEvent(_)
        ));
        let reason = NoOpReason::Unreachable {
            from: OrderStatus::Delivered,
            to: OrderStatus::Cancelled,
        };
        assert!(matches!(
            reason.as_error(),
            ServiceError::InvalidTransition { .. }
        ));
    }
}
