use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use tracing::{info, instrument};

use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::payment::{self, Entity as PaymentEntity};
use crate::errors::ServiceError;
use crate::gateway::{IntentRequest, PaymentGateway, PaymentIntent};
use crate::state_machine::PaymentStatus;

pub const METHOD_GATEWAY: &str = "gateway";
pub const METHOD_COD: &str = "cash_on_delivery";

/// Next transaction id for an order: the order code plus a monotonic
/// sequence number. A completed attempt keeps its id forever; a fresh
/// intent always gets the next sequence.
pub fn next_transaction_id(order_code: &str, current: Option<&str>) -> String {
    let next_seq = current
        .and_then(|id| id.strip_prefix(order_code))
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|seq| seq.parse::<u32>().ok())
        .map(|seq| seq + 1)
        .unwrap_or(1);
    format!("{}-{}", order_code, next_seq)
}

#[derive(Clone)]
pub struct PaymentsService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentsService {
    pub fn new(db: Arc<DatabaseConnection>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { db, gateway }
    }

    pub fn gateway(&self) -> &dyn PaymentGateway {
        self.gateway.as_ref()
    }

    /// Resolve a gateway transaction id back to its payment and order.
    /// Both callback endpoints and the poller share this mapping.
    pub async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<(payment::Model, order::Model), ServiceError> {
        let payment = PaymentEntity::find()
            .filter(payment::Column::TransactionId.eq(transaction_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No payment for transaction {}", transaction_id))
            })?;
        let order = OrderEntity::find_by_id(payment.order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", payment.order_id))
            })?;
        Ok((payment, order))
    }

    /// Issue a gateway intent for the order's payment row and move the
    /// payment to awaiting-confirmation. Called from checkout after the
    /// order has committed, so a gateway outage cannot hold a write
    /// transaction open.
    #[instrument(skip(self, order), fields(order_id = %order.id, order_code = %order.order_code))]
    pub async fn issue_intent(&self, order: &order::Model) -> Result<PaymentIntent, ServiceError> {
        let payment = PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No payment row for order {}", order.id))
            })?;

        let status = PaymentStatus::parse(&payment.status)?;
        if status == PaymentStatus::Paid {
            return Err(ServiceError::PreconditionFailed(format!(
                "Order {} is already paid",
                order.order_code
            )));
        }

        let transaction_id =
            next_transaction_id(&order.order_code, payment.transaction_id.as_deref());
        let intent = self
            .gateway
            .create_intent(&IntentRequest {
                transaction_id: transaction_id.clone(),
                amount: order.total_amount,
                currency: order.currency.clone(),
                description: format!("Order {}", order.order_code),
                customer_email: order.customer_email.clone(),
            })
            .await?;

        let now = Utc::now();
        let mut active: payment::ActiveModel = payment.into();
        active.transaction_id = Set(Some(transaction_id.clone()));
        active.status = Set(PaymentStatus::AwaitingForConfirmation.to_string());
        active.status_changed_at = Set(now);
        active.updated_at = Set(Some(now));
        active
            .update(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        // Keep the denormalized axis on the order row in step.
        OrderEntity::update_many()
            .col_expr(
                order::Column::PaymentStatus,
                Expr::value(PaymentStatus::AwaitingForConfirmation.to_string()),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        info!(%transaction_id, "payment intent issued");
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_intent_starts_at_one() {
        assert_eq!(
            next_transaction_id("ORD-20240601-0007", None),
            "ORD-20240601-0007-1"
        );
    }

    #[test]
    fn sequence_increments_from_previous_attempt() {
        assert_eq!(
            next_transaction_id("ORD-20240601-0007", Some("ORD-20240601-0007-1")),
            "ORD-20240601-0007-2"
        );
        assert_eq!(
            next_transaction_id("ORD-20240601-0007", Some("ORD-20240601-0007-9")),
            "ORD-20240601-0007-10"
        );
    }

    #[test]
    fn foreign_or_malformed_ids_restart_the_sequence() {
        assert_eq!(next_transaction_id("ORD-1", Some("OTHER-5")), "ORD-1-1");
        assert_eq!(next_transaction_id("ORD-1", Some("ORD-1-abc")), "ORD-1-1");
    }

    use crate::gateway::{MockPaymentGateway, PaymentIntent};
    use crate::state_machine::OrderStatus;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn seeded_db() -> (tempfile::TempDir, Arc<DatabaseConnection>, order::Model) {
        let dir = tempfile::tempdir().expect("sqlite tempdir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("payments_unit.sqlite").display()
        );
        let db = crate::db::establish_connection(&url).await.expect("connect");
        crate::db::run_migrations(&db).await.expect("migrations");

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_code: Set("ORD-UNIT-7".into()),
            customer_id: Set(Uuid::new_v4()),
            status: Set(OrderStatus::PendingPayment.to_string()),
            payment_status: Set(PaymentStatus::Pending.to_string()),
            total_amount: Set(dec!(150)),
            currency: Set("PHP".into()),
            tracking_number: Set(None),
            shipping_address: Set("12 Mabini St, Quezon City".into()),
            billing_address: Set(None),
            customer_email: Set("buyer@example.com".into()),
            notes: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
            version: Set(1),
        }
        .insert(&db)
        .await
        .expect("order row");
        payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            method: Set(METHOD_GATEWAY.into()),
            status: Set(PaymentStatus::Pending.to_string()),
            amount: Set(dec!(150)),
            currency: Set("PHP".into()),
            transaction_id: Set(None),
            reference_number: Set(None),
            status_changed_at: Set(now),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&db)
        .await
        .expect("payment row");

        (dir, Arc::new(db), order)
    }

    #[tokio::test]
    async fn issue_intent_sends_the_sequenced_id_and_moves_to_awaiting() {
        let (_dir, db, order) = seeded_db().await;
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_intent()
            .withf(|req| req.transaction_id == "ORD-UNIT-7-1" && req.amount == dec!(150))
            .times(1)
            .returning(|req| {
                Ok(PaymentIntent {
                    transaction_id: req.transaction_id.clone(),
                    redirect_url: "https://pay.example.test/r/1".into(),
                })
            });
        let service = PaymentsService::new(db, Arc::new(gateway));

        let intent = service.issue_intent(&order).await.expect("intent issued");
        assert_eq!(intent.transaction_id, "ORD-UNIT-7-1");

        let (payment, order) = service
            .find_by_transaction_id("ORD-UNIT-7-1")
            .await
            .expect("transaction lookup");
        assert_eq!(
            payment.status,
            PaymentStatus::AwaitingForConfirmation.to_string()
        );
        assert_eq!(
            order.payment_status,
            PaymentStatus::AwaitingForConfirmation.to_string()
        );
    }

    #[tokio::test]
    async fn issue_intent_refuses_an_already_paid_order() {
        let (_dir, db, order) = seeded_db().await;
        PaymentEntity::update_many()
            .col_expr(
                payment::Column::Status,
                Expr::value(PaymentStatus::Paid.to_string()),
            )
            .filter(payment::Column::OrderId.eq(order.id))
            .exec(&*db)
            .await
            .expect("mark paid");

        // The gateway must never see a second intent for settled money.
        let gateway = MockPaymentGateway::new();
        let service = PaymentsService::new(db, Arc::new(gateway));

        let err = service.issue_intent(&order).await.unwrap_err();
        assert!(matches!(err, ServiceError::PreconditionFailed(_)));
    }
}
