//! Reconciliation sweep behavior, driven synchronously.
//!
//! The poller normally fires on an interval; these tests call
//! `run_sweep_once` directly so every assertion is deterministic. The
//! sweep has three legs: inquire on stuck awaiting payments, promote
//! long-delivered orders, purge expired idempotency markers.

mod common;

use chrono::{Duration, Utc};
use common::{admin_headers, order_payload, response_json, TestApp};
use orderflow_api::entities::processed_event;
use orderflow_api::gateway::GatewayStatus;
use sea_orm::sea_query::Expr;
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::json;
use uuid::Uuid;

/// Checkout one gateway order. Returns the order id and transaction id.
async fn gateway_order(app: &TestApp, sku: &str, quantity: i32) -> (Uuid, String) {
    app.seed_stock(sku, 5).await;
    let body = response_json(
        app.post_json(
            "/api/v1/orders",
            order_payload(Uuid::new_v4(), sku, quantity, "gateway"),
            &[],
        )
        .await,
    )
    .await;
    let order = &body["data"]["order"];
    (
        Uuid::parse_str(order["id"].as_str().expect("order id")).expect("order id is a uuid"),
        format!("{}-1", order["order_code"].as_str().expect("order code")),
    )
}

async fn order_state(app: &TestApp, order_id: Uuid) -> (String, String) {
    let detail = response_json(
        app.get(&format!("/api/v1/orders/{}", order_id), &admin_headers())
            .await,
    )
    .await;
    (
        detail["data"]["order"]["status"].as_str().expect("status").to_string(),
        detail["data"]["order"]["payment_status"]
            .as_str()
            .expect("payment status")
            .to_string(),
    )
}

/// Deliver a COD order end to end and hand back its id.
async fn delivered_cod_order(app: &TestApp, sku: &str) -> Uuid {
    app.seed_stock(sku, 3).await;
    let body = response_json(
        app.post_json(
            "/api/v1/orders",
            order_payload(Uuid::new_v4(), sku, 1, "cash_on_delivery"),
            &[],
        )
        .await,
    )
    .await;
    let order_id = Uuid::parse_str(body["data"]["order"]["id"].as_str().expect("order id"))
        .expect("order id is a uuid");
    app.drain_outbox().await;

    let detail = response_json(
        app.get(&format!("/api/v1/orders/{}", order_id), &admin_headers())
            .await,
    )
    .await;
    let tracking = detail["data"]["order"]["tracking_number"]
        .as_str()
        .expect("tracking number")
        .to_string();
    let delivered = app
        .post_signed_webhook(
            "/webhooks/carrier/v2",
            &app.carrier_secret_v2(),
            &json!({
                "tracking_number": tracking,
                "event_name": "DELIVERED",
                "event_id": format!("evt-{}", tracking),
            }),
        )
        .await;
    assert_eq!(delivered.status(), axum::http::StatusCode::OK);
    app.drain_outbox().await;
    order_id
}

#[tokio::test]
async fn fresh_awaiting_payments_are_left_alone() {
    let app = TestApp::new().await;
    let (order_id, _) = gateway_order(&app, "SKU-SWEEP-1", 1).await;
    app.gateway.answer_inquiries_with(GatewayStatus::Succeeded);

    let report = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("sweep");

    // Inside the grace window the webhook still gets first shot.
    assert_eq!(report.inquired, 0);
    assert_eq!(app.gateway.inquiry_count(), 0);
    let (status, payment) = order_state(&app, order_id).await;
    assert_eq!(status, "processing");
    assert_eq!(payment, "awaiting_for_confirmation");
}

#[tokio::test]
async fn a_lost_success_webhook_is_recovered_by_the_sweep() {
    let app = TestApp::new().await;
    let (order_id, txnid) = gateway_order(&app, "SKU-SWEEP-2", 1).await;
    app.backdate_payment(
        order_id,
        Utc::now() - Duration::minutes(30),
        Utc::now() - Duration::days(1),
    )
    .await;
    app.gateway.answer_inquiries_with(GatewayStatus::Succeeded);

    let report = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("sweep");

    assert_eq!(report.inquired, 1);
    assert_eq!(report.transitioned, 1);
    assert_eq!(report.timed_out, 0);
    assert_eq!(app.gateway.inquiries.lock().expect("inquiries")[0], txnid);

    let (status, payment) = order_state(&app, order_id).await;
    assert_eq!(status, "for_packing");
    assert_eq!(payment, "paid");

    // The recovered payment books a parcel exactly like the webhook path.
    assert_eq!(app.drain_outbox().await, 2);
    assert_eq!(app.carrier.booking_count(), 1);

    // Nothing left for the next firing.
    let again = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("second sweep");
    assert_eq!(again.inquired, 0);
}

#[tokio::test]
async fn a_declined_payment_found_by_the_sweep_cancels_and_restocks() {
    let app = TestApp::new().await;
    let (order_id, _) = gateway_order(&app, "SKU-SWEEP-3", 2).await;
    app.backdate_payment(
        order_id,
        Utc::now() - Duration::minutes(30),
        Utc::now() - Duration::days(1),
    )
    .await;
    app.gateway.answer_inquiries_with(GatewayStatus::Failed);

    let report = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("sweep");
    assert_eq!(report.transitioned, 1);
    assert_eq!(report.timed_out, 0);

    let (status, payment) = order_state(&app, order_id).await;
    assert_eq!(status, "cancelled");
    assert_eq!(payment, "failed");

    let stock = response_json(app.get("/api/v1/stock/SKU-SWEEP-3", &[]).await).await;
    assert_eq!(stock["data"]["available"], 5);

    // One cancellation notice, no shipment.
    assert_eq!(app.drain_outbox().await, 1);
    assert_eq!(app.carrier.booking_count(), 0);
}

#[tokio::test]
async fn a_pending_answer_is_left_for_the_next_sweep() {
    let app = TestApp::new().await;
    let (order_id, _) = gateway_order(&app, "SKU-SWEEP-4", 1).await;
    app.backdate_payment(
        order_id,
        Utc::now() - Duration::minutes(30),
        Utc::now() - Duration::days(1),
    )
    .await;
    app.gateway.answer_inquiries_with(GatewayStatus::Pending);

    let report = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("sweep");
    assert_eq!(report.inquired, 1);
    assert_eq!(report.transitioned, 0);
    assert_eq!(report.timed_out, 0);

    let (status, payment) = order_state(&app, order_id).await;
    assert_eq!(status, "processing");
    assert_eq!(payment, "awaiting_for_confirmation");

    // Still a candidate: the next sweep asks again.
    app.state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("second sweep");
    assert_eq!(app.gateway.inquiry_count(), 2);
}

#[tokio::test]
async fn an_unanswerable_payment_times_out_and_fails() {
    let app = TestApp::new().await;
    let (order_id, _) = gateway_order(&app, "SKU-SWEEP-5", 1).await;
    // Stuck for three days; the gateway has no definitive answer.
    app.backdate_payment(
        order_id,
        Utc::now() - Duration::minutes(30),
        Utc::now() - Duration::hours(73),
    )
    .await;
    app.gateway.answer_inquiries_with(GatewayStatus::Pending);

    let report = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("sweep");
    assert_eq!(report.inquired, 1);
    assert_eq!(report.timed_out, 1);
    assert_eq!(report.transitioned, 0);

    let (status, payment) = order_state(&app, order_id).await;
    assert_eq!(status, "cancelled");
    assert_eq!(payment, "failed");

    let stock = response_json(app.get("/api/v1/stock/SKU-SWEEP-5", &[]).await).await;
    assert_eq!(stock["data"]["available"], 5);
}

#[tokio::test]
async fn orders_delivered_long_enough_are_completed() {
    let app = TestApp::new().await;
    let order_id = delivered_cod_order(&app, "SKU-SWEEP-6").await;
    app.backdate_order(order_id, Utc::now() - Duration::hours(73)).await;

    let report = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("sweep");
    assert_eq!(report.completed, 1);

    let (status, payment) = order_state(&app, order_id).await;
    assert_eq!(status, "completed");
    assert_eq!(payment, "paid");

    // Completion is one-shot.
    let again = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("second sweep");
    assert_eq!(again.completed, 0);
}

#[tokio::test]
async fn recently_delivered_orders_keep_their_return_window() {
    let app = TestApp::new().await;
    let order_id = delivered_cod_order(&app, "SKU-SWEEP-7").await;

    let report = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("sweep");
    assert_eq!(report.completed, 0);

    let (status, _) = order_state(&app, order_id).await;
    assert_eq!(status, "delivered");
}

#[tokio::test]
async fn expired_idempotency_markers_are_purged() {
    let app = TestApp::new().await;
    let order_id = delivered_cod_order(&app, "SKU-SWEEP-8").await;

    // The marker is fresh, so the first sweep leaves it alone.
    let report = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("sweep");
    assert_eq!(report.purged_markers, 0);

    processed_event::Entity::update_many()
        .col_expr(
            processed_event::Column::ExpiresAt,
            Expr::value(Utc::now() - Duration::hours(1)),
        )
        .exec(&*app.state.db)
        .await
        .expect("expire markers");

    let report = app
        .state
        .services
        .reconciliation
        .run_sweep_once()
        .await
        .expect("second sweep");
    assert_eq!(report.purged_markers, 1);
    assert_eq!(
        processed_event::Entity::find()
            .count(&*app.state.db)
            .await
            .expect("count markers"),
        0
    );

    // Purging the marker never touches the order itself.
    let (status, payment) = order_state(&app, order_id).await;
    assert_eq!(status, "delivered");
    assert_eq!(payment, "paid");
}
