//! Shared harness for the integration suites.
//!
//! Boots the real router against a throwaway SQLite database, with the
//! gateway and carrier swapped for in-memory stubs that record every
//! call. Suites drive it with `oneshot` requests, so the whole HTTP
//! stack runs in-process without a listening socket.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use uuid::Uuid;

use orderflow_api::carrier::{CarrierApi, CreateShipmentRequest, ShipmentCreated};
use orderflow_api::config::AppConfig;
use orderflow_api::entities::{order, payment};
use orderflow_api::errors::ServiceError;
use orderflow_api::events::{self, outbox, EventSender};
use orderflow_api::gateway::{
    GatewayStatus, InquiryResult, IntentRequest, PaymentGateway, PaymentIntent,
};
use orderflow_api::handlers::{USER_ID_HEADER, USER_ROLE_HEADER};
use orderflow_api::services::stock::AdjustStockRequest;
use orderflow_api::services::AppServices;
use orderflow_api::{db, signature, AppState};

/// Programmable gateway double. `create_intent` succeeds unless a
/// failure is armed; `inquire` answers whatever the suite configured.
pub struct StubGateway {
    pub intents: Mutex<Vec<IntentRequest>>,
    pub inquiries: Mutex<Vec<String>>,
    intent_failure: Mutex<Option<String>>,
    inquiry_answer: Mutex<InquiryResult>,
}

impl Default for StubGateway {
    fn default() -> Self {
        Self {
            intents: Mutex::new(Vec::new()),
            inquiries: Mutex::new(Vec::new()),
            intent_failure: Mutex::new(None),
            inquiry_answer: Mutex::new(InquiryResult::unknown("stub gateway not armed")),
        }
    }
}

impl StubGateway {
    pub fn fail_intents_with(&self, message: &str) {
        *self.intent_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn answer_inquiries_with(&self, status: GatewayStatus) {
        *self.inquiry_answer.lock().unwrap() = InquiryResult {
            status,
            message: None,
        };
    }

    pub fn intent_count(&self) -> usize {
        self.intents.lock().unwrap().len()
    }

    pub fn inquiry_count(&self) -> usize {
        self.inquiries.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl PaymentGateway for StubGateway {
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, ServiceError> {
        if let Some(message) = self.intent_failure.lock().unwrap().clone() {
            return Err(ServiceError::ExternalUnavailable(message));
        }
        self.intents.lock().unwrap().push(request.clone());
        Ok(PaymentIntent {
            transaction_id: request.transaction_id.clone(),
            redirect_url: format!("https://gateway.test/pay/{}", request.transaction_id),
        })
    }

    async fn inquire(&self, transaction_id: &str) -> InquiryResult {
        self.inquiries
            .lock()
            .unwrap()
            .push(transaction_id.to_string());
        self.inquiry_answer.lock().unwrap().clone()
    }
}

/// Carrier double that mints sequential tracking numbers and records
/// bookings, cancellations and waybill fetches.
pub struct StubCarrier {
    pub bookings: Mutex<Vec<CreateShipmentRequest>>,
    pub cancellations: Mutex<Vec<String>>,
    pub waybill_requests: Mutex<Vec<String>>,
    booking_failure: Mutex<Option<String>>,
    refuse_cancel: Mutex<bool>,
    sequence: AtomicU32,
}

impl Default for StubCarrier {
    fn default() -> Self {
        Self {
            bookings: Mutex::new(Vec::new()),
            cancellations: Mutex::new(Vec::new()),
            waybill_requests: Mutex::new(Vec::new()),
            booking_failure: Mutex::new(None),
            refuse_cancel: Mutex::new(false),
            sequence: AtomicU32::new(0),
        }
    }
}

impl StubCarrier {
    pub fn fail_bookings_with(&self, message: &str) {
        *self.booking_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn accept_bookings(&self) {
        *self.booking_failure.lock().unwrap() = None;
    }

    pub fn refuse_cancellations(&self) {
        *self.refuse_cancel.lock().unwrap() = true;
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.lock().unwrap().len()
    }

    pub fn last_booking(&self) -> Option<CreateShipmentRequest> {
        self.bookings.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl CarrierApi for StubCarrier {
    async fn create_shipment(
        &self,
        request: &CreateShipmentRequest,
    ) -> Result<ShipmentCreated, ServiceError> {
        if let Some(message) = self.booking_failure.lock().unwrap().clone() {
            return Err(ServiceError::ExternalUnavailable(message));
        }
        self.bookings.lock().unwrap().push(request.clone());
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ShipmentCreated {
            tracking_number: format!("FLTEST{:06}", n),
        })
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError> {
        if *self.refuse_cancel.lock().unwrap() {
            return Err(ServiceError::PreconditionFailed(format!(
                "Carrier already dispatched {}",
                tracking_number
            )));
        }
        self.cancellations
            .lock()
            .unwrap()
            .push(tracking_number.to_string());
        Ok(())
    }

    async fn get_waybill(&self, tracking_number: &str) -> Result<Vec<u8>, ServiceError> {
        self.waybill_requests
            .lock()
            .unwrap()
            .push(tracking_number.to_string());
        Ok(format!("%PDF-1.4 waybill {}", tracking_number).into_bytes())
    }
}

/// Harness around one fully wired application instance.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<StubGateway>,
    pub carrier: Arc<StubCarrier>,
    event_task: JoinHandle<()>,
    _db_dir: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_stubs(
            Arc::new(StubGateway::default()),
            Arc::new(StubCarrier::default()),
        )
        .await
    }

    pub async fn with_stubs(gateway: Arc<StubGateway>, carrier: Arc<StubCarrier>) -> Self {
        let db_dir = tempfile::tempdir().expect("create sqlite tempdir");
        let db_path = db_dir.path().join("orderflow_test.sqlite");

        let mut config = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "development".to_string(),
        );
        // One connection serializes writers, which file-backed SQLite
        // needs, and the sweep must not sleep between candidates.
        config.db_max_connections = 1;
        config.db_min_connections = 1;
        config.reconciliation.inter_request_delay_ms = 0;

        let db = db::establish_connection_from_app_config(&config)
            .await
            .expect("connect to test database");
        db::run_migrations(&db).await.expect("run migrations");
        let db = Arc::new(db);

        let (event_tx, event_rx) = mpsc::channel(64);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway_port: Arc<dyn PaymentGateway> = gateway.clone();
        let carrier_port: Arc<dyn CarrierApi> = carrier.clone();
        let services = AppServices::build(
            db.clone(),
            &config,
            gateway_port,
            carrier_port,
            Some(Arc::new(event_sender.clone())),
        );

        let state = AppState {
            db,
            config,
            event_sender,
            services,
        };

        let router = orderflow_api::root_routes()
            .nest("/api/v1", orderflow_api::api_v1_routes())
            .with_state(state.clone());

        Self {
            router,
            state,
            gateway,
            carrier,
            event_task,
            _db_dir: db_dir,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("route request")
    }

    pub async fn get(&self, uri: &str, headers: &[(&str, &str)]) -> Response<Body> {
        self.request(Method::GET, uri, None, headers).await
    }

    pub async fn post_json(
        &self,
        uri: &str,
        body: Value,
        headers: &[(&str, &str)],
    ) -> Response<Body> {
        self.request(Method::POST, uri, Some(body), headers).await
    }

    /// POST a form-encoded body, the gateway's postback wire format.
    pub async fn post_form(&self, uri: &str, form: &[(&str, &str)]) -> Response<Body> {
        let encoded = form
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(encoded))
            .expect("build form request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("route request")
    }

    /// POST a carrier webhook with a fresh HMAC over the exact body.
    pub async fn post_signed_webhook(
        &self,
        path: &str,
        secret: &str,
        payload: &Value,
    ) -> Response<Body> {
        let timestamp = Utc::now().timestamp().to_string();
        self.post_webhook_signed_at(path, secret, payload, &timestamp)
            .await
    }

    /// Same, with a caller-chosen signing timestamp (for staleness tests).
    pub async fn post_webhook_signed_at(
        &self,
        path: &str,
        secret: &str,
        payload: &Value,
        timestamp: &str,
    ) -> Response<Body> {
        let body = payload.to_string();
        let sig = signature::sign_body(secret, Some(timestamp), body.as_bytes());
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header(signature::SIGNATURE_HEADER, sig)
            .header(signature::TIMESTAMP_HEADER, timestamp)
            .body(Body::from(body))
            .expect("build webhook request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("route request")
    }

    pub fn carrier_secret_v1(&self) -> String {
        self.state.config.carrier.webhook_secret_v1.clone()
    }

    pub fn carrier_secret_v2(&self) -> String {
        self.state.config.carrier.webhook_secret_v2.clone()
    }

    pub fn gateway_secret(&self) -> String {
        self.state.config.gateway.secret.clone()
    }

    /// Run the outbox to exhaustion, the deterministic stand-in for the
    /// background worker. Returns how many rows were delivered.
    pub async fn drain_outbox(&self) -> usize {
        let dispatcher = self.state.services.dispatcher();
        let mut total = 0;
        loop {
            let delivered = outbox::drain_once(&self.state.db, dispatcher.as_ref(), 50)
                .await
                .expect("drain outbox");
            if delivered == 0 {
                break;
            }
            total += delivered;
        }
        total
    }

    pub async fn seed_stock(&self, sku: &str, quantity: i32) {
        self.state
            .services
            .stock
            .adjust(AdjustStockRequest {
                sku: sku.to_string(),
                delta: quantity,
                reason: "initial stock intake".to_string(),
                name: Some(format!("Item {}", sku)),
            })
            .await
            .expect("seed stock");
    }

    /// Rewind a payment's clock so the reconciliation sweep sees it as
    /// overdue.
    pub async fn backdate_payment(
        &self,
        order_id: Uuid,
        status_changed_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) {
        payment::Entity::update_many()
            .col_expr(
                payment::Column::StatusChangedAt,
                Expr::value(status_changed_at),
            )
            .col_expr(payment::Column::CreatedAt, Expr::value(created_at))
            .filter(payment::Column::OrderId.eq(order_id))
            .exec(&*self.state.db)
            .await
            .expect("backdate payment");
    }

    /// Rewind an order's `updated_at` past the auto-completion window.
    pub async fn backdate_order(&self, order_id: Uuid, updated_at: DateTime<Utc>) {
        order::Entity::update_many()
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(updated_at)))
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.state.db)
            .await
            .expect("backdate order");
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

pub fn admin_headers() -> Vec<(&'static str, &'static str)> {
    vec![
        (USER_ID_HEADER, "00000000-0000-0000-0000-0000000000ad"),
        (USER_ROLE_HEADER, "admin"),
    ]
}

pub fn customer_headers(user_id: &Uuid) -> Vec<(String, String)> {
    vec![(USER_ID_HEADER.to_string(), user_id.to_string())]
}

/// Borrowing view of owned header pairs, for `request`-style helpers.
pub fn as_header_refs(headers: &[(String, String)]) -> Vec<(&str, &str)> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

pub fn order_payload(customer_id: Uuid, sku: &str, quantity: i32, payment_method: &str) -> Value {
    json!({
        "customer_id": customer_id,
        "items": [{"sku": sku, "quantity": quantity, "unit_price": "150.00"}],
        "currency": "PHP",
        "shipping_address": "1428 Mabini St, Makati",
        "customer_email": "shopper@example.com",
        "payment_method": payment_method,
    })
}

pub async fn response_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is JSON")
}

pub async fn response_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    String::from_utf8(bytes.to_vec()).expect("response body is UTF-8")
}
