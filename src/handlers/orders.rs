use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use std::str::FromStr;

use crate::errors::ServiceError;
use crate::handlers::shipments::ShipmentResponse;
use crate::handlers::Identity;
use crate::services::orders::{
    CheckoutResponse, CreateOrderRequest, OrderDetailResponse, OrderListResponse,
    OrderTrackingResponse,
};
use crate::state_machine::OrderStatus;
use crate::{ApiResponse, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
    pub status: Option<String>,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}

fn parse_status_filter(raw: &str) -> Result<OrderStatus, ServiceError> {
    OrderStatus::from_str(raw)
        .map_err(|_| ServiceError::ValidationError(format!("Unknown order status: {}", raw)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Create order",
    description = "Create an order, reserve stock for every line and, for gateway payments, issue a payment intent whose redirect URL is returned to the caller",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutResponse>>), ServiceError> {
    let checkout = state.services.orders.checkout(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(checkout))))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List orders",
    description = "Page through orders, newest first. Customers only see their own orders; admins see everything",
    params(
        ("page" = Option<u64>, Query, description = "Page number (default: 1)"),
        ("per_page" = Option<u64>, Query, description = "Items per page (default: 20, max: 100)"),
        ("status" = Option<String>, Query, description = "Filter by order status, e.g. for_packing"),
    ),
    responses(
        (status = 200, description = "Orders retrieved", body = ApiResponse<OrderListResponse>),
        (status = 400, description = "Invalid status filter", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing caller identity", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ListOrdersQuery>,
) -> ApiResult<OrderListResponse> {
    let status = query
        .status
        .as_deref()
        .map(parse_status_filter)
        .transpose()?;
    let customer_scope = if identity.is_admin() {
        None
    } else {
        Some(identity.require_user_id()?)
    };
    let list = state
        .services
        .orders
        .list_orders(query.page, query.per_page, status, customer_scope)
        .await?;
    Ok(Json(ApiResponse::success(list)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    description = "Fetch one order with its line items. Accepts the order UUID or the public order code",
    params(("id" = String, Path, description = "Order UUID or order code")),
    responses(
        (status = 200, description = "Order retrieved", body = ApiResponse<OrderDetailResponse>),
        (status = 403, description = "Order belongs to another customer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<OrderDetailResponse> {
    let order = state.services.orders.resolve(&reference).await?;
    identity.authorize_order(order.customer_id)?;
    let detail = state.services.orders.detail(order).await?;
    Ok(Json(ApiResponse::success(detail)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    summary = "Cancel order",
    description = "Cancel an order that has not shipped yet. Releases reserved stock and flags paid orders for refund",
    params(("id" = String, Path, description = "Order UUID or order code")),
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<OrderDetailResponse>),
        (status = 403, description = "Order belongs to another customer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order is past the point of cancellation", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<OrderDetailResponse> {
    let order = state.services.orders.resolve(&reference).await?;
    identity.authorize_order(order.customer_id)?;
    let detail = state.services.orders.cancel_order(order.id).await?;
    Ok(Json(ApiResponse::success(detail)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/tracking",
    summary = "Order tracking timeline",
    description = "Return the order's shipment (when one exists) and every tracking event recorded for it, oldest first",
    params(("id" = String, Path, description = "Order UUID or order code")),
    responses(
        (status = 200, description = "Tracking timeline retrieved", body = ApiResponse<OrderTrackingResponse>),
        (status = 403, description = "Order belongs to another customer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn order_tracking(
    State(state): State<AppState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<OrderTrackingResponse> {
    let order = state.services.orders.resolve(&reference).await?;
    identity.authorize_order(order.customer_id)?;
    let tracking = state.services.orders.tracking(order.id).await?;
    Ok(Json(ApiResponse::success(tracking)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/shipment",
    summary = "Create or retry shipment",
    description = "Admin escape hatch: push the order's shipment to the carrier now instead of waiting for the background worker. Safe to repeat, an existing shipment is returned as-is",
    params(("id" = String, Path, description = "Order UUID or order code")),
    responses(
        (status = 200, description = "Shipment present at the carrier", body = ApiResponse<ShipmentResponse>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order is not ready to ship", body = crate::errors::ErrorResponse),
        (status = 502, description = "Carrier unavailable", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "orders"
)]
pub async fn create_order_shipment(
    State(state): State<AppState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<ShipmentResponse> {
    identity.require_admin()?;
    let order = state.services.orders.resolve(&reference).await?;
    let shipment = state.services.shipments.ensure_shipment(order.id).await?;
    Ok(Json(ApiResponse::success(shipment.into())))
}
