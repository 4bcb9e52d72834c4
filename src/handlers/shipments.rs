use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::shipment;
use crate::errors::ServiceError;
use crate::handlers::Identity;
use crate::{ApiResponse, ApiResult, AppState};

#[derive(Debug, Serialize, ToSchema)]
#[schema(example = json!({
    "id": "990e8400-e29b-41d4-a716-446655440000",
    "order_id": "550e8400-e29b-41d4-a716-446655440000",
    "tracking_number": "FL2024120900042",
    "carrier": "fastline",
    "status": "shipped",
    "failure_reason": null,
    "on_return_leg": false,
    "last_event_name": "IN_TRANSIT",
    "last_event_at": "2024-12-09T14:30:00Z",
    "created_at": "2024-12-09T10:30:00Z",
    "updated_at": "2024-12-09T14:30:00Z"
}))]
pub struct ShipmentResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub tracking_number: String,
    pub carrier: String,
    pub status: String,
    pub failure_reason: Option<String>,
    pub on_return_leg: bool,
    pub last_event_name: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<shipment::Model> for ShipmentResponse {
    fn from(model: shipment::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            tracking_number: model.tracking_number,
            carrier: model.carrier,
            status: model.status,
            failure_reason: model.failure_reason,
            on_return_leg: model.on_return_leg,
            last_event_name: model.last_event_name,
            last_event_at: model.last_event_at,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/shipments/{tracking_number}",
    summary = "Get shipment",
    description = "Fetch a shipment by its carrier tracking number",
    params(("tracking_number" = String, Path, description = "Carrier tracking number")),
    responses(
        (status = 200, description = "Shipment retrieved", body = ApiResponse<ShipmentResponse>),
        (status = 403, description = "Shipment belongs to another customer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Shipment not found", body = crate::errors::ErrorResponse),
    ),
    tag = "shipments"
)]
pub async fn get_shipment(
    State(state): State<AppState>,
    identity: Identity,
    Path(tracking_number): Path<String>,
) -> ApiResult<ShipmentResponse> {
    let shipment = authorized_shipment(&state, &identity, &tracking_number).await?;
    Ok(Json(ApiResponse::success(shipment.into())))
}

#[utoipa::path(
    get,
    path = "/api/v1/shipments/{tracking_number}/waybill",
    summary = "Download waybill",
    description = "Proxy the carrier's waybill PDF for a shipment",
    params(("tracking_number" = String, Path, description = "Carrier tracking number")),
    responses(
        (status = 200, description = "Waybill PDF", content_type = "application/pdf"),
        (status = 403, description = "Shipment belongs to another customer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Shipment not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Carrier unavailable", body = crate::errors::ErrorResponse),
    ),
    tag = "shipments"
)]
pub async fn get_waybill(
    State(state): State<AppState>,
    identity: Identity,
    Path(tracking_number): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let shipment = authorized_shipment(&state, &identity, &tracking_number).await?;
    let pdf = state
        .services
        .shipments
        .waybill(&shipment.tracking_number)
        .await?;
    let headers = [
        (header::CONTENT_TYPE, "application/pdf".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"waybill-{}.pdf\"",
                shipment.tracking_number
            ),
        ),
    ];
    Ok((headers, pdf))
}

/// Look up a shipment and check the caller may see it. Ownership lives on
/// the order, so this resolves the order row behind the shipment.
async fn authorized_shipment(
    state: &AppState,
    identity: &Identity,
    tracking_number: &str,
) -> Result<shipment::Model, ServiceError> {
    let shipment = state
        .services
        .shipments
        .find_by_tracking(tracking_number)
        .await?;
    if !identity.is_admin() {
        let order = state
            .services
            .orders
            .resolve(&shipment.order_id.to_string())
            .await?;
        identity.authorize_order(order.customer_id)?;
    }
    Ok(shipment)
}
