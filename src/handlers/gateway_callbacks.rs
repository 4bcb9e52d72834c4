use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::Json,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::entities::order;
use crate::errors::ServiceError;
use crate::gateway::{self, GatewayStatus};
use crate::services::transitions::{
    gateway_transition_for, PaymentUpdate, TransitionOutcome, TransitionRequest,
};
use crate::state_machine::TransitionSource;
use crate::{ApiResponse, ApiResult, AppState};

/// Parameters the gateway appends to the browser return redirect and
/// posts to the instant-notification URL. Field names are the gateway's
/// wire protocol, not ours.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CallbackParams {
    pub txnid: String,
    #[serde(default)]
    pub refno: Option<String>,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/return",
    summary = "Gateway browser return",
    description = "Landing endpoint for the shopper's redirect back from the gateway. Applies the reported status and shows where the order stands; the signed postback remains the authoritative channel",
    params(
        ("txnid" = String, Query, description = "Gateway transaction id"),
        ("refno" = Option<String>, Query, description = "Gateway reference number"),
        ("status" = String, Query, description = "Single-letter gateway status code"),
        ("message" = Option<String>, Query, description = "Human-readable gateway message"),
    ),
    responses(
        (status = 200, description = "Order state after applying the reported status", body = ApiResponse<Value>),
        (status = 404, description = "Unknown transaction id", body = crate::errors::ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn payment_return(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> ApiResult<Value> {
    counter!("orderflow.payments.callbacks", 1, "channel" => "return");
    let order = apply_gateway_callback(&state, &params).await?;

    // Re-read so the shopper sees the post-transition state.
    let detail = state.services.orders.get_order(order.id).await?;
    Ok(Json(ApiResponse::success(json!({
        "order_code": detail.order.order_code,
        "status": detail.order.status,
        "payment_status": detail.order.payment_status,
        "message": params.message,
    }))))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/postback",
    summary = "Gateway server postback",
    description = "Server-to-server instant notification from the gateway, form-encoded and authenticated by the shared-secret digest. The gateway retries until it reads result=OK",
    responses(
        (status = 200, description = "Acknowledged with result=OK"),
        (status = 401, description = "Digest missing or wrong"),
        (status = 404, description = "Unknown transaction id"),
    ),
    tag = "payments"
)]
pub async fn payment_postback(
    State(state): State<AppState>,
    Form(params): Form<CallbackParams>,
) -> Result<(StatusCode, &'static str), ServiceError> {
    let digest = params
        .digest
        .as_deref()
        .ok_or(ServiceError::SignatureInvalid)?;
    gateway::verify_callback_digest(
        &params.txnid,
        params.refno.as_deref().unwrap_or(""),
        &params.status,
        params.message.as_deref().unwrap_or(""),
        &state.config.gateway.secret,
        digest,
    )?;
    counter!("orderflow.payments.callbacks", 1, "channel" => "postback");

    apply_gateway_callback(&state, &params).await?;
    Ok((StatusCode::OK, "result=OK"))
}

/// Resolve the transaction, translate the status code and drive the
/// shared edge. Non-definitive codes (pending/unknown) change nothing;
/// the reconciliation sweep will settle them later.
async fn apply_gateway_callback(
    state: &AppState,
    params: &CallbackParams,
) -> Result<order::Model, ServiceError> {
    let (_, order) = state
        .services
        .payments
        .find_by_transaction_id(&params.txnid)
        .await?;

    let status = GatewayStatus::from_code(&params.status);
    let Some((order_target, payment_target)) = gateway_transition_for(status) else {
        info!(
            transaction_id = %params.txnid,
            order_id = %order.id,
            %status,
            "gateway callback without a definitive status, nothing to apply"
        );
        return Ok(order);
    };

    let outcome = state
        .services
        .transitions
        .apply(TransitionRequest {
            order_id: order.id,
            target: order_target,
            source: TransitionSource::Gateway,
            external_id: params.txnid.clone(),
            event_signature: status.to_string(),
            payment_update: Some(PaymentUpdate {
                status: payment_target,
                reference_number: params.refno.clone(),
            }),
            shipment_update: None,
        })
        .await?;

    match &outcome {
        TransitionOutcome::Applied { from, to } => {
            info!(
                transaction_id = %params.txnid,
                order_id = %order.id,
                %from,
                %to,
                "gateway callback applied"
            );
        }
        TransitionOutcome::NoOp { ref reason } => {
            warn!(
                transaction_id = %params.txnid,
                order_id = %order.id,
                %status,
                error = %reason.as_error(),
                "gateway callback rejected, acknowledged as a no-op"
            );
        }
        TransitionOutcome::PaymentApplied { .. } => {
            info!(
                transaction_id = %params.txnid,
                order_id = %order.id,
                %status,
                ?outcome,
                "gateway callback acknowledged without an order move"
            );
        }
    }
    Ok(order)
}
