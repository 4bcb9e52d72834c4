use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::events::outbox::{self, OutboxStats};
use crate::handlers::Identity;
use crate::{ApiResponse, ApiResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(outbox_stats))
        .route("/retry", post(retry_failed))
}

#[utoipa::path(
    get,
    path = "/api/v1/outbox/stats",
    summary = "Outbox counters",
    description = "Row counts per outbox status. A growing failed count means side effects are parked and waiting for a retry",
    responses(
        (status = 200, description = "Outbox counters", body = ApiResponse<OutboxStats>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "outbox"
)]
pub async fn outbox_stats(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<OutboxStats> {
    identity.require_admin()?;
    let stats = outbox::stats(&state.db).await?;
    Ok(Json(ApiResponse::success(stats)))
}

#[utoipa::path(
    post,
    path = "/api/v1/outbox/retry",
    summary = "Re-queue failed outbox rows",
    description = "Move every failed row back to pending so the worker picks it up again. The response carries how many rows were re-queued",
    responses(
        (status = 200, description = "Rows re-queued", body = ApiResponse<Value>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "outbox"
)]
pub async fn retry_failed(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Value> {
    identity.require_admin()?;
    let requeued = outbox::retry_failed(&state.db).await?;
    Ok(Json(ApiResponse::success(json!({ "requeued": requeued }))))
}
