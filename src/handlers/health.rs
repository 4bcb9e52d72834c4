use axum::{extract::State, http::StatusCode, response::Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::db;
use crate::errors::ServiceError;
use crate::{ApiResponse, AppState};

/// Overall health report. Always 200; the body says what hurts.
#[utoipa::path(
    get,
    path = "/health",
    summary = "Health report",
    responses((status = 200, description = "Component health", body = ApiResponse<Value>)),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let database = match db::check_connection(&state.db).await {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };
    let status = if database == "healthy" {
        "healthy"
    } else {
        "degraded"
    };
    Json(ApiResponse::success(json!({
        "status": status,
        "checks": { "database": database },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// Liveness: the process answers. No dependencies touched.
#[utoipa::path(
    get,
    path = "/health/live",
    summary = "Liveness probe",
    responses((status = 200, description = "Process is up")),
    tag = "health"
)]
pub async fn live() -> StatusCode {
    StatusCode::OK
}

/// Readiness: fail while the database is unreachable so the load
/// balancer routes around this instance.
#[utoipa::path(
    get,
    path = "/health/ready",
    summary = "Readiness probe",
    responses(
        (status = 200, description = "Ready for traffic", body = ApiResponse<Value>),
        (status = 503, description = "Database unreachable", body = crate::errors::ErrorResponse),
    ),
    tag = "health"
)]
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Value>>, ServiceError> {
    db::check_connection(&state.db)
        .await
        .map_err(|_| ServiceError::ServiceUnavailable("database unreachable".to_string()))?;
    Ok(Json(ApiResponse::success(json!({ "status": "ready" }))))
}
