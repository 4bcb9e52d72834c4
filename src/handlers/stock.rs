use axum::{
    extract::{Path, State},
    response::Json,
};

use crate::handlers::Identity;
use crate::services::stock::{AdjustStockRequest, StockItemResponse};
use crate::{ApiResponse, ApiResult, AppState};

#[utoipa::path(
    get,
    path = "/api/v1/stock/{sku}",
    summary = "Get stock level",
    description = "Current available units for one SKU",
    params(("sku" = String, Path, description = "Stock keeping unit")),
    responses(
        (status = 200, description = "Stock level retrieved", body = ApiResponse<StockItemResponse>),
        (status = 404, description = "Unknown SKU", body = crate::errors::ErrorResponse),
    ),
    tag = "stock"
)]
pub async fn get_stock(
    State(state): State<AppState>,
    Path(sku): Path<String>,
) -> ApiResult<StockItemResponse> {
    let item = state.services.stock.get_by_sku(&sku).await?;
    Ok(Json(ApiResponse::success(item)))
}

#[utoipa::path(
    post,
    path = "/api/v1/stock/adjust",
    summary = "Adjust stock",
    description = "Apply a signed delta to a SKU's available count and record the movement. Creates the item when the SKU is new and the delta positive",
    request_body = AdjustStockRequest,
    responses(
        (status = 200, description = "Stock adjusted", body = ApiResponse<StockItemResponse>),
        (status = 400, description = "Invalid adjustment, including one that would drive stock negative", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown SKU for a negative delta", body = crate::errors::ErrorResponse),
    ),
    security(("ApiKey" = [])),
    tag = "stock"
)]
pub async fn adjust_stock(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<AdjustStockRequest>,
) -> ApiResult<StockItemResponse> {
    identity.require_admin()?;
    let item = state.services.stock.adjust(request).await?;
    Ok(Json(ApiResponse::success(item)))
}
