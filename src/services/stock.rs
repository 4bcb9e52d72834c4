use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::entities::stock_item::{self, Entity as StockItemEntity};
use crate::entities::stock_movement::{self, Entity as StockMovementEntity};
use crate::errors::ServiceError;

pub const REASON_RESERVATION: &str = "order reservation";

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StockItemResponse {
    pub sku: String,
    pub name: String,
    pub available: i32,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<stock_item::Model> for StockItemResponse {
    fn from(model: stock_item::Model) -> Self {
        Self {
            sku: model.sku,
            name: model.name,
            available: model.available,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AdjustStockRequest {
    #[validate(length(min = 1, message = "SKU is required"))]
    pub sku: String,
    /// Signed unit delta. Positive restocks, negative writes off.
    pub delta: i32,
    #[validate(length(min = 1, message = "Reason is required"))]
    pub reason: String,
    /// Display name used only when the adjustment creates the item.
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedLine {
    pub sku: String,
    pub quantity: i32,
}

/// Reserve stock for every line of an order, all-or-nothing. Runs on
/// the caller's transaction so a later failure in the same checkout
/// rolls the decrements back too. Returns the stock rows in line order.
pub async fn reserve_for_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    lines: &[(String, i32)],
) -> Result<Vec<stock_item::Model>, ServiceError> {
    let now = Utc::now();
    let mut reserved = Vec::with_capacity(lines.len());

    for (sku, quantity) in lines {
        if *quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Quantity for {} must be positive",
                sku
            )));
        }
        let item = StockItemEntity::find()
            .filter(stock_item::Column::Sku.eq(sku.clone()))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::ValidationError(format!("Unknown SKU {}", sku)))?;

        // Guarded decrement: the filter re-checks availability so two
        // concurrent checkouts cannot both take the last unit.
        let updated = StockItemEntity::update_many()
            .col_expr(
                stock_item::Column::Available,
                Expr::col(stock_item::Column::Available).sub(*quantity),
            )
            .col_expr(
                stock_item::Column::Version,
                Expr::col(stock_item::Column::Version).add(1),
            )
            .col_expr(stock_item::Column::UpdatedAt, Expr::value(now))
            .filter(stock_item::Column::Id.eq(item.id))
            .filter(stock_item::Column::Available.gte(*quantity))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if updated.rows_affected == 0 {
            return Err(ServiceError::InsufficientStock(format!(
                "{}: requested {}, available {}",
                sku, quantity, item.available
            )));
        }

        let movement = stock_movement::ActiveModel {
            id: Set(Uuid::new_v4()),
            stock_item_id: Set(item.id),
            order_id: Set(Some(order_id)),
            quantity: Set(-quantity),
            reason: Set(REASON_RESERVATION.to_owned()),
            created_at: Set(now),
        };
        movement.insert(conn).await.map_err(ServiceError::db_error)?;

        counter!("orderflow.stock.reserved_units", *quantity as u64);
        reserved.push(item);
    }

    Ok(reserved)
}

/// Restore whatever this order still holds, derived from the movement
/// ledger. Net-zero orders release nothing, which makes the call safe
/// under replay: the second invocation sees no outstanding quantity.
pub async fn release_for_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    reason: &str,
) -> Result<Vec<ReleasedLine>, ServiceError> {
    let movements = StockMovementEntity::find()
        .filter(stock_movement::Column::OrderId.eq(order_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut outstanding: HashMap<Uuid, i64> = HashMap::new();
    for movement in &movements {
        *outstanding.entry(movement.stock_item_id).or_insert(0) += i64::from(movement.quantity);
    }

    let now = Utc::now();
    let mut released = Vec::new();
    for (stock_item_id, net) in outstanding {
        if net >= 0 {
            continue;
        }
        let quantity = (-net) as i32;

        let item = StockItemEntity::find_by_id(stock_item_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::EventError(format!(
                    "stock item {} referenced by ledger is missing",
                    stock_item_id
                ))
            })?;

        StockItemEntity::update_many()
            .col_expr(
                stock_item::Column::Available,
                Expr::col(stock_item::Column::Available).add(quantity),
            )
            .col_expr(
                stock_item::Column::Version,
                Expr::col(stock_item::Column::Version).add(1),
            )
            .col_expr(stock_item::Column::UpdatedAt, Expr::value(now))
            .filter(stock_item::Column::Id.eq(stock_item_id))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let movement = stock_movement::ActiveModel {
            id: Set(Uuid::new_v4()),
            stock_item_id: Set(stock_item_id),
            order_id: Set(Some(order_id)),
            quantity: Set(quantity),
            reason: Set(reason.to_owned()),
            created_at: Set(now),
        };
        movement.insert(conn).await.map_err(ServiceError::db_error)?;

        counter!("orderflow.stock.released_units", quantity as u64);
        info!(%order_id, sku = %item.sku, quantity, reason, "stock released");
        released.push(ReleasedLine {
            sku: item.sku,
            quantity,
        });
    }

    Ok(released)
}

/// Read and admin surface over the stock ledger.
#[derive(Clone)]
pub struct StockService {
    db: Arc<DatabaseConnection>,
}

impl StockService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn get_by_sku(&self, sku: &str) -> Result<StockItemResponse, ServiceError> {
        let item = StockItemEntity::find()
            .filter(stock_item::Column::Sku.eq(sku))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("No stock item with SKU {}", sku)))?;
        Ok(item.into())
    }

    /// Manual correction with a ledger trail. Creates the item when a
    /// restock references a SKU we have never seen.
    #[instrument(skip(self, request), fields(sku = %request.sku, delta = request.delta))]
    pub async fn adjust(&self, request: AdjustStockRequest) -> Result<StockItemResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        if request.delta == 0 {
            return Err(ServiceError::ValidationError(
                "Adjustment delta must be non-zero".into(),
            ));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let now = Utc::now();

        let existing = StockItemEntity::find()
            .filter(stock_item::Column::Sku.eq(request.sku.clone()))
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let item = match existing {
            Some(item) => {
                if item.available + request.delta < 0 {
                    return Err(ServiceError::ValidationError(format!(
                        "{}: cannot adjust below zero (available {}, delta {})",
                        request.sku, item.available, request.delta
                    )));
                }
                StockItemEntity::update_many()
                    .col_expr(
                        stock_item::Column::Available,
                        Expr::col(stock_item::Column::Available).add(request.delta),
                    )
                    .col_expr(
                        stock_item::Column::Version,
                        Expr::col(stock_item::Column::Version).add(1),
                    )
                    .col_expr(stock_item::Column::UpdatedAt, Expr::value(now))
                    .filter(stock_item::Column::Id.eq(item.id))
                    .exec(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                item
            }
            None if request.delta > 0 => {
                let item = stock_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    sku: Set(request.sku.clone()),
                    name: Set(request.name.clone().unwrap_or_else(|| request.sku.clone())),
                    available: Set(0),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                    version: Set(1),
                };
                let item = item.insert(&txn).await.map_err(ServiceError::db_error)?;
                StockItemEntity::update_many()
                    .col_expr(
                        stock_item::Column::Available,
                        Expr::col(stock_item::Column::Available).add(request.delta),
                    )
                    .filter(stock_item::Column::Id.eq(item.id))
                    .exec(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                item
            }
            None => {
                warn!(sku = %request.sku, "write-off for unknown SKU rejected");
                return Err(ServiceError::NotFound(format!(
                    "No stock item with SKU {}",
                    request.sku
                )));
            }
        };

        let movement = stock_movement::ActiveModel {
            id: Set(Uuid::new_v4()),
            stock_item_id: Set(item.id),
            order_id: Set(None),
            quantity: Set(request.delta),
            reason: Set(request.reason.clone()),
            created_at: Set(now),
        };
        movement.insert(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        self.get_by_sku(&request.sku).await
    }
}
