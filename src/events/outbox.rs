use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::entities::outbox_event::{self, Entity as OutboxEvent};
use crate::errors::ServiceError;

/// Durable side effects enqueued inside the transition transaction and
/// executed by the background worker. Delivery is at-least-once; every
/// handler target must therefore be idempotent.
pub const EVENT_CREATE_SHIPMENT: &str = "create_shipment";
pub const EVENT_SEND_NOTIFICATION: &str = "send_notification";

const MAX_ATTEMPTS: i32 = 8;
const BASE_BACKOFF_SECS: u64 = 2;
const STALE_PROCESSING_SECS: i64 = 300;

#[derive(Debug, Clone, Copy)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// Executes one claimed outbox row. Implemented over the shipment and
/// notification services; kept as a trait so tests can substitute a
/// recording handler.
#[async_trait::async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn handle(
        &self,
        event_type: &str,
        aggregate_id: &str,
        payload: &Value,
    ) -> Result<(), ServiceError>;
}

/// Enqueue a side effect. Pass the open transaction so the row commits
/// or rolls back together with the state change that caused it.
pub async fn enqueue(
    db: &impl ConnectionTrait,
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: &str,
    payload: &Value,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let row = outbox_event::ActiveModel {
        aggregate_type: Set(aggregate_type.to_owned()),
        aggregate_id: Set(aggregate_id.to_owned()),
        event_type: Set(event_type.to_owned()),
        payload: Set(payload.to_string()),
        status: Set(OutboxStatus::Pending.as_str().to_owned()),
        attempts: Set(0),
        next_attempt_at: Set(now),
        last_error: Set(None),
        created_at: Set(now),
        processed_at: Set(None),
        ..Default::default()
    };
    OutboxEvent::insert(row)
        .exec(db)
        .await
        .map_err(ServiceError::db_error)?;
    info!(event_type, aggregate_id, "enqueued outbox event");
    Ok(())
}

/// Background worker: requeues rows stranded mid-flight by a previous
/// crash, then drains pending rows forever.
pub fn start_worker(
    db: Arc<DatabaseConnection>,
    handler: Arc<dyn OutboxHandler>,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = requeue_stale(&db).await {
            error!("outbox stale requeue failed: {}", e);
        }
        loop {
            match drain_once(&db, handler.as_ref(), 50).await {
                Ok(0) => {}
                Ok(n) => info!(processed = n, "outbox batch drained"),
                Err(e) => error!("outbox worker error: {}", e),
            }
            sleep(poll_interval).await;
        }
    })
}

/// Claim-and-dispatch one batch. Public so tests can drive the outbox
/// deterministically instead of racing the worker loop.
pub async fn drain_once(
    db: &DatabaseConnection,
    handler: &dyn OutboxHandler,
    batch_size: u64,
) -> Result<usize, ServiceError> {
    let now = Utc::now();
    let candidates = OutboxEvent::find()
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending.as_str()))
        .filter(outbox_event::Column::NextAttemptAt.lte(now))
        .order_by_asc(outbox_event::Column::Id)
        .limit(batch_size)
        .all(db)
        .await
        .map_err(ServiceError::db_error)?;

    let mut delivered = 0;
    for row in candidates {
        if !claim(db, row.id).await? {
            continue;
        }
        let attempts = row.attempts + 1;
        let payload: Value = serde_json::from_str(&row.payload).unwrap_or(Value::Null);

        match handler.handle(&row.event_type, &row.aggregate_id, &payload).await {
            Ok(()) => {
                mark_delivered(db, row.id).await?;
                counter!("orderflow.outbox.delivered", 1);
                delivered += 1;
            }
            Err(e) if attempts < MAX_ATTEMPTS => {
                warn!(
                    id = row.id,
                    event_type = %row.event_type,
                    attempts,
                    error = %e,
                    "outbox dispatch failed, scheduling retry"
                );
                schedule_retry(db, row.id, attempts, &e.to_string()).await?;
                counter!("orderflow.outbox.retried", 1);
            }
            Err(e) => {
                error!(
                    id = row.id,
                    event_type = %row.event_type,
                    attempts,
                    error = %e,
                    "outbox dispatch exhausted its attempts"
                );
                mark_failed(db, row.id, &e.to_string()).await?;
                counter!("orderflow.outbox.failed", 1);
            }
        }
    }
    Ok(delivered)
}

// Optimistic claim: only one worker wins the pending -> processing flip.
async fn claim(db: &DatabaseConnection, id: i64) -> Result<bool, ServiceError> {
    let result = OutboxEvent::update_many()
        .col_expr(
            outbox_event::Column::Status,
            Expr::value(OutboxStatus::Processing.as_str()),
        )
        .col_expr(
            outbox_event::Column::Attempts,
            Expr::col(outbox_event::Column::Attempts).add(1),
        )
        .filter(outbox_event::Column::Id.eq(id))
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending.as_str()))
        .exec(db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(result.rows_affected == 1)
}

async fn mark_delivered(db: &DatabaseConnection, id: i64) -> Result<(), ServiceError> {
    OutboxEvent::update_many()
        .col_expr(
            outbox_event::Column::Status,
            Expr::value(OutboxStatus::Delivered.as_str()),
        )
        .col_expr(outbox_event::Column::ProcessedAt, Expr::value(Utc::now()))
        .col_expr(outbox_event::Column::LastError, Expr::value(Option::<String>::None))
        .filter(outbox_event::Column::Id.eq(id))
        .exec(db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(())
}

async fn schedule_retry(
    db: &DatabaseConnection,
    id: i64,
    attempts: i32,
    last_error: &str,
) -> Result<(), ServiceError> {
    let backoff = backoff_secs(attempts);
    // Jitter keeps a batch of failures from retrying in lockstep.
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    let next = Utc::now()
        + chrono::Duration::seconds(backoff as i64)
        + chrono::Duration::milliseconds(jitter_ms);
    OutboxEvent::update_many()
        .col_expr(
            outbox_event::Column::Status,
            Expr::value(OutboxStatus::Pending.as_str()),
        )
        .col_expr(outbox_event::Column::NextAttemptAt, Expr::value(next))
        .col_expr(
            outbox_event::Column::LastError,
            Expr::value(Some(truncate(last_error, 500))),
        )
        .filter(outbox_event::Column::Id.eq(id))
        .exec(db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(())
}

async fn mark_failed(db: &DatabaseConnection, id: i64, last_error: &str) -> Result<(), ServiceError> {
    OutboxEvent::update_many()
        .col_expr(
            outbox_event::Column::Status,
            Expr::value(OutboxStatus::Failed.as_str()),
        )
        .col_expr(
            outbox_event::Column::LastError,
            Expr::value(Some(truncate(last_error, 500))),
        )
        .filter(outbox_event::Column::Id.eq(id))
        .exec(db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(())
}

// Rows stuck in processing belong to a worker that died mid-dispatch.
async fn requeue_stale(db: &DatabaseConnection) -> Result<(), ServiceError> {
    let cutoff = Utc::now() - chrono::Duration::seconds(STALE_PROCESSING_SECS);
    let result = OutboxEvent::update_many()
        .col_expr(
            outbox_event::Column::Status,
            Expr::value(OutboxStatus::Pending.as_str()),
        )
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Processing.as_str()))
        .filter(outbox_event::Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await
        .map_err(ServiceError::db_error)?;
    if result.rows_affected > 0 {
        warn!(
            requeued = result.rows_affected,
            "requeued outbox rows stranded in processing"
        );
    }
    Ok(())
}

/// Admin recovery path: put exhausted rows back in the queue with a
/// fresh attempt budget.
pub async fn retry_failed(db: &DatabaseConnection) -> Result<u64, ServiceError> {
    let result = OutboxEvent::update_many()
        .col_expr(
            outbox_event::Column::Status,
            Expr::value(OutboxStatus::Pending.as_str()),
        )
        .col_expr(outbox_event::Column::Attempts, Expr::value(0))
        .col_expr(outbox_event::Column::NextAttemptAt, Expr::value(Utc::now()))
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Failed.as_str()))
        .exec(db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(result.rows_affected)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub delivered: u64,
    pub failed: u64,
}

pub async fn stats(db: &DatabaseConnection) -> Result<OutboxStats, ServiceError> {
    async fn count_status(db: &DatabaseConnection, status: OutboxStatus) -> Result<u64, ServiceError> {
        OutboxEvent::find()
            .filter(outbox_event::Column::Status.eq(status.as_str()))
            .count(db)
            .await
            .map_err(ServiceError::db_error)
    }

    Ok(OutboxStats {
        pending: count_status(db, OutboxStatus::Pending).await?,
        processing: count_status(db, OutboxStatus::Processing).await?,
        delivered: count_status(db, OutboxStatus::Delivered).await?,
        failed: count_status(db, OutboxStatus::Failed).await?,
    })
}

fn backoff_secs(attempts: i32) -> u64 {
    BASE_BACKOFF_SECS.saturating_pow(attempts.max(1) as u32)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_owned()
    }
}
