use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Audit row for every inbound carrier v2 webhook, written before any
/// transition is attempted so rejected and no-op events stay visible.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub tracking_id: String,
    pub event_name: String,
    pub status: String,
    pub event_at: DateTime<Utc>,
    pub raw_payload: String,
    pub failure_reason: Option<String>,
    pub is_terminal: bool,
    pub on_return_leg: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
