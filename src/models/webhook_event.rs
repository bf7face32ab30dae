//! WebhookEvent entity model
//!
//! SeaORM entity for the webhook_events table. One row per admitted webhook
//! request; only the processing outcome columns ever change after insert.

use std::fmt::{self, Display};

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Processing status of a webhook event.
/// NOTE: Use db_type = "Text" for SQLite compatibility.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DeriveActiveEnum, EnumIter, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processed")]
    Processed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }

    /// Whether processing has finished for this event
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Pending)
    }
}

impl Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Webhook event recorded by the admission pipeline
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    /// Unique identifier generated on admission (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Provider named by the request path (`default` when absent)
    pub provider: String,

    /// Event classification from header or payload, possibly empty
    pub event_type: String,

    /// Correlation identifier of the request that delivered the event
    pub correlation_id: String,

    /// Result of signature verification at admission time
    pub signature_valid: bool,

    /// Request headers at receipt time, credential headers removed
    #[sea_orm(column_type = "JsonBinary")]
    pub headers: JsonValue,

    /// Parsed request body
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    pub status: EventStatus,

    /// Failure message, set only when status is failed
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub received_at: DateTimeWithTimeZone,

    /// Set exactly once, when status leaves pending
    pub processed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
