//! # WebhookEvent Repository
//!
//! Event store used by the admission pipeline and the processing dispatcher.
//! Events are inserted as pending and finalized exactly once.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::webhook_event::{ActiveModel, Column, Entity, EventStatus, Model};

/// Errors raised by an [`EventStore`]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("webhook event {id} not found")]
    NotFound { id: Uuid },

    #[error("webhook event {id} already finalized as {status}")]
    AlreadyFinalized { id: Uuid, status: EventStatus },
}

impl StoreError {
    /// Whether the backing store could not be reached at all
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Database(DbErr::Conn(_)))
    }
}

/// Fields captured for a newly admitted event
#[derive(Debug, Clone, PartialEq)]
pub struct NewWebhookEvent {
    pub provider: String,
    pub event_type: String,
    pub correlation_id: String,
    pub signature_valid: bool,
    pub headers: JsonValue,
    pub payload: JsonValue,
}

/// Terminal result of processing an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Processed,
    Failed { message: String },
}

impl ProcessingOutcome {
    pub fn status(&self) -> EventStatus {
        match self {
            ProcessingOutcome::Processed => EventStatus::Processed,
            ProcessingOutcome::Failed { .. } => EventStatus::Failed,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ProcessingOutcome::Processed => None,
            ProcessingOutcome::Failed { message } => Some(message),
        }
    }
}

/// Persistent store of webhook events
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event with status pending
    async fn create(&self, event: NewWebhookEvent) -> Result<Model, StoreError>;

    /// Load an event by id
    async fn get(&self, id: Uuid) -> Result<Option<Model>, StoreError>;

    /// Move a pending event to its terminal status and stamp `processed_at`.
    ///
    /// Fails with [`StoreError::AlreadyFinalized`] when the event has already
    /// left pending, so the transition happens at most once.
    async fn finalize(&self, id: Uuid, outcome: ProcessingOutcome) -> Result<Model, StoreError>;
}

/// SeaORM-backed [`EventStore`]
#[derive(Debug, Clone)]
pub struct WebhookEventRepository {
    db: DatabaseConnection,
}

impl WebhookEventRepository {
    /// Create a new WebhookEventRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventStore for WebhookEventRepository {
    async fn create(&self, event: NewWebhookEvent) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();

        let record = ActiveModel {
            id: Set(Uuid::new_v4()),
            provider: Set(event.provider),
            event_type: Set(event.event_type),
            correlation_id: Set(event.correlation_id),
            signature_valid: Set(event.signature_valid),
            headers: Set(event.headers),
            payload: Set(event.payload),
            status: Set(EventStatus::Pending),
            error_message: Set(None),
            received_at: Set(now),
            processed_at: Set(None),
        };

        let created = record.insert(&self.db).await.map_err(|e| {
            tracing::error!("Failed to create webhook event: {}", e);
            StoreError::from(e)
        })?;

        tracing::debug!(
            event_id = %created.id,
            provider = %created.provider,
            event_type = %created.event_type,
            "Webhook event recorded"
        );

        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Model>, StoreError> {
        Ok(Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn finalize(&self, id: Uuid, outcome: ProcessingOutcome) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();

        // Conditional on pending so a concurrent finalize cannot overwrite the outcome
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(outcome.status().as_str()))
            .col_expr(
                Column::ErrorMessage,
                Expr::value(outcome.error_message().map(str::to_string)),
            )
            .col_expr(Column::ProcessedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(EventStatus::Pending.as_str()))
            .exec(&self.db)
            .await?;

        let current = Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound { id })?;

        if result.rows_affected == 0 {
            return Err(StoreError::AlreadyFinalized {
                id,
                status: current.status,
            });
        }

        Ok(current)
    }
}
