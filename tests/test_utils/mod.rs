//! Test utilities for the webhook ingestion integration tests.
//!
//! Sets up in-memory SQLite event stores with migrations applied and builds
//! routers over them.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection, EntityTrait, QueryOrder};
use webhook_ingest::{
    config::{AppConfig, DispatchConfig, DispatchMode, ProviderSettings},
    dispatcher::{AcknowledgeProcessor, EventProcessor},
    models::{WebhookEvent, webhook_event},
    server::{AppState, create_app},
    webhook_verification::compute_signature,
};

pub const TEST_SECRET: &str = "test-secret";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Configuration with inline dispatch and a signed `default` provider.
pub fn inline_config() -> AppConfig {
    let mut config = AppConfig {
        dispatch: DispatchConfig {
            mode: DispatchMode::Inline,
            ..DispatchConfig::default()
        },
        ..AppConfig::default()
    };
    config.providers.insert(
        "default".to_string(),
        ProviderSettings {
            secret: Some(TEST_SECRET.to_string()),
            ..ProviderSettings::default()
        },
    );
    config
}

/// Builds the full router over `db` with the acknowledging processor.
pub fn build_app(config: AppConfig, db: DatabaseConnection) -> Router {
    build_app_with_processor(config, db, Arc::new(AcknowledgeProcessor))
}

pub fn build_app_with_processor(
    config: AppConfig,
    db: DatabaseConnection,
    processor: Arc<dyn EventProcessor>,
) -> Router {
    create_app(AppState::build(config, db, processor))
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    format!(
        "sha256={}",
        compute_signature(secret.as_bytes(), body).expect("hmac accepts any key length")
    )
}

/// All recorded events, oldest first.
pub async fn all_events(db: &DatabaseConnection) -> Result<Vec<webhook_event::Model>> {
    Ok(WebhookEvent::find()
        .order_by_asc(webhook_event::Column::ReceivedAt)
        .all(db)
        .await?)
}
