//! # Server Configuration
//!
//! Router assembly, explicit construction of the admission pipeline, and the
//! serve loop with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::admission::AdmissionPipeline;
use crate::config::AppConfig;
use crate::counter_store::InMemoryExpiringStore;
use crate::dispatcher::{AcknowledgeProcessor, EventProcessor, ProcessingDispatcher};
use crate::handlers::{self, webhooks};
use crate::middleware::correlation_middleware;
use crate::providers::ProviderRegistry;
use crate::rate_limit::RateLimiter;
use crate::repositories::{EventStore, WebhookEventRepository};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub pipeline: AdmissionPipeline,
}

impl AppState {
    /// Wire the registry, counter store, event store and dispatcher for `config`.
    ///
    /// Must be called within a tokio runtime (the dispatcher may spawn workers).
    pub fn build(
        config: AppConfig,
        db: DatabaseConnection,
        processor: Arc<dyn EventProcessor>,
    ) -> Self {
        let registry = Arc::new(ProviderRegistry::from_config(&config));
        info!(providers = ?registry.ids(), "Loaded webhook providers");

        let counters = Arc::new(InMemoryExpiringStore::new(config.rate_limit_store_capacity));
        let store: Arc<dyn EventStore> = Arc::new(WebhookEventRepository::new(db.clone()));
        let dispatcher = ProcessingDispatcher::start(&config.dispatch, Arc::clone(&store), processor);

        let pipeline = AdmissionPipeline::new(registry, RateLimiter::new(counters), store, dispatcher);

        Self {
            config: Arc::new(config),
            db,
            pipeline,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes();

    let webhook_routes = Router::new()
        .route(
            "/webhook",
            post(webhooks::receive_default_webhook).fallback(webhooks::method_not_allowed),
        )
        .route(
            "/webhook/",
            post(webhooks::receive_default_webhook).fallback(webhooks::method_not_allowed),
        )
        .route(
            "/webhook/{provider}",
            post(webhooks::receive_provider_webhook).fallback(webhooks::method_not_allowed),
        )
        .route(
            "/webhook/{provider}/",
            post(webhooks::receive_provider_webhook).fallback(webhooks::method_not_allowed),
        )
        .layer(DefaultBodyLimit::max(body_limit));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .merge(webhook_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(correlation_middleware))
}

/// Starts the server with the given configuration and serves until shutdown
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let addr = config
        .bind_addr()
        .with_context(|| format!("Invalid server address: {}", config.api_bind_addr))?;
    let profile = config.profile.clone();

    let state = AppState::build(config, db, Arc::new(AcknowledgeProcessor));
    let dispatcher = state.pipeline.dispatcher().clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, %profile, mode = %dispatcher.mode(), "Webhook ingestion listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped; draining webhook processing");
    dispatcher.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::webhooks::receive_default_webhook,
        crate::handlers::webhooks::receive_provider_webhook,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::webhooks::WebhookReceivedResponse,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "webhooks", description = "Inbound webhook ingestion")
    ),
    info(
        title = "Webhook Ingestion API",
        description = "Signed webhook intake with rate limiting, validation and asynchronous processing",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
