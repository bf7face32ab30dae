//! # Webhook Handlers
//!
//! Public endpoints that receive webhook callbacks. The handlers only resolve
//! HTTP details (provider path, client identity, headers, raw body) and hand
//! the request to the admission pipeline.

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Path, State, rejection::BytesRejection},
    http::{HeaderMap, StatusCode, request::Parts},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::admission::InboundWebhook;
use crate::error::ApiError;
use crate::headers::RequestHeaders;
use crate::server::AppState;
use crate::telemetry;

/// Client identity used when neither the peer address nor a trusted forwarded header is known
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Path parameter for the provider id
#[derive(Debug, Deserialize, IntoParams)]
pub struct ProviderPath {
    /// Provider id (e.g., "github"); unknown ids use the default provider's rules
    #[param(min_length = 1, example = "github")]
    pub provider: String,
}

/// Acknowledgement for an admitted webhook
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookReceivedResponse {
    /// Always "received"
    #[schema(example = "received")]
    pub status: String,
    /// Id of the recorded event
    pub id: Uuid,
}

/// Identity the rate limiter counts requests against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl FromRequestParts<AppState> for ClientIdentity {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(Self(resolve_client_identity(
            &parts.headers,
            peer,
            state.config.trust_forwarded_for,
        )))
    }
}

/// The first `X-Forwarded-For` entry when trusted, else the peer IP, else `unknown`.
pub fn resolve_client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|client| !client.is_empty());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Receive a webhook for the default provider
#[utoipa::path(
    post,
    path = "/webhook/",
    request_body(content = String, description = "Raw webhook payload (JSON)", content_type = "application/json"),
    responses(
        (status = 200, description = "Webhook recorded", body = WebhookReceivedResponse),
        (status = 400, description = "Body is not valid JSON", body = ApiError),
        (status = 401, description = "Signature missing or invalid", body = ApiError),
        (status = 405, description = "Method other than POST", body = ApiError),
        (status = 413, description = "Body exceeds the configured limit", body = ApiError),
        (status = 422, description = "Required fields missing", body = ApiError),
        (status = 429, description = "Rate limit exceeded", body = ApiError),
        (status = 503, description = "A backing store is unavailable", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn receive_default_webhook(
    State(state): State<AppState>,
    client: ClientIdentity,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookReceivedResponse>, ApiError> {
    receive(state, None, client, headers, body).await
}

/// Receive a webhook for a named provider
#[utoipa::path(
    post,
    path = "/webhook/{provider}/",
    params(ProviderPath),
    request_body(content = String, description = "Raw webhook payload (JSON)", content_type = "application/json"),
    responses(
        (status = 200, description = "Webhook recorded", body = WebhookReceivedResponse),
        (status = 400, description = "Body is not valid JSON", body = ApiError),
        (status = 401, description = "Signature missing or invalid", body = ApiError),
        (status = 405, description = "Method other than POST", body = ApiError),
        (status = 413, description = "Body exceeds the configured limit", body = ApiError),
        (status = 422, description = "Required fields missing", body = ApiError),
        (status = 429, description = "Rate limit exceeded", body = ApiError),
        (status = 503, description = "A backing store is unavailable", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn receive_provider_webhook(
    State(state): State<AppState>,
    Path(path): Path<ProviderPath>,
    client: ClientIdentity,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookReceivedResponse>, ApiError> {
    receive(state, Some(path.provider), client, headers, body).await
}

/// Any method other than POST on a webhook route
pub async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}

async fn receive(
    state: AppState,
    provider: Option<String>,
    ClientIdentity(client_identity): ClientIdentity,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookReceivedResponse>, ApiError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::payload_too_large(state.config.max_body_bytes())
        } else {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_BODY".to_string(),
                rejection.body_text(),
            )
        }
    })?;

    let admission = state
        .pipeline
        .admit(InboundWebhook {
            provider,
            client_identity,
            headers: RequestHeaders::from_header_map(&headers),
            body,
            correlation_id: telemetry::current_trace_id(),
        })
        .await?;

    Ok(Json(WebhookReceivedResponse {
        status: "received".to_string(),
        id: admission.event_id,
    }))
}
