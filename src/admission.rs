//! # Admission Pipeline
//!
//! Runs every inbound webhook through a fixed sequence of checks: rate limit,
//! payload parse and required fields, then signature. A request that passes is
//! recorded as a pending event and handed to the processing dispatcher. Each
//! failure is a classified [`AdmissionError`] the HTTP boundary maps to a
//! status code.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::StatusCode;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::counter_store::CounterStoreError;
use crate::dispatcher::{DispatchOutcome, ProcessingDispatcher};
use crate::headers::RequestHeaders;
use crate::payload::{self, PayloadError};
use crate::providers::{DEFAULT_PROVIDER, ProviderConfig, ProviderRegistry, normalize_provider_id};
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::repositories::{EventStore, NewWebhookEvent, StoreError};
use crate::telemetry;
use crate::webhook_verification::verify_signature;

/// Why a webhook was not admitted
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Invalid JSON payload")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("Missing required fields: {}", .fields.join(", "))]
    MissingFields { fields: Vec<String> },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Rate limit store unavailable")]
    CounterStore(#[source] CounterStoreError),

    #[error("Event store error")]
    Store(#[source] StoreError),
}

impl AdmissionError {
    /// HTTP status for this rejection
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            AdmissionError::MissingFields { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AdmissionError::InvalidSignature => StatusCode::UNAUTHORIZED,
            AdmissionError::CounterStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::Store(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::RateLimited { .. } => "RATE_LIMITED",
            AdmissionError::MalformedPayload(_) => "INVALID_JSON",
            AdmissionError::MissingFields { .. } => "MISSING_FIELDS",
            AdmissionError::InvalidSignature => "INVALID_SIGNATURE",
            AdmissionError::CounterStore(_) => "SERVICE_UNAVAILABLE",
            AdmissionError::Store(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Whether the webhook itself was at fault, as opposed to the service
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            AdmissionError::CounterStore(_) | AdmissionError::Store(_)
        )
    }
}

impl From<RateLimitError> for AdmissionError {
    fn from(error: RateLimitError) -> Self {
        match error {
            RateLimitError::Exceeded { window_seconds, .. } => AdmissionError::RateLimited {
                retry_after_seconds: window_seconds,
            },
            RateLimitError::Store(e) => AdmissionError::CounterStore(e),
        }
    }
}

impl From<PayloadError> for AdmissionError {
    fn from(error: PayloadError) -> Self {
        match error {
            PayloadError::Malformed(e) => AdmissionError::MalformedPayload(e),
            PayloadError::MissingFields { fields } => AdmissionError::MissingFields { fields },
        }
    }
}

/// One inbound webhook, resolved at the HTTP boundary
#[derive(Debug, Clone)]
pub struct InboundWebhook {
    /// Provider named in the request path, if any
    pub provider: Option<String>,
    /// Identity the rate limiter counts against (usually the peer address)
    pub client_identity: String,
    pub headers: RequestHeaders,
    /// Raw body exactly as received
    pub body: Bytes,
    pub correlation_id: Option<String>,
}

/// Acknowledgement for an admitted webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub event_id: Uuid,
    pub event_type: String,
    /// `None` when the dispatcher could not take the event
    pub dispatch: Option<DispatchOutcome>,
}

/// Orchestrates admission; all collaborators are injected at construction
#[derive(Clone)]
pub struct AdmissionPipeline {
    registry: Arc<ProviderRegistry>,
    rate_limiter: RateLimiter,
    store: Arc<dyn EventStore>,
    dispatcher: ProcessingDispatcher,
}

impl AdmissionPipeline {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        rate_limiter: RateLimiter,
        store: Arc<dyn EventStore>,
        dispatcher: ProcessingDispatcher,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            store,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &ProcessingDispatcher {
        &self.dispatcher
    }

    /// Admit a webhook or return the first check it failed
    #[instrument(skip_all, fields(client = %inbound.client_identity))]
    pub async fn admit(&self, inbound: InboundWebhook) -> Result<Admission, AdmissionError> {
        let requested = inbound
            .provider
            .as_deref()
            .map(normalize_provider_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
        let provider = self.registry.resolve(&requested);

        telemetry::record_request(&provider.id);
        let result = self.run(requested, &provider, inbound).await;
        if let Err(e) = &result {
            telemetry::record_rejection(&provider.id, e.code());
            if e.is_rejection() {
                info!(provider = %provider.id, code = e.code(), "Webhook rejected: {}", e);
            } else {
                error!(provider = %provider.id, "Webhook admission failed: {:?}", e);
            }
        }
        result
    }

    async fn run(
        &self,
        requested: String,
        provider: &ProviderConfig,
        inbound: InboundWebhook,
    ) -> Result<Admission, AdmissionError> {
        self.rate_limiter
            .check(provider, &inbound.client_identity)
            .await?;

        let payload = payload::parse_body(&inbound.body)?;
        payload::validate_required_fields(provider, &payload)?;

        // Digest over the raw bytes, never the re-serialized payload
        let signature_valid = verify_signature(&inbound.body, provider, &inbound.headers);
        if !signature_valid {
            return Err(AdmissionError::InvalidSignature);
        }

        let event_type = payload::classify_event_type(provider, &inbound.headers, &payload);
        let correlation_id = inbound
            .correlation_id
            .filter(|id| !id.trim().is_empty())
            .or_else(telemetry::current_trace_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let event = self
            .store
            .create(NewWebhookEvent {
                provider: requested,
                event_type,
                correlation_id,
                signature_valid,
                headers: inbound.headers.snapshot(),
                payload,
            })
            .await
            .map_err(AdmissionError::Store)?;

        info!(
            event_id = %event.id,
            provider = %event.provider,
            event_type = %event.event_type,
            "Webhook admitted"
        );

        let dispatch = match self.dispatcher.dispatch(event.id).await {
            Ok(DispatchOutcome::Rejected) => {
                telemetry::record_dispatch_dropped(&provider.id);
                Some(DispatchOutcome::Rejected)
            }
            Ok(outcome) => {
                debug!(event_id = %event.id, ?outcome, "Webhook event dispatched");
                Some(outcome)
            }
            Err(e) => {
                error!(event_id = %event.id, "Failed to dispatch webhook event: {}", e);
                None
            }
        };

        Ok(Admission {
            event_id: event.id,
            event_type: event.event_type,
            dispatch,
        })
    }
}
