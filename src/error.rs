//! # Error Handling
//!
//! Unified JSON error responses for the webhook API. Every error body carries
//! the human-readable message under `error`, a machine-readable `code`, and
//! the request's correlation id.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::admission::AdmissionError;
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip)]
    pub status: StatusCode,
    /// Human-readable error message
    #[serde(rename = "error")]
    pub message: Box<str>,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Suggested retry delay in seconds (sent as `Retry-After`)
    #[serde(skip)]
    pub retry_after: Option<u64>,
    /// Correlation id of the failed request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            message: message.into().into_boxed_str(),
            code: code.into().into_boxed_str(),
            retry_after: None,
            trace_id: telemetry::current_trace_id().map(String::into_boxed_str),
        }
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// 405 for any non-POST request to a webhook route
    pub fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            "Invalid method",
        )
    }

    /// 413 for bodies over the configured limit
    pub fn payload_too_large(limit_bytes: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE".to_string(),
            format!("Payload exceeds {} bytes", limit_bytes),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        // Add Retry-After header if present
        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert(header::RETRY_AFTER, header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

// Error mappers for common sources

impl From<AdmissionError> for ApiError {
    fn from(error: AdmissionError) -> Self {
        let status = error.status_code();
        let code = error.code();

        let message = match &error {
            AdmissionError::CounterStore(_) | AdmissionError::Store(_)
                if status == StatusCode::SERVICE_UNAVAILABLE =>
            {
                "Service temporarily unavailable".to_string()
            }
            AdmissionError::Store(_) => "An internal error occurred".to_string(),
            rejection => rejection.to_string(),
        };

        let api_error = Self::new(status, code.to_string(), message);
        match error {
            AdmissionError::RateLimited {
                retry_after_seconds,
            } => api_error.with_retry_after(retry_after_seconds),
            _ => api_error,
        }
    }
}
