//! Request middleware: correlation id propagation.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use crate::telemetry::{CORRELATION_ID_HEADER, TraceContext, with_trace_context};

/// Header asking tunnelling proxies to skip their browser interstitial
pub const SKIP_BROWSER_WARNING_HEADER: &str = "ngrok-skip-browser-warning";

/// Read or generate the correlation id, run the request inside its trace
/// context and echo it on the response.
pub async fn correlation_middleware(mut request: Request, next: Next) -> Response {
    let supplied = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok());
    let context = TraceContext::from_supplied(supplied);
    let trace_id = context.trace_id.clone();

    request.extensions_mut().insert(context.clone());

    let span = tracing::info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        trace_id = %trace_id,
    );

    let mut response = with_trace_context(context, next.run(request).instrument(span)).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        headers.insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(SKIP_BROWSER_WARNING_HEADER),
        HeaderValue::from_static("true"),
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use tower::ServiceExt;

    async fn echo_trace_id() -> String {
        crate::telemetry::current_trace_id().unwrap_or_default()
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(echo_trace_id))
            .layer(axum::middleware::from_fn(correlation_middleware))
    }

    #[tokio::test]
    async fn supplied_correlation_id_is_echoed() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .header("X-Correlation-ID", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CORRELATION_ID_HEADER], "abc-123");
        assert_eq!(response.headers()[SKIP_BROWSER_WARNING_HEADER], "true");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"abc-123");
    }

    #[tokio::test]
    async fn correlation_id_is_generated_when_absent() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let generated = response.headers()[CORRELATION_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }
}
