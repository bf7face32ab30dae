//! Telemetry: global subscriber setup, the per-request correlation context,
//! and the webhook metrics emitted through the `metrics` facade.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::LevelFilter;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::EventStatus;

/// Header used to thread a correlation identifier through requests and responses
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Correlation context for one inbound request.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    /// Use the caller-supplied id when present, otherwise generate one.
    pub fn from_supplied(supplied: Option<&str>) -> Self {
        let trace_id = supplied
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self { trace_id }
    }
}

task_local! {
    static ACTIVE_TRACE_CONTEXT: TraceContext;
}

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing/logging exactly once, wiring `log::` macros into the tracing pipeline.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // sqlx and sea-orm log through `log`; route them into tracing.
    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to install log tracer bridge: {}. `log::` records will not reach the subscriber.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().with_target(true).boxed(),
        _ => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: Failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    Ok(())
}

/// Execute `future` within the provided trace context, making it available through task-local
/// storage for the duration of the request.
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TRACE_CONTEXT.scope(context, future).await
}

/// Get the currently active trace ID, if one has been set for the running task.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|ctx| ctx.trace_id.clone())
        .ok()
}

/// Count an inbound webhook request
pub fn record_request(provider: &str) {
    counter!("webhook_requests_total", "provider" => provider.to_string()).increment(1);
}

/// Count a request rejected at admission; `reason` is the error code
pub fn record_rejection(provider: &str, reason: &'static str) {
    counter!(
        "webhook_rejected_total",
        "provider" => provider.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Count an event that could not be queued and was left pending
pub fn record_dispatch_dropped(provider: &str) {
    counter!("webhook_dispatch_dropped_total", "provider" => provider.to_string()).increment(1);
}

/// Count an event reaching a terminal status and record how long processing took
pub fn record_finalized(provider: &str, status: EventStatus, elapsed: Duration) {
    counter!(
        "webhook_events_finalized_total",
        "provider" => provider.to_string(),
        "status" => status.as_str()
    )
    .increment(1);
    histogram!("webhook_processing_seconds").record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supplied_correlation_id_is_kept() {
        let context = TraceContext::from_supplied(Some(" abc-123 "));
        assert_eq!(context.trace_id, "abc-123");
    }

    #[test]
    fn missing_or_blank_correlation_id_is_generated() {
        for supplied in [None, Some(""), Some("   ")] {
            let context = TraceContext::from_supplied(supplied);
            assert!(Uuid::parse_str(&context.trace_id).is_ok());
        }
    }

    #[tokio::test]
    async fn trace_id_is_scoped_to_the_task() {
        assert_eq!(current_trace_id(), None);

        let inside = with_trace_context(
            TraceContext {
                trace_id: "corr-1".to_string(),
            },
            async { current_trace_id() },
        )
        .await;

        assert_eq!(inside.as_deref(), Some("corr-1"));
        assert_eq!(current_trace_id(), None);
    }
}
