//! Fixed-window rate limiting per (provider, client) pair.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::counter_store::{CounterStoreError, ExpiringStore};
use crate::providers::ProviderConfig;

/// Errors returned by [`RateLimiter::check`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded")]
    Exceeded { limit: u32, window_seconds: u64 },

    #[error(transparent)]
    Store(#[from] CounterStoreError),
}

/// Fixed (non-sliding) window limiter backed by a shared expiring store
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn ExpiringStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn ExpiringStore>) -> Self {
        Self { store }
    }

    /// Counter key for a provider and client identity
    pub fn counter_key(provider_id: &str, client_identity: &str) -> String {
        format!("webhook:{}:{}", provider_id, client_identity)
    }

    /// Count one request and fail once the provider's window allowance is used up.
    ///
    /// Providers without a policy always pass. Counting is a single atomic
    /// increment so concurrent requests for the same key cannot overshoot.
    pub async fn check(
        &self,
        provider: &ProviderConfig,
        client_identity: &str,
    ) -> Result<(), RateLimitError> {
        let Some(rule) = provider.rate_limit else {
            return Ok(());
        };
        if rule.max_requests == 0 || rule.window_seconds == 0 {
            return Ok(());
        }

        let key = Self::counter_key(&provider.id, client_identity);
        let count = self
            .store
            .increment(&key, Duration::from_secs(rule.window_seconds))
            .await?;

        if count > u64::from(rule.max_requests) {
            warn!(
                provider = %provider.id,
                client = %client_identity,
                count,
                limit = rule.max_requests,
                "Webhook rate limit exceeded"
            );
            return Err(RateLimitError::Exceeded {
                limit: rule.max_requests,
                window_seconds: rule.window_seconds,
            });
        }

        Ok(())
    }
}
