//! # Provider Registry
//!
//! Static mapping from provider identifier to its webhook configuration. The
//! registry is built once at startup from [`AppConfig`] and handed to the
//! admission pipeline; it exposes no mutation path afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::config::{AppConfig, ProviderSettings};

/// Identifier of the provider used when a request names no provider or an unknown one
pub const DEFAULT_PROVIDER: &str = "default";

/// Header carrying the signature when a provider does not name one
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Signature";

/// Fixed-window rate limit policy for a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RateLimitRule {
    /// Requests allowed per window for one (provider, client) pair
    pub max_requests: u32,
    /// Window length in seconds
    pub window_seconds: u64,
}

/// Resolved configuration for one webhook provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub id: String,
    /// Shared HMAC key; `None` makes every signature check fail
    pub secret: Option<String>,
    pub signature_header: String,
    pub event_type_header: Option<String>,
    /// Top-level payload keys that must be present
    pub required_fields: Vec<String>,
    pub rate_limit: Option<RateLimitRule>,
}

impl ProviderConfig {
    /// Build a provider from its configured settings
    pub fn from_settings(id: &str, settings: &ProviderSettings) -> Self {
        Self {
            id: normalize_provider_id(id),
            secret: settings.secret.clone().filter(|s| !s.is_empty()),
            signature_header: settings.signature_header.clone(),
            event_type_header: settings
                .event_type_header
                .clone()
                .filter(|h| !h.trim().is_empty()),
            required_fields: settings.required_fields.clone(),
            rate_limit: settings.rate_limit,
        }
    }

    /// Fallback provider used when nothing named `default` is configured
    pub fn fallback_default() -> Self {
        Self::from_settings(DEFAULT_PROVIDER, &ProviderSettings::default())
    }
}

/// Lower-case and trim a provider identifier
pub fn normalize_provider_id(id: &str) -> String {
    id.trim().to_lowercase()
}

/// Read-only registry of provider configurations
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ProviderConfig>>,
    default: Arc<ProviderConfig>,
}

impl ProviderRegistry {
    /// Create a registry from the given providers, synthesising `default` when absent
    pub fn new(providers: impl IntoIterator<Item = ProviderConfig>) -> Self {
        let mut providers: HashMap<String, Arc<ProviderConfig>> = providers
            .into_iter()
            .map(|provider| (provider.id.clone(), Arc::new(provider)))
            .collect();

        let default = providers
            .entry(DEFAULT_PROVIDER.to_string())
            .or_insert_with(|| Arc::new(ProviderConfig::fallback_default()))
            .clone();

        Self { providers, default }
    }

    /// Build the registry from loaded application configuration
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config
                .providers
                .iter()
                .map(|(id, settings)| ProviderConfig::from_settings(id, settings)),
        )
    }

    /// Resolve a provider by id; unknown ids fall back to the default provider
    pub fn resolve(&self, provider_id: &str) -> Arc<ProviderConfig> {
        let key = normalize_provider_id(provider_id);
        match self.providers.get(&key) {
            Some(provider) => Arc::clone(provider),
            None => {
                debug!(provider = %key, "Unknown provider, using default configuration");
                Arc::clone(&self.default)
            }
        }
    }

    /// Whether a provider with this id is explicitly configured
    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(&normalize_provider_id(provider_id))
    }

    /// Configured provider ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github() -> ProviderConfig {
        ProviderConfig {
            id: "github".to_string(),
            secret: Some("gh-secret".to_string()),
            signature_header: "X-Hub-Signature-256".to_string(),
            event_type_header: Some("X-GitHub-Event".to_string()),
            required_fields: vec![],
            rate_limit: None,
        }
    }

    #[test]
    fn default_provider_always_exists() {
        let registry = ProviderRegistry::new(vec![github()]);

        let resolved = registry.resolve("default");
        assert_eq!(resolved.id, DEFAULT_PROVIDER);
        assert_eq!(resolved.signature_header, DEFAULT_SIGNATURE_HEADER);
        assert!(resolved.secret.is_none());
    }

    #[test]
    fn unknown_provider_resolves_to_default() {
        let registry = ProviderRegistry::new(vec![github()]);

        assert_eq!(registry.resolve("stripe").id, DEFAULT_PROVIDER);
        assert!(!registry.contains("stripe"));
    }

    #[test]
    fn lookup_ignores_case_and_whitespace() {
        let registry = ProviderRegistry::new(vec![github()]);

        let resolved = registry.resolve(" GitHub ");
        assert_eq!(resolved.id, "github");
        assert_eq!(resolved.secret.as_deref(), Some("gh-secret"));
    }

    #[test]
    fn configured_default_is_not_replaced() {
        let mut settings = ProviderSettings::default();
        settings.secret = Some("test-secret".to_string());
        settings.required_fields = vec!["id".to_string()];

        let registry =
            ProviderRegistry::new(vec![ProviderConfig::from_settings("default", &settings)]);

        let resolved = registry.resolve("anything");
        assert_eq!(resolved.secret.as_deref(), Some("test-secret"));
        assert_eq!(resolved.required_fields, vec!["id".to_string()]);
        assert_eq!(registry.ids(), vec!["default".to_string()]);
    }

    #[test]
    fn empty_secret_counts_as_absent() {
        let mut settings = ProviderSettings::default();
        settings.secret = Some(String::new());

        let provider = ProviderConfig::from_settings("Acme", &settings);
        assert_eq!(provider.id, "acme");
        assert!(provider.secret.is_none());
    }
}
