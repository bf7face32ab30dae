//! Configuration loading for the webhook ingestion service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `INGEST_`, producing a typed [`AppConfig`]. Webhook providers come from an
//! optional JSON file named by `INGEST_PROVIDERS_FILE` and from per-provider
//! `INGEST_PROVIDER_<ID>_<SETTING>` variables, which take precedence.

use std::{collections::BTreeMap, env, fmt, fs, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::providers::{DEFAULT_PROVIDER, DEFAULT_SIGNATURE_HEADER, RateLimitRule};

const ENV_PREFIX: &str = "INGEST_";
const PROVIDER_PREFIX: &str = "PROVIDER_";
const REDACTED: &str = "[REDACTED]";

/// Longest accepted rate-limit window (one year)
pub const MAX_RATE_LIMIT_WINDOW_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Per-provider settings, longest first so suffix matching is unambiguous.
const PROVIDER_SETTINGS: [&str; 6] = [
    "RATE_LIMIT_WINDOW_SECONDS",
    "RATE_LIMIT_MAX_REQUESTS",
    "SIGNATURE_HEADER",
    "EVENT_TYPE_HEADER",
    "REQUIRED_FIELDS",
    "SECRET",
];

/// Application configuration derived from `INGEST_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Largest accepted webhook body in KiB
    #[serde(default = "default_max_body_kb")]
    pub max_body_kb: usize,
    /// Take the client identity from `X-Forwarded-For` (only behind a trusted proxy)
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Maximum number of rate-limit counters held in memory
    #[serde(default = "default_rate_limit_store_capacity")]
    pub rate_limit_store_capacity: usize,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderSettings>,
}

/// How admitted events reach the processing hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Process within the request before responding
    Inline,
    /// Submit to a bounded worker pool
    Pool,
}

/// Behaviour when the worker queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Wait for queue space
    Block,
    /// Leave the event pending and log it
    Reject,
}

/// Processing dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DispatchConfig {
    /// Environment variable: `INGEST_DISPATCH_MODE`
    #[serde(default = "default_dispatch_mode")]
    pub mode: DispatchMode,
    /// Environment variable: `INGEST_DISPATCH_WORKERS`
    #[serde(default = "default_dispatch_workers")]
    pub workers: usize,
    /// Environment variable: `INGEST_DISPATCH_QUEUE_CAPACITY`
    #[serde(default = "default_dispatch_queue_capacity")]
    pub queue_capacity: usize,
    /// Environment variable: `INGEST_DISPATCH_QUEUE_FULL_POLICY`
    #[serde(default = "default_queue_full_policy")]
    pub queue_full_policy: QueueFullPolicy,
}

/// Webhook settings for one provider as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type_header: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitRule>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            secret: None,
            signature_header: default_signature_header(),
            event_type_header: None,
            required_fields: Vec::new(),
            rate_limit: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            max_body_kb: default_max_body_kb(),
            trust_forwarded_for: false,
            rate_limit_store_capacity: default_rate_limit_store_capacity(),
            dispatch: DispatchConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: default_dispatch_mode(),
            workers: default_dispatch_workers(),
            queue_capacity: default_dispatch_queue_capacity(),
            queue_full_policy: default_queue_full_policy(),
        }
    }
}

impl DispatchConfig {
    /// Validate worker pool bounds (only meaningful in pool mode).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == DispatchMode::Pool {
            if self.workers == 0 {
                return Err(ConfigError::InvalidDispatchWorkers {
                    value: self.workers,
                });
            }
            if self.queue_capacity == 0 {
                return Err(ConfigError::InvalidDispatchQueueCapacity {
                    value: self.queue_capacity,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Inline => write!(f, "inline"),
            DispatchMode::Pool => write!(f, "pool"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inline" | "sync" => Ok(DispatchMode::Inline),
            "pool" => Ok(DispatchMode::Pool),
            _ => Err(ConfigError::InvalidDispatchMode {
                value: value.to_string(),
            }),
        }
    }
}

impl FromStr for QueueFullPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(QueueFullPolicy::Block),
            "reject" => Ok(QueueFullPolicy::Reject),
            _ => Err(ConfigError::InvalidQueueFullPolicy {
                value: value.to_string(),
            }),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Body size limit in bytes.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_kb.saturating_mul(1024)
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        // Redact provider secrets for security
        for settings in config.providers.values_mut() {
            if settings.secret.is_some() {
                settings.secret = Some(REDACTED.to_string());
            }
        }
        if config.database_url.contains('@') {
            config.database_url = REDACTED.to_string();
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.dispatch.validate()?;

        for (id, settings) in &self.providers {
            if settings.signature_header.trim().is_empty() {
                return Err(ConfigError::EmptySignatureHeader {
                    provider: id.clone(),
                });
            }
            if let Some(rule) = settings.rate_limit {
                if rule.max_requests == 0 || rule.window_seconds == 0 {
                    return Err(ConfigError::InvalidProviderRateLimit {
                        provider: id.clone(),
                        max_requests: rule.max_requests,
                        window_seconds: rule.window_seconds,
                    });
                }
                if rule.window_seconds > MAX_RATE_LIMIT_WINDOW_SECONDS {
                    return Err(ConfigError::RateLimitWindowTooLong {
                        provider: id.clone(),
                        window_seconds: rule.window_seconds,
                    });
                }
            }
        }

        self.bind_addr()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: self.api_bind_addr.clone(),
                source,
            })?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://webhooks.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_max_body_kb() -> usize {
    1024
}

fn default_rate_limit_store_capacity() -> usize {
    100_000
}

fn default_dispatch_mode() -> DispatchMode {
    DispatchMode::Pool
}

fn default_dispatch_workers() -> usize {
    4
}

fn default_dispatch_queue_capacity() -> usize {
    1024
}

fn default_queue_full_policy() -> QueueFullPolicy {
    QueueFullPolicy::Block
}

fn default_signature_header() -> String {
    DEFAULT_SIGNATURE_HEADER.to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("failed to read providers file {path}: {source}")]
    ProvidersFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("providers file {path} is not a valid provider map: {source}")]
    ProvidersFileFormat {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("dispatch mode must be 'inline' or 'pool', got '{value}'")]
    InvalidDispatchMode { value: String },
    #[error("queue full policy must be 'block' or 'reject', got '{value}'")]
    InvalidQueueFullPolicy { value: String },
    #[error("dispatch workers must be at least 1 in pool mode, got {value}")]
    InvalidDispatchWorkers { value: usize },
    #[error("dispatch queue capacity must be at least 1 in pool mode, got {value}")]
    InvalidDispatchQueueCapacity { value: usize },
    #[error("provider {provider} has an empty signature header name")]
    EmptySignatureHeader { provider: String },
    #[error(
        "provider {provider} rate limit needs both max requests and window seconds; set INGEST_PROVIDER_{env_id}_RATE_LIMIT_MAX_REQUESTS and INGEST_PROVIDER_{env_id}_RATE_LIMIT_WINDOW_SECONDS"
    )]
    IncompleteProviderRateLimit { provider: String, env_id: String },
    #[error(
        "provider {provider} rate limit must be positive (max_requests: {max_requests}, window_seconds: {window_seconds})"
    )]
    InvalidProviderRateLimit {
        provider: String,
        max_requests: u32,
        window_seconds: u64,
    },
    #[error(
        "provider {provider} rate limit window of {window_seconds}s exceeds the maximum of {max}s",
        max = MAX_RATE_LIMIT_WINDOW_SECONDS
    )]
    RateLimitWindowTooLong { provider: String, window_seconds: u64 },
}

/// Loads configuration using layered `.env` files and `INGEST_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.<profile>`, `.env.<profile>.local`,
    /// then the process environment, and validates the result.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let config = self.build(layered, profile_hint)?;
        config.validate()?;
        Ok(config)
    }

    fn build(
        &self,
        mut layered: BTreeMap<String, String>,
        profile_hint: String,
    ) -> Result<AppConfig, ConfigError> {
        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .map(|v| v.to_lowercase())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let max_body_kb = layered
            .remove("MAX_BODY_KB")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_max_body_kb);
        let trust_forwarded_for = match layered.remove("TRUST_FORWARDED_FOR") {
            Some(value) => parse_bool("TRUST_FORWARDED_FOR", &value)?,
            None => false,
        };
        let rate_limit_store_capacity = layered
            .remove("RATE_LIMIT_STORE_CAPACITY")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_rate_limit_store_capacity);

        // Parse dispatcher configuration
        let dispatch_mode = match layered.remove("DISPATCH_MODE").filter(|v| !v.is_empty()) {
            Some(value) => value.parse()?,
            None => default_dispatch_mode(),
        };
        let dispatch_workers = layered
            .remove("DISPATCH_WORKERS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_dispatch_workers);
        let dispatch_queue_capacity = layered
            .remove("DISPATCH_QUEUE_CAPACITY")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_dispatch_queue_capacity);
        let queue_full_policy = match layered
            .remove("DISPATCH_QUEUE_FULL_POLICY")
            .filter(|v| !v.is_empty())
        {
            Some(value) => value.parse()?,
            None => default_queue_full_policy(),
        };

        // Providers file first, then per-provider variables on top
        let mut providers = match layered.remove("PROVIDERS_FILE").filter(|v| !v.is_empty()) {
            Some(path) => self.read_providers_file(PathBuf::from(path))?,
            None => BTreeMap::new(),
        };
        apply_provider_env(&layered, &mut providers)?;
        providers
            .entry(DEFAULT_PROVIDER.to_string())
            .or_insert_with(ProviderSettings::default);

        Ok(AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            max_body_kb,
            trust_forwarded_for,
            rate_limit_store_capacity,
            dispatch: DispatchConfig {
                mode: dispatch_mode,
                workers: dispatch_workers,
                queue_capacity: dispatch_queue_capacity,
                queue_full_policy,
            },
            providers,
        })
    }

    fn read_providers_file(
        &self,
        path: PathBuf,
    ) -> Result<BTreeMap<String, ProviderSettings>, ConfigError> {
        let path = if path.is_relative() {
            self.base_dir.join(path)
        } else {
            path
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::ProvidersFile {
            path: path.clone(),
            source,
        })?;
        let parsed: BTreeMap<String, ProviderSettings> = serde_json::from_str(&contents)
            .map_err(|source| ConfigError::ProvidersFileFormat {
                path: path.clone(),
                source,
            })?;

        Ok(parsed
            .into_iter()
            .map(|(id, settings)| (id.trim().to_lowercase(), settings))
            .collect())
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("INGEST_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `PROVIDER_<ID>_<SETTING>` into the provider id and the setting name.
fn split_provider_key(key: &str) -> Option<(String, &'static str)> {
    let rest = key.strip_prefix(PROVIDER_PREFIX)?;
    PROVIDER_SETTINGS.iter().find_map(|setting| {
        let id = rest.strip_suffix(setting)?.strip_suffix('_')?;
        (!id.is_empty()).then(|| (id.to_lowercase(), *setting))
    })
}

/// Overlay `PROVIDER_<ID>_<SETTING>` values onto the provider map.
fn apply_provider_env(
    layered: &BTreeMap<String, String>,
    providers: &mut BTreeMap<String, ProviderSettings>,
) -> Result<(), ConfigError> {
    // Rate limits arrive as two variables; collect both halves before merging
    let mut rate_limits: BTreeMap<String, (Option<u32>, Option<u64>)> = BTreeMap::new();

    for (key, value) in layered {
        let Some((id, setting)) = split_provider_key(key) else {
            continue;
        };
        let value = value.trim();

        match setting {
            "RATE_LIMIT_MAX_REQUESTS" => {
                let max_requests = parse_number(key, value)?;
                rate_limits.entry(id).or_default().0 = Some(max_requests);
            }
            "RATE_LIMIT_WINDOW_SECONDS" => {
                let window_seconds = parse_number(key, value)?;
                rate_limits.entry(id).or_default().1 = Some(window_seconds);
            }
            _ => {
                let entry = providers.entry(id).or_default();
                match setting {
                    "SECRET" => {
                        entry.secret = Some(value.to_string()).filter(|s| !s.is_empty());
                    }
                    "SIGNATURE_HEADER" => entry.signature_header = value.to_string(),
                    "EVENT_TYPE_HEADER" => {
                        entry.event_type_header = Some(value.to_string()).filter(|s| !s.is_empty());
                    }
                    "REQUIRED_FIELDS" => {
                        entry.required_fields = value
                            .split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect();
                    }
                    _ => {}
                }
            }
        }
    }

    for (id, (max_requests, window_seconds)) in rate_limits {
        let entry = providers.entry(id.clone()).or_default();
        let existing = entry.rate_limit;
        let max_requests = max_requests.or(existing.map(|rule| rule.max_requests));
        let window_seconds = window_seconds.or(existing.map(|rule| rule.window_seconds));

        match (max_requests, window_seconds) {
            (Some(max_requests), Some(window_seconds)) => {
                entry.rate_limit = Some(RateLimitRule {
                    max_requests,
                    window_seconds,
                });
            }
            _ => {
                return Err(ConfigError::IncompleteProviderRateLimit {
                    env_id: id.to_uppercase(),
                    provider: id,
                });
            }
        }
    }

    Ok(())
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
        }),
    }
}
