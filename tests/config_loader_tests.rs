use std::{
    env, fs,
    sync::{Mutex, MutexGuard, OnceLock},
};

use tempfile::TempDir;
use webhook_ingest::{
    config::{ConfigError, ConfigLoader, DispatchMode, QueueFullPolicy},
    providers::RateLimitRule,
};

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("INGEST_"))
        .collect();
    for key in keys {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(dir.path().to_path_buf())
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    let cfg = loader(&dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.log_format, "json");
    assert_eq!(cfg.max_body_bytes(), 1024 * 1024);
    assert!(!cfg.trust_forwarded_for);
    assert_eq!(cfg.dispatch.mode, DispatchMode::Pool);
    assert_eq!(cfg.dispatch.queue_full_policy, QueueFullPolicy::Block);
    assert!(cfg.providers.contains_key("default"));
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    write_file(
        &dir,
        ".env",
        "INGEST_PROFILE=test\nINGEST_API_BIND_ADDR=127.0.0.1:3000\nINGEST_LOG_LEVEL=warn\n",
    );
    write_file(&dir, ".env.local", "INGEST_LOG_LEVEL=info\n");
    write_file(&dir, ".env.test", "INGEST_API_BIND_ADDR=127.0.0.1:4000\n");
    write_file(&dir, ".env.test.local", "INGEST_LOG_LEVEL=trace\n");

    let cfg = loader(&dir).load().unwrap();

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "127.0.0.1:4000");
    assert_eq!(cfg.log_level, "trace");
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        ".env",
        "INGEST_API_BIND_ADDR=127.0.0.1:3000\nINGEST_DISPATCH_MODE=pool\n",
    );

    unsafe {
        env::set_var("INGEST_API_BIND_ADDR", "127.0.0.1:5000");
        env::set_var("INGEST_DISPATCH_MODE", "inline");
    }

    let cfg = loader(&dir).load().unwrap();
    assert_eq!(cfg.api_bind_addr, "127.0.0.1:5000");
    assert_eq!(cfg.dispatch.mode, DispatchMode::Inline);
    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("INGEST_API_BIND_ADDR", "not-an-addr");
    }

    let err = loader(&dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidBindAddr { .. }));
    clear_env();
}

#[test]
fn providers_file_is_loaded_relative_to_base_dir() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "providers.json",
        r#"{
            "GitHub": {
                "secret": "gh-secret",
                "signature_header": "X-Hub-Signature-256",
                "event_type_header": "X-GitHub-Event",
                "required_fields": ["action"],
                "rate_limit": {"max_requests": 100, "window_seconds": 60}
            }
        }"#,
    );
    write_file(&dir, ".env", "INGEST_PROVIDERS_FILE=providers.json\n");

    let cfg = loader(&dir).load().unwrap();

    let github = &cfg.providers["github"];
    assert_eq!(github.secret.as_deref(), Some("gh-secret"));
    assert_eq!(github.signature_header, "X-Hub-Signature-256");
    assert_eq!(github.event_type_header.as_deref(), Some("X-GitHub-Event"));
    assert_eq!(github.required_fields, vec!["action".to_string()]);
    assert_eq!(
        github.rate_limit,
        Some(RateLimitRule {
            max_requests: 100,
            window_seconds: 60
        })
    );
    assert!(cfg.providers.contains_key("default"));
}

#[test]
fn provider_env_overrides_file_settings() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "providers.json",
        r#"{"stripe": {"secret": "from-file", "rate_limit": {"max_requests": 5, "window_seconds": 10}}}"#,
    );

    unsafe {
        env::set_var("INGEST_PROVIDERS_FILE", "providers.json");
        env::set_var("INGEST_PROVIDER_STRIPE_SECRET", "from-env");
        env::set_var("INGEST_PROVIDER_STRIPE_RATE_LIMIT_MAX_REQUESTS", "50");
        env::set_var("INGEST_PROVIDER_STRIPE_REQUIRED_FIELDS", "id, type");
    }

    let cfg = loader(&dir).load().unwrap();
    let stripe = &cfg.providers["stripe"];
    assert_eq!(stripe.secret.as_deref(), Some("from-env"));
    assert_eq!(
        stripe.rate_limit,
        Some(RateLimitRule {
            max_requests: 50,
            window_seconds: 10
        })
    );
    assert_eq!(
        stripe.required_fields,
        vec!["id".to_string(), "type".to_string()]
    );
    clear_env();
}

#[test]
fn half_configured_rate_limit_is_rejected() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("INGEST_PROVIDER_SHOPIFY_RATE_LIMIT_WINDOW_SECONDS", "60");
    }

    let err = loader(&dir).load().unwrap_err();
    assert!(matches!(
        err,
        ConfigError::IncompleteProviderRateLimit { ref provider, .. } if provider == "shopify"
    ));
    clear_env();
}

#[test]
fn missing_providers_file_is_an_error() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("INGEST_PROVIDERS_FILE", "does-not-exist.json");
    }

    let err = loader(&dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::ProvidersFile { .. }));
    clear_env();
}

#[test]
fn invalid_dispatch_settings_are_rejected() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("INGEST_DISPATCH_QUEUE_FULL_POLICY", "drop");
    }
    let err = loader(&dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidQueueFullPolicy { .. }));
    clear_env();

    unsafe {
        env::set_var("INGEST_DISPATCH_WORKERS", "0");
    }
    let err = loader(&dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidDispatchWorkers { value: 0 }));
    clear_env();
}

#[test]
fn redacted_json_hides_provider_secrets() {
    let _guard = env_guard();
    clear_env();
    let dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("INGEST_PROVIDER_GITHUB_SECRET", "super-secret-value");
    }

    let cfg = loader(&dir).load().unwrap();
    let redacted = cfg.redacted_json().unwrap();
    assert!(!redacted.contains("super-secret-value"));
    clear_env();
}
