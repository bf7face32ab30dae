//! Case-insensitive request header snapshot.
//!
//! Incoming headers are resolved once at the HTTP boundary into a map of
//! lower-case name to a single value, so the admission pipeline never deals
//! with repeated or non-UTF-8 header values.

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use serde_json::Value as JsonValue;

/// Headers that carry credentials and are never persisted with an event
const CREDENTIAL_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "proxy-authorization",
    "x-api-key",
];

/// Request headers keyed by lower-case name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders(BTreeMap<String, String>);

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an axum header map. The first value of a repeated header wins and
    /// values that are not valid UTF-8 are dropped.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut resolved = BTreeMap::new();
        for (name, value) in headers {
            let Ok(value) = value.to_str() else {
                tracing::debug!(header = %name, "Dropping non UTF-8 header value");
                continue;
            };
            resolved
                .entry(name.as_str().to_lowercase())
                .or_insert_with(|| value.to_string());
        }
        Self(resolved)
    }

    /// Look up a header by name, ignoring case
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Insert or replace a header value
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_lowercase(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON snapshot persisted with the event, without credential headers
    pub fn snapshot(&self) -> JsonValue {
        let persisted: serde_json::Map<String, JsonValue> = self
            .0
            .iter()
            .filter(|(name, _)| !CREDENTIAL_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), JsonValue::String(value.clone())))
            .collect();
        JsonValue::Object(persisted)
    }
}

impl<K, V> FromIterator<(K, V)> for RequestHeaders
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}
