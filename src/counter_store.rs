//! Expiring key-value store for rate-limit counters.
//!
//! The rate limiter only needs three operations from its backing store. The
//! in-memory implementation is bounded by an LRU so a flood of distinct client
//! identities cannot grow it without limit.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;

/// Errors raised by a counter store backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter ttl of {0:?} is out of range")]
    TtlOutOfRange(Duration),
}

fn expiry_after(now: Instant, ttl: Duration) -> Result<Instant, CounterStoreError> {
    now.checked_add(ttl)
        .ok_or(CounterStoreError::TtlOutOfRange(ttl))
}

/// Shared, expiring store of integer counters
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Current value of a live counter
    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError>;

    /// Overwrite a counter, expiring it after `ttl`
    async fn set_with_ttl(&self, key: &str, value: u64, ttl: Duration)
    -> Result<(), CounterStoreError>;

    /// Atomically increment a counter and return the new value.
    ///
    /// An absent or expired counter is created at 1 and expires after `ttl`.
    /// Incrementing a live counter never extends its expiry.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError>;
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: u64,
    expires_at: Instant,
}

impl CounterEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local [`ExpiringStore`] with lazy expiry
pub struct InMemoryExpiringStore {
    entries: Mutex<LruCache<String, CounterEntry>>,
}

impl InMemoryExpiringStore {
    /// Default number of tracked counters
    pub const DEFAULT_CAPACITY: usize = 100_000;

    /// Create a store tracking at most `capacity` counters
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(Self::DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, LruCache<String, CounterEntry>>, CounterStoreError> {
        self.entries
            .lock()
            .map_err(|_| CounterStoreError::Unavailable("counter map lock poisoned".to_string()))
    }

    /// Number of counters currently held, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryExpiringStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl ExpiringStore for InMemoryExpiringStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError> {
        let now = Instant::now();
        let mut entries = self.lock()?;

        let expired = match entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value)),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
    ) -> Result<(), CounterStoreError> {
        let expires_at = expiry_after(Instant::now(), ttl)?;
        self.lock()?
            .put(key.to_string(), CounterEntry { value, expires_at });
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let now = Instant::now();
        // Computed outside the lock
        let expires_at = expiry_after(now, ttl)?;
        let mut entries = self.lock()?;

        if let Some(entry) = entries.get_mut(key) {
            if entry.is_live(now) {
                entry.value = entry.value.saturating_add(1);
                return Ok(entry.value);
            }
        }

        entries.put(
            key.to_string(),
            CounterEntry {
                value: 1,
                expires_at,
            },
        );
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn increment_creates_then_counts() {
        let store = InMemoryExpiringStore::default();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
        assert_eq!(store.increment("k", ttl).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn counters_expire_after_ttl() {
        let store = InMemoryExpiringStore::default();
        store
            .set_with_ttl("k", 5, Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(5));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn increment_does_not_extend_expiry() {
        let store = InMemoryExpiringStore::default();
        let ttl = Duration::from_secs(10);

        store.increment("k", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.increment("k", ttl).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn least_recently_used_counter_is_evicted_at_capacity() {
        let store = InMemoryExpiringStore::new(2);
        let ttl = Duration::from_secs(60);

        store.increment("a", ttl).await.unwrap();
        store.increment("b", ttl).await.unwrap();
        store.increment("a", ttl).await.unwrap();
        store.increment("c", ttl).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(2));
        assert_eq!(store.get("b").await.unwrap(), None);
        assert_eq!(store.get("c").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_an_error_and_leaves_store_usable() {
        let store = InMemoryExpiringStore::default();
        let huge = Duration::from_secs(u64::MAX);

        assert!(matches!(
            store.increment("k", huge).await,
            Err(CounterStoreError::TtlOutOfRange(_))
        ));
        assert!(matches!(
            store.set_with_ttl("k", 1, huge).await,
            Err(CounterStoreError::TtlOutOfRange(_))
        ));

        assert_eq!(
            store.increment("k", Duration::from_secs(60)).await.unwrap(),
            1
        );
    }
}
