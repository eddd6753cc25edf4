//! TTL key-value caches backing the session store.
//!
//! The session store only needs four operations from its backing cache,
//! captured by [`SessionCache`]. Two implementations exist:
//!
//! - [`MemoryCache`] - an in-process map, used in tests and single-node
//!   development setups
//! - [`RedisCache`](crate::redis_cache::RedisCache) - the production backend
//!
//! # Refresh semantics
//!
//! [`SessionCache::get_and_touch`] reads a value and resets its TTL. Both
//! bundled implementations do this atomically, so a touch racing a
//! concurrent `del` can never bring the deleted entry back. The default
//! trait implementation (a `get` followed by a `set`) does not have that
//! property: a `del` that lands between the two calls is undone by the
//! `set`, resurrecting the entry for at most one TTL. Caches that rely on
//! the default accept that window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Errors returned by a backing cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache could not be reached or rejected the command.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// A key-value cache with per-entry time-to-live.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Stores `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Returns the value under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Removes `key`. Removing an absent key succeeds.
    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Returns the value under `key` and resets its expiry to `ttl`.
    ///
    /// See the module documentation for the consistency of the default
    /// implementation.
    async fn get_and_touch(&self, key: &str, ttl: Duration) -> Result<Option<String>, CacheError> {
        let value = self.get(key).await?;
        if let Some(ref value) = value {
            self.set(key, value.clone(), ttl).await?;
        }
        Ok(value)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process TTL cache.
///
/// Expiry uses the tokio clock, so tests can drive it with
/// `tokio::time::pause` and `tokio::time::advance`. Expired entries are
/// dropped lazily on access and in bulk by [`purge_expired`](Self::purge_expired).
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the number of stored entries, including expired ones not yet
    /// purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();

        if removed > 0 {
            debug!(
                removed_count = removed,
                remaining_count = entries.len(),
                "Purged expired cache entries"
            );
        }
        removed
    }

    /// Spawns a background task that purges expired entries every `interval`.
    pub fn spawn_purge_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cache.purge_expired();
            }
        })
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        self.lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        Ok(Self::live_value(&mut self.lock(), key, now))
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn get_and_touch(&self, key: &str, ttl: Duration) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let value = Self::live_value(&mut entries, key, now);
        if value.is_some() {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = now + ttl;
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let cache = MemoryCache::new();
        cache.set("k", "v".to_string(), TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn del_is_idempotent() {
        let cache = MemoryCache::new();
        cache.set("k", "v".to_string(), TTL).await.unwrap();
        cache.del("k").await.unwrap();
        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", "v".to_string(), TTL).await.unwrap();

        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty(), "expired entry should be dropped on access");
    }

    #[tokio::test(start_paused = true)]
    async fn get_and_touch_extends_expiry() {
        let cache = MemoryCache::new();
        cache.set("k", "v".to_string(), TTL).await.unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(45)).await;
            assert!(cache.get_and_touch("k", TTL).await.unwrap().is_some());
        }

        tokio::time::advance(TTL).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_and_touch_does_not_resurrect_deleted_key() {
        let cache = MemoryCache::new();
        cache.set("k", "v".to_string(), TTL).await.unwrap();
        cache.del("k").await.unwrap();

        assert_eq!(cache.get_and_touch("k", TTL).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_removes_only_expired_entries() {
        let cache = MemoryCache::new();
        cache.set("short", "1".to_string(), Duration::from_secs(1)).await.unwrap();
        cache.set("long", "2".to_string(), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("long").await.unwrap().is_some());
    }
}
