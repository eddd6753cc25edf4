//! Redis-backed [`SessionCache`].
//!
//! Uses a multiplexed [`ConnectionManager`], which reconnects on its own
//! after transient failures. Every command maps to a single Redis command;
//! in particular `get_and_touch` is `GETEX key PX ttl`, so a refresh that
//! loses a race against `DEL` finds no key and changes nothing.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::error;

use crate::cache::{CacheError, SessionCache};

/// Session cache stored in Redis.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Wraps an established connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Opens a connection manager for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self::new(conn))
    }
}

fn unavailable(err: redis::RedisError) -> CacheError {
    error!(error = %err, "Redis command failed");
    CacheError::Unavailable(err.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX rejects zero.
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SessionCache for RedisCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get_and_touch(&self, key: &str, ttl: Duration) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("GETEX")
            .arg(key)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_millis_is_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
    }

    #[test]
    fn ttl_millis_converts_seconds() {
        assert_eq!(ttl_millis(Duration::from_secs(3600)), 3_600_000);
    }

    #[tokio::test]
    async fn connect_rejects_invalid_url() {
        let result = RedisCache::connect("not a redis url").await;
        assert!(matches!(result, Err(CacheError::Unavailable(_))));
    }
}
