//! Session state store with sliding expiration.
//!
//! This module maps [`SessionId`]s to [`SessionState`] through any
//! [`SessionCache`] backend. State is JSON-encoded and stored under a key
//! derived from the token (`sid:<token>`), never the raw token, so session
//! entries cannot collide with unrelated keys in a shared cache.
//!
//! # Expiration
//!
//! Every entry is written with the store's TTL. Every successful
//! [`get`](SessionStore::get) resets that TTL, so a session that keeps
//! being used never expires mid-use while an idle one does.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use portico_gateway::cache::MemoryCache;
//! use portico_gateway::session::SessionStore;
//! use portico_gateway::sid::{SessionId, SessionKey};
//! use portico_gateway::types::{SessionState, UserSnapshot};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = SessionStore::new(Arc::new(MemoryCache::new()), Duration::from_secs(3600));
//! let sid = SessionId::issue(&SessionKey::new("secret")).unwrap();
//!
//! let state = SessionState::begin(UserSnapshot {
//!     id: 7,
//!     user_name: "ada".into(),
//!     first_name: "Ada".into(),
//!     last_name: "Lovelace".into(),
//!     photo_url: String::new(),
//! });
//! store.save(&sid, &state).await.unwrap();
//!
//! assert_eq!(store.get(&sid).await.unwrap(), state);
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::cache::{CacheError, SessionCache};
use crate::sid::SessionId;
use crate::types::SessionState;

/// Default sliding session TTL (one hour).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

const KEY_PREFIX: &str = "sid:";

/// Errors that can occur during session store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No state exists for the session, or it has expired.
    #[error("session state not found")]
    StateNotFound,

    /// The backing cache failed.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    /// Stored state could not be encoded or decoded.
    #[error("session state codec error: {0}")]
    Codec(String),
}

impl From<CacheError> for SessionError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Unavailable(message) => SessionError::StoreUnavailable(message),
        }
    }
}

/// Session store over a pluggable TTL cache.
///
/// Cloning is cheap and clones share the backing cache.
#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn SessionCache>,
    ttl: Duration,
}

impl SessionStore {
    /// Creates a store writing entries with the given sliding `ttl`.
    pub fn new(cache: Arc<dyn SessionCache>, ttl: Duration) -> Self {
        debug!(ttl_secs = ttl.as_secs(), "Creating session store");
        Self { cache, ttl }
    }

    /// Returns the sliding TTL applied on every save and read.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores `state` for `sid`, replacing any existing state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StoreUnavailable`] if the cache write fails.
    pub async fn save(&self, sid: &SessionId, state: &SessionState) -> Result<(), SessionError> {
        let encoded =
            serde_json::to_string(state).map_err(|err| SessionError::Codec(err.to_string()))?;
        self.cache.set(&cache_key(sid), encoded, self.ttl).await?;

        trace!(user_id = state.user.id, "Session state saved");
        Ok(())
    }

    /// Fetches the state for `sid` and resets its TTL.
    ///
    /// The read and the refresh are a single cache operation. Whether a
    /// refresh can race a concurrent [`delete`](Self::delete) depends on the
    /// cache; see [`crate::cache`].
    ///
    /// # Errors
    ///
    /// - [`SessionError::StateNotFound`] if absent or expired
    /// - [`SessionError::StoreUnavailable`] if the cache fails
    /// - [`SessionError::Codec`] if the stored value is not valid state
    pub async fn get(&self, sid: &SessionId) -> Result<SessionState, SessionError> {
        let Some(encoded) = self.cache.get_and_touch(&cache_key(sid), self.ttl).await? else {
            trace!("Session state not found");
            return Err(SessionError::StateNotFound);
        };

        serde_json::from_str(&encoded).map_err(|err| {
            warn!(error = %err, "Stored session state could not be decoded");
            SessionError::Codec(err.to_string())
        })
    }

    /// Removes the state for `sid`. Removing an absent session succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StoreUnavailable`] if the cache delete fails.
    pub async fn delete(&self, sid: &SessionId) -> Result<(), SessionError> {
        self.cache.del(&cache_key(sid)).await?;
        trace!("Session state deleted");
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn cache_key(sid: &SessionId) -> String {
    format!("{KEY_PREFIX}{}", sid.as_str())
}
