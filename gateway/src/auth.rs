//! Bearer-token authentication.
//!
//! This module binds the [`SessionId`] codec to the [`SessionStore`]: it
//! begins sessions for authenticated users, resolves the token carried by
//! a request back to its [`SessionState`], and ends sessions.
//!
//! # Token transport
//!
//! Clients send the token in the `Authorization` header, with or without a
//! `Bearer ` scheme prefix. Browsers cannot set headers on a WebSocket
//! upgrade, so the upgrade endpoint also accepts an `auth` query parameter,
//! consulted only when the header is absent.
//!
//! # Example
//!
//! ```rust
//! use axum::http::{header, HeaderMap, HeaderValue};
//! use portico_gateway::auth::bearer_token;
//!
//! let mut headers = HeaderMap::new();
//! headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
//!
//! assert_eq!(bearer_token(&headers, None), Some("abc".to_string()));
//! assert_eq!(bearer_token(&HeaderMap::new(), Some("xyz")), Some("xyz".to_string()));
//! ```

use axum::http::{header, HeaderMap};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::session::{SessionError, SessionStore};
use crate::sid::{SessionId, SessionKey, SidError};
use crate::types::SessionState;

/// Scheme prefix on `Authorization` header values.
pub const SCHEME_BEARER: &str = "Bearer ";

/// Query parameter carrying the token on WebSocket upgrades.
pub const AUTH_QUERY_PARAM: &str = "auth";

/// Errors that can occur while authenticating a request.
///
/// Every variant except [`StoreUnavailable`](AuthError::StoreUnavailable)
/// and [`Issue`](AuthError::Issue) means the caller is not authenticated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied.
    #[error("missing session token")]
    MissingToken,

    /// The token could not be decoded.
    #[error("malformed session token")]
    Malformed,

    /// The token signature does not verify.
    #[error("invalid session token")]
    InvalidSignature,

    /// The token is well-formed but its session has ended or expired.
    #[error("session not found")]
    StateNotFound,

    /// The session store could not be reached.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    /// A new session token could not be minted.
    #[error("session could not be issued: {0}")]
    Issue(String),
}

impl AuthError {
    /// Returns `true` if the error means the caller is unauthenticated, as
    /// opposed to a server-side failure.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            AuthError::MissingToken
                | AuthError::Malformed
                | AuthError::InvalidSignature
                | AuthError::StateNotFound
        )
    }
}

impl From<SidError> for AuthError {
    fn from(err: SidError) -> Self {
        match err {
            SidError::Malformed => AuthError::Malformed,
            SidError::InvalidSignature => AuthError::InvalidSignature,
            SidError::Entropy(message) => AuthError::Issue(message),
        }
    }
}

impl From<SessionError> for AuthError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::StateNotFound => AuthError::StateNotFound,
            SessionError::StoreUnavailable(message) => AuthError::StoreUnavailable(message),
            SessionError::Codec(message) => AuthError::StoreUnavailable(message),
        }
    }
}

/// Extracts the session token from a request.
///
/// The `Authorization` header wins; `query_token` is used only when the
/// header is absent. Empty values count as absent.
pub fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix(SCHEME_BEARER).unwrap_or(value).trim());

    match from_header {
        Some(token) if !token.is_empty() => Some(token.to_string()),
        Some(_) => None,
        None => query_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string),
    }
}

/// Issues, resolves and ends sessions.
///
/// Cloning is cheap; clones share the key and the store.
#[derive(Debug, Clone)]
pub struct Authenticator {
    key: SessionKey,
    store: SessionStore,
}

impl Authenticator {
    /// Creates an authenticator signing tokens with `key`.
    pub fn new(key: SessionKey, store: SessionStore) -> Self {
        Self { key, store }
    }

    /// Returns the underlying session store.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Mints a new token and stores `state` under it.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Issue`] if no token could be minted
    /// - [`AuthError::StoreUnavailable`] if the state could not be saved
    pub async fn begin_session(&self, state: &SessionState) -> Result<SessionId, AuthError> {
        let sid = SessionId::issue(&self.key)?;
        self.store.save(&sid, state).await?;

        debug!(user_id = state.user.id, "Session started");
        Ok(sid)
    }

    /// Validates `token` and fetches its state, refreshing the session TTL.
    ///
    /// # Errors
    ///
    /// Returns an unauthorized [`AuthError`] for bad or unknown tokens and
    /// [`AuthError::StoreUnavailable`] if the store fails.
    pub async fn resolve(&self, token: &str) -> Result<(SessionId, SessionState), AuthError> {
        let sid = SessionId::validate(token, &self.key).map_err(|err| {
            trace!(error = %err, "Rejected session token");
            AuthError::from(err)
        })?;

        let state = self.store.get(&sid).await.map_err(|err| {
            if !matches!(err, SessionError::StateNotFound) {
                warn!(error = %err, "Session lookup failed");
            }
            AuthError::from(err)
        })?;

        Ok((sid, state))
    }

    /// Resolves the token carried by a request.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingToken`] if the request carries no token,
    /// otherwise as [`resolve`](Self::resolve).
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<(SessionId, SessionState), AuthError> {
        let token = bearer_token(headers, query_token).ok_or(AuthError::MissingToken)?;
        self.resolve(&token).await
    }

    /// Replaces the state stored for an existing session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::StoreUnavailable`] if the save fails.
    pub async fn update_session(
        &self,
        sid: &SessionId,
        state: &SessionState,
    ) -> Result<(), AuthError> {
        self.store.save(sid, state).await?;
        Ok(())
    }

    /// Validates the token carried by a request and deletes its session.
    ///
    /// # Errors
    ///
    /// Returns an unauthorized [`AuthError`] if the token is missing or does
    /// not verify, and [`AuthError::StoreUnavailable`] if the delete fails.
    pub async fn end_session(&self, headers: &HeaderMap) -> Result<SessionId, AuthError> {
        let token = bearer_token(headers, None).ok_or(AuthError::MissingToken)?;
        let sid = SessionId::validate(&token, &self.key)?;
        self.store.delete(&sid).await?;

        debug!("Session ended");
        Ok(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::types::UserSnapshot;
    use axum::http::HeaderValue;
    use std::sync::Arc;
    use std::time::Duration;

    fn authenticator() -> Authenticator {
        let store = SessionStore::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));
        Authenticator::new(SessionKey::new("auth-test-key"), store)
    }

    fn state(id: i64) -> SessionState {
        SessionState::begin(UserSnapshot {
            id,
            user_name: "ada".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            photo_url: String::new(),
        })
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_strips_scheme() {
        assert_eq!(
            bearer_token(&headers_with("Bearer tok"), None),
            Some("tok".to_string())
        );
    }

    #[test]
    fn test_bearer_token_accepts_bare_header() {
        assert_eq!(bearer_token(&headers_with("tok"), None), Some("tok".to_string()));
    }

    #[test]
    fn test_bearer_token_prefers_header_over_query() {
        assert_eq!(
            bearer_token(&headers_with("Bearer header"), Some("query")),
            Some("header".to_string())
        );
    }

    #[test]
    fn test_bearer_token_falls_back_to_query() {
        assert_eq!(
            bearer_token(&HeaderMap::new(), Some("query")),
            Some("query".to_string())
        );
        assert_eq!(bearer_token(&HeaderMap::new(), Some("")), None);
        assert_eq!(bearer_token(&HeaderMap::new(), None), None);
    }

    #[tokio::test]
    async fn test_begin_then_resolve() {
        let auth = authenticator();
        let sid = auth.begin_session(&state(7)).await.unwrap();

        let (resolved, resolved_state) = auth.resolve(sid.as_str()).await.unwrap();
        assert_eq!(resolved, sid);
        assert_eq!(resolved_state.user.id, 7);
    }

    #[tokio::test]
    async fn test_resolve_rejects_tampered_token() {
        let auth = authenticator();
        let sid = auth.begin_session(&state(7)).await.unwrap();

        let mut tampered = sid.as_str().to_string();
        let last = if tampered.ends_with('A') { "B" } else { "A" };
        tampered.replace_range(tampered.len() - 1.., last);

        let err = auth.resolve(&tampered).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidSignature | AuthError::Malformed));
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn test_resolve_rejects_garbage() {
        let auth = authenticator();
        assert_eq!(auth.resolve("garbage").await, Err(AuthError::Malformed));
    }

    #[tokio::test]
    async fn test_end_session_then_resolve_is_not_found() {
        let auth = authenticator();
        let sid = auth.begin_session(&state(7)).await.unwrap();

        let headers = headers_with(&format!("Bearer {}", sid.as_str()));
        auth.end_session(&headers).await.unwrap();

        assert_eq!(
            auth.authenticate(&headers, None).await,
            Err(AuthError::StateNotFound)
        );
    }

    #[tokio::test]
    async fn test_authenticate_without_token() {
        let auth = authenticator();
        assert_eq!(
            auth.authenticate(&HeaderMap::new(), None).await,
            Err(AuthError::MissingToken)
        );
    }

    #[tokio::test]
    async fn test_update_session_replaces_state() {
        let auth = authenticator();
        let sid = auth.begin_session(&state(7)).await.unwrap();

        let mut updated = state(7);
        updated.user.first_name = "Augusta".to_string();
        auth.update_session(&sid, &updated).await.unwrap();

        let (_, resolved) = auth.resolve(sid.as_str()).await.unwrap();
        assert_eq!(resolved.user.first_name, "Augusta");
    }

    #[test]
    fn test_store_errors_are_not_unauthorized() {
        assert!(!AuthError::StoreUnavailable("down".into()).is_unauthorized());
        assert!(!AuthError::Issue("no entropy".into()).is_unauthorized());
    }
}
