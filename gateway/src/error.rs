//! Error types for the Portico gateway.
//!
//! Each component defines its own error enum next to the code that
//! produces it. This module defines [`ServerError`], the top-level error
//! returned by HTTP handlers, and its mapping onto responses.
//!
//! # Response mapping
//!
//! | Variant | Status | `code` |
//! |---------|--------|--------|
//! | `Auth` | 401 | `unauthorized` |
//! | `Forbidden` | 403 | `forbidden` |
//! | `NotFound` | 404 | `not_found` |
//! | `Conflict` | 409 | `conflict` |
//! | `Validation` | 400 | `invalid_request` |
//! | `Store` | 500 | `store_unavailable` |
//! | `Upstream` | 502 | `bad_gateway` |
//! | `Internal`, `Config` | 500 | `internal_error` |
//!
//! Every error body is `{"error": "...", "code": "..."}`.

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::proxy::ProxyError;

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Top-level error type for the Portico gateway.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during startup.
    Config(ConfigError),

    /// The caller is not authenticated.
    Auth(String),

    /// The caller is authenticated but may not do this.
    Forbidden(String),

    /// The requested resource does not exist.
    NotFound(String),

    /// The request conflicts with existing state, e.g. a taken email.
    Conflict(String),

    /// The request is malformed or fails validation.
    Validation(String),

    /// The session store could not be reached.
    Store(String),

    /// A backend service failed.
    Upstream(String),

    /// Unexpected internal failure.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Store(msg) => write!(f, "session store error: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::StoreUnavailable(msg) => Self::Store(msg),
            AuthError::Issue(msg) => Self::Internal(msg),
            other => Self::Auth(other.to_string()),
        }
    }
}

impl From<DirectoryError> for ServerError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound => Self::NotFound(err.to_string()),
            DirectoryError::Duplicate(_) => Self::Conflict(err.to_string()),
            DirectoryError::InvalidCredentials => Self::Auth(err.to_string()),
            DirectoryError::Validation(msg) => Self::Validation(msg),
            DirectoryError::Hash(msg) => Self::Internal(msg),
        }
    }
}

impl From<ProxyError> for ServerError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Body(msg) => Self::Validation(msg),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl ServerError {
    /// Creates a new authentication error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use portico_gateway::error::ServerError;
    ///
    /// let err = ServerError::auth("session expired");
    /// assert!(matches!(err, ServerError::Auth(_)));
    /// ```
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a new validation error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use portico_gateway::error::ServerError;
    ///
    /// let err = ServerError::validation("query parameter q is required");
    /// assert!(matches!(err, ServerError::Validation(_)));
    /// ```
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) | Self::Internal(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the machine-readable `code` of the error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "invalid_request",
            Self::Store(_) => "store_unavailable",
            Self::Upstream(_) => "bad_gateway",
            Self::Internal(_) | Self::Config(_) => "internal_error",
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }

    /// Message shown to clients. Server-side details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            Self::Auth(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg)
            | Self::Validation(msg) => msg.clone(),
            Self::Store(_) => "session store unavailable".to_string(),
            Self::Upstream(_) => "bad gateway".to_string(),
            Self::Internal(_) | Self::Config(_) => "internal server error".to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = ErrorResponse::new(self.public_message()).with_code(self.code());
        (self.status(), Json(body)).into_response()
    }
}

/// A specialized Result type for gateway handlers.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_auth_displays_correctly() {
        let err = ServerError::auth("invalid token");
        assert_eq!(err.to_string(), "authentication failed: invalid token");
    }

    #[test]
    fn server_error_config_displays_correctly() {
        let err = ServerError::Config(ConfigError::MissingEnvVar("PORTICO_SESSION_KEY".into()));
        assert_eq!(
            err.to_string(),
            "configuration error: missing required environment variable: PORTICO_SESSION_KEY"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn status_mapping() {
        let cases = [
            (ServerError::auth("x"), StatusCode::UNAUTHORIZED),
            (ServerError::forbidden("x"), StatusCode::FORBIDDEN),
            (ServerError::not_found("x"), StatusCode::NOT_FOUND),
            (ServerError::Conflict("x".into()), StatusCode::CONFLICT),
            (ServerError::validation("x"), StatusCode::BAD_REQUEST),
            (ServerError::Store("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (ServerError::Upstream("x".into()), StatusCode::BAD_GATEWAY),
            (ServerError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn auth_errors_map_by_kind() {
        assert!(matches!(
            ServerError::from(AuthError::InvalidSignature),
            ServerError::Auth(_)
        ));
        assert!(matches!(
            ServerError::from(AuthError::StateNotFound),
            ServerError::Auth(_)
        ));
        assert!(matches!(
            ServerError::from(AuthError::StoreUnavailable("down".into())),
            ServerError::Store(_)
        ));
    }

    #[test]
    fn directory_errors_map_by_kind() {
        assert!(matches!(
            ServerError::from(DirectoryError::NotFound),
            ServerError::NotFound(_)
        ));
        assert!(matches!(
            ServerError::from(DirectoryError::Duplicate("email".into())),
            ServerError::Conflict(_)
        ));
        assert!(matches!(
            ServerError::from(DirectoryError::InvalidCredentials),
            ServerError::Auth(_)
        ));
        assert!(matches!(
            ServerError::from(DirectoryError::Validation("bad".into())),
            ServerError::Validation(_)
        ));
    }

    #[test]
    fn client_and_server_error_classification() {
        assert!(ServerError::auth("x").is_client_error());
        assert!(ServerError::validation("x").is_client_error());
        assert!(!ServerError::internal("x").is_client_error());
        assert!(ServerError::Store("x".into()).is_server_error());
        assert!(ServerError::Upstream("x".into()).is_server_error());
    }

    #[tokio::test]
    async fn into_response_hides_server_details() {
        let response = ServerError::Store("redis://secret@host refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "session store unavailable");
        assert_eq!(json["code"], "store_unavailable");
    }

    #[tokio::test]
    async fn into_response_shows_client_message() {
        let response = ServerError::validation("query parameter q is required").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "query parameter q is required");
        assert_eq!(json["code"], "invalid_request");
    }
}
