//! Reverse proxy for backend route classes.
//!
//! A [`ProxyDirector`] owns the targets of one route class (messaging,
//! summary). For each request it:
//!
//! 1. resolves the caller's session, if the request carries a token
//! 2. sets the `X-User` header to the caller's [`UserSnapshot`] JSON, or
//!    removes any client-supplied `X-User` when there is no session
//! 3. picks the next target round-robin and rewrites the URL to it
//!
//! Session store failures do not reject the request. It is forwarded
//! without identity and the backend decides whether that is acceptable.
//!
//! [`ReverseProxy`] pairs a director with an HTTP client and performs the
//! forwarding itself.
//!
//! [`UserSnapshot`]: crate::types::UserSnapshot

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::{bearer_token, AuthError, Authenticator};
use crate::error::ServerError;

/// Header carrying the caller's identity to backends.
pub const USER_HEADER: &str = "x-user";

/// Largest request body forwarded to a backend.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Errors from proxy construction and forwarding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// A route class was configured without targets.
    #[error("no proxy targets configured")]
    NoTargets,

    /// A target URL is unusable.
    #[error("invalid proxy target {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    /// The request body could not be read.
    #[error("failed to read request body: {0}")]
    Body(String),

    /// The backend could not be reached or its response could not be read.
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

/// Parses a backend base URL, accepting only `http` and `https`.
///
/// # Errors
///
/// Returns [`ProxyError::InvalidTarget`] if the URL does not parse, has
/// another scheme, or has no host.
pub fn parse_target(raw: &str) -> Result<Url, ProxyError> {
    let invalid = |reason: &str| ProxyError::InvalidTarget {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw.trim()).map_err(|err| invalid(&err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

/// Selects targets and attaches caller identity for one route class.
///
/// Cloning is cheap; clones share the round-robin counter.
#[derive(Debug, Clone)]
pub struct ProxyDirector {
    targets: Arc<[Url]>,
    counter: Arc<AtomicUsize>,
    auth: Authenticator,
}

impl ProxyDirector {
    /// Creates a director over an ordered, non-empty list of targets.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NoTargets`] if `targets` is empty.
    pub fn new(targets: Vec<Url>, auth: Authenticator) -> Result<Self, ProxyError> {
        if targets.is_empty() {
            return Err(ProxyError::NoTargets);
        }
        Ok(Self {
            targets: targets.into(),
            counter: Arc::new(AtomicUsize::new(0)),
            auth,
        })
    }

    pub fn targets(&self) -> &[Url] {
        &self.targets
    }

    /// Returns the next target. Every call advances the rotation.
    pub fn next_target(&self) -> &Url {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        &self.targets[index]
    }

    /// Rewrites `parts` for forwarding and returns the outbound URL.
    ///
    /// Method, path, query and body are left untouched; only the identity
    /// header changes.
    pub async fn direct(&self, parts: &mut Parts) -> Url {
        match self.identity(&parts.headers).await {
            Some(value) => {
                parts.headers.insert(HeaderName::from_static(USER_HEADER), value);
            }
            None => {
                parts.headers.remove(USER_HEADER);
            }
        }

        let mut url = self.next_target().clone();
        url.set_path(parts.uri.path());
        url.set_query(parts.uri.query());
        url
    }

    async fn identity(&self, headers: &HeaderMap) -> Option<HeaderValue> {
        let token = bearer_token(headers, None)?;
        let (_, state) = match self.auth.resolve(&token).await {
            Ok(resolved) => resolved,
            Err(AuthError::StoreUnavailable(message)) => {
                warn!(error = %message, "Session store unavailable, forwarding without identity");
                return None;
            }
            Err(err) => {
                debug!(error = %err, "Forwarding without identity");
                return None;
            }
        };

        let json = serde_json::to_string(&state.user).ok()?;
        HeaderValue::from_str(&json).ok()
    }
}

/// Forwards requests to the targets chosen by a [`ProxyDirector`].
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    director: ProxyDirector,
    client: reqwest::Client,
}

impl ReverseProxy {
    pub fn new(director: ProxyDirector, client: reqwest::Client) -> Self {
        Self { director, client }
    }

    pub fn director(&self) -> &ProxyDirector {
        &self.director
    }

    /// Forwards `request` and converts the outcome into a response.
    ///
    /// Upstream failures become `502 Bad Gateway`.
    pub async fn handle(&self, request: Request<Body>) -> Response {
        match self.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "Proxy request failed");
                ServerError::from(err).into_response()
            }
        }
    }

    /// Forwards `request` to the next target.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::Body`] if the request body cannot be read
    /// - [`ProxyError::Upstream`] if the backend cannot be reached
    pub async fn forward(&self, request: Request<Body>) -> Result<Response, ProxyError> {
        let client_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let (mut parts, body) = request.into_parts();
        let url = self.director.direct(&mut parts).await;

        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|err| ProxyError::Body(err.to_string()))?;

        let mut headers = outbound_headers(&parts.headers);
        if let Some(ip) = client_addr {
            append_forwarded_for(&mut headers, &ip.to_string());
        }

        debug!(
            method = %parts.method,
            host = url.host_str().unwrap_or_default(),
            path = url.path(),
            "Forwarding request"
        );

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| ProxyError::Upstream(err.to_string()))?;

        let status = upstream.status();
        let response_headers = inbound_headers(upstream.headers());
        let bytes: Bytes = upstream
            .bytes()
            .await
            .map_err(|err| ProxyError::Upstream(err.to_string()))?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copies every end-to-end header, keeping repeated values.
fn end_to_end(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn outbound_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = end_to_end(headers);
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);
    out
}

fn inbound_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = end_to_end(headers);
    out.remove(header::CONTENT_LENGTH);
    out
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: &str) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
        _ => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }
}
