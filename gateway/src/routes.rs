//! HTTP route handlers for the Portico gateway.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /v1/users` - Sign up and begin a session
//! - `GET /v1/users?q=` - Search users by name prefix
//! - `GET|PATCH /v1/users/{id}` - Read or update a profile (`me` allowed)
//! - `POST /v1/sessions` - Sign in
//! - `DELETE /v1/sessions/mine` - Sign out
//! - `GET /v1/ws` - WebSocket push channel
//! - `/v1/channels`, `/v1/channels/*`, `/v1/messages/*` - Proxied to the
//!   messaging service
//! - `/v1/summary` - Proxied to the summary service
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - The [`Authenticator`] issuing and resolving sessions
//! - The user directory and its search index
//! - The connection registry the broadcast hub delivers into
//! - One reverse proxy per backend service
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use portico_gateway::auth::Authenticator;
//! use portico_gateway::cache::MemoryCache;
//! use portico_gateway::directory::MemoryDirectory;
//! use portico_gateway::proxy::{parse_target, ProxyDirector, ReverseProxy};
//! use portico_gateway::registry::ConnectionRegistry;
//! use portico_gateway::routes::{create_router, AppState};
//! use portico_gateway::session::SessionStore;
//! use portico_gateway::sid::SessionKey;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = SessionStore::new(Arc::new(MemoryCache::new()), Duration::from_secs(3600));
//!     let auth = Authenticator::new(SessionKey::new("secret"), store);
//!     let proxy = |raw: &str| {
//!         let director =
//!             ProxyDirector::new(vec![parse_target(raw).unwrap()], auth.clone()).unwrap();
//!         ReverseProxy::new(director, reqwest::Client::new())
//!     };
//!
//!     let state = AppState::new(
//!         auth.clone(),
//!         Arc::new(MemoryDirectory::new(12).unwrap()),
//!         ConnectionRegistry::new(),
//!         proxy("http://messages:80"),
//!         proxy("http://summary:80"),
//!     );
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, delete, get, post},
    Json, Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, info, trace, warn, Span};

use crate::auth::{Authenticator, SCHEME_BEARER};
use crate::directory::{Credentials, NewUser, SearchIndex, Updates, User, UserDirectory};
use crate::error::{Result, ServerError};
use crate::proxy::ReverseProxy;
use crate::registry::{ConnectionHandle, ConnectionRegistry, DEFAULT_OUTBOUND_CAPACITY};
use crate::sid::SessionId;
use crate::types::SessionState;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of users returned by a search.
pub const SEARCH_LIMIT: usize = 20;

/// The only session a caller may delete.
const OWN_SESSION: &str = "mine";

/// Alias for the caller's own user ID.
const OWN_USER: &str = "me";

/// Default bound on each WebSocket write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long browsers may cache a CORS preflight.
const CORS_MAX_AGE: Duration = Duration::from_secs(600);

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Issues and resolves sessions.
    pub auth: Authenticator,

    /// Account storage.
    pub directory: Arc<dyn UserDirectory>,

    /// Prefix search over user names.
    pub index: Arc<dyn SearchIndex>,

    /// Live push connections, shared with the broadcast hub.
    pub registry: ConnectionRegistry,

    /// Proxy to the messaging service.
    pub messages: ReverseProxy,

    /// Proxy to the summary service.
    pub summary: ReverseProxy,

    /// Bound on each WebSocket write.
    pub write_timeout: Duration,

    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state around a directory that also serves as
    /// the search index.
    #[must_use]
    pub fn new<D>(
        auth: Authenticator,
        directory: Arc<D>,
        registry: ConnectionRegistry,
        messages: ReverseProxy,
        summary: ReverseProxy,
    ) -> Self
    where
        D: UserDirectory + SearchIndex + 'static,
    {
        Self {
            auth,
            index: directory.clone(),
            directory,
            registry,
            messages,
            summary,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            start_time: Instant::now(),
        }
    }

    /// Sets the per-connection write bound and outbound queue capacity.
    #[must_use]
    pub fn with_connection_limits(mut self, write_timeout: Duration, capacity: usize) -> Self {
        self.write_timeout = write_timeout;
        self.outbound_capacity = capacity;
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("auth", &self.auth)
            .field("directory", &"<UserDirectory>")
            .field("registry", &self.registry)
            .field("messages", &self.messages)
            .field("summary", &self.summary)
            .field("write_timeout", &self.write_timeout)
            .field("outbound_capacity", &self.outbound_capacity)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// Every route carries the CORS policy and a request trace span.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/users", post(post_users).get(search_users))
        .route("/v1/users/{id}", get(get_user).patch(patch_user))
        .route("/v1/sessions", post(post_sessions))
        .route("/v1/sessions/{which}", delete(delete_session))
        .route("/v1/ws", get(get_ws))
        .route("/v1/channels", any(proxy_messages))
        .route("/v1/channels/{*rest}", any(proxy_messages))
        .route("/v1/messages/{*rest}", any(proxy_messages))
        .route("/v1/summary", any(proxy_summary))
        .route("/health", get(get_health))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Request span without the query string, which may carry a session token.
fn request_span(request: &Request<Body>) -> Span {
    debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        version = ?request.version(),
    )
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::PUT,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::AUTHORIZATION])
        .max_age(CORS_MAX_AGE)
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|err| ServerError::validation(format!("invalid request body: {err}")))
}

/// Responds `201 Created` with the user and the new session's token.
fn session_created(sid: &SessionId, user: &User) -> Result<Response> {
    let authorization = HeaderValue::from_str(&format!("{SCHEME_BEARER}{}", sid.as_str()))
        .map_err(|err| ServerError::internal(err.to_string()))?;

    Ok((
        StatusCode::CREATED,
        [(header::AUTHORIZATION, authorization)],
        Json(user.clone()),
    )
        .into_response())
}

// ============================================================================
// Sessions and users
// ============================================================================

/// POST /v1/users - Sign up.
///
/// # Responses
///
/// - `201 Created` - User JSON, token in the `Authorization` header
/// - `400 Bad Request` - Invalid sign-up data
/// - `409 Conflict` - Email or user name already taken
async fn post_users(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let new_user: NewUser = parse_json(&body)?;
    let user = state.directory.insert(new_user).await?;

    let sid = state
        .auth
        .begin_session(&SessionState::begin(user.snapshot()))
        .await?;

    info!(user_id = user.id, "User signed up");
    session_created(&sid, &user)
}

/// POST /v1/sessions - Sign in.
///
/// Unknown emails and wrong passwords get the same `401`.
async fn post_sessions(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let credentials: Credentials = parse_json(&body)?;
    let user = state.directory.authenticate(&credentials).await?;

    let sid = state
        .auth
        .begin_session(&SessionState::begin(user.snapshot()))
        .await?;

    info!(user_id = user.id, "User signed in");
    session_created(&sid, &user)
}

/// DELETE /v1/sessions/{which} - Sign out. Only `mine` is accepted.
async fn delete_session(
    State(state): State<AppState>,
    Path(which): Path<String>,
    headers: HeaderMap,
) -> Result<&'static str> {
    if which != OWN_SESSION {
        return Err(ServerError::forbidden("only your own session can be ended"));
    }

    state.auth.end_session(&headers).await?;
    Ok("signed out")
}

/// Resolves a `{id}` path segment against the caller.
fn user_id_param(raw: &str, caller: &SessionState) -> Result<i64> {
    if raw == OWN_USER {
        return Ok(caller.user.id);
    }
    raw.parse()
        .map_err(|_| ServerError::validation(format!("invalid user id: {raw}")))
}

/// GET /v1/users/{id} - Fetch a profile.
async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<User>> {
    let (_, session) = state.auth.authenticate(&headers, None).await?;
    let id = user_id_param(&id, &session)?;

    Ok(Json(state.directory.get_by_id(id).await?))
}

/// PATCH /v1/users/{id} - Update your own profile.
///
/// The updated identity is written back into the caller's session.
async fn patch_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<User>> {
    let (sid, session) = state.auth.authenticate(&headers, None).await?;
    let id = user_id_param(&id, &session)?;
    if id != session.user.id {
        return Err(ServerError::forbidden("you can only update your own profile"));
    }

    let updates: Updates = parse_json(&body)?;
    let user = state.directory.update(id, &updates).await?;

    let refreshed = SessionState {
        created_at: session.created_at,
        user: user.snapshot(),
    };
    state.auth.update_session(&sid, &refreshed).await?;

    Ok(Json(user))
}

/// Query parameters for user search.
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
}

/// GET /v1/users?q= - Up to [`SEARCH_LIMIT`] users whose names start with
/// `q`, ordered by user name.
async fn search_users(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>> {
    state.auth.authenticate(&headers, None).await?;

    let prefix = params.q.as_deref().map(str::trim).unwrap_or_default();
    if prefix.is_empty() {
        return Err(ServerError::validation("query parameter q is required"));
    }

    let mut users = Vec::new();
    for id in state.index.query(prefix, SEARCH_LIMIT) {
        match state.directory.get_by_id(id).await {
            Ok(user) => users.push(user),
            Err(err) => debug!(user_id = id, error = %err, "Skipping indexed user"),
        }
    }
    users.sort_by(|a, b| a.user_name.cmp(&b.user_name));

    Ok(Json(users))
}

// ============================================================================
// GET /v1/ws - WebSocket push channel
// ============================================================================

/// Query parameters for the WebSocket upgrade.
#[derive(Debug, Deserialize)]
pub struct WsQueryParams {
    /// Session token, used when no `Authorization` header is sent.
    pub auth: Option<String>,
}

/// GET /v1/ws - WebSocket push channel.
///
/// The session is validated before the upgrade. Once connected, the
/// server pushes broker events addressed to the caller as text frames.
/// Frames sent by the client are read and ignored.
///
/// # Responses
///
/// - `101 Switching Protocols` - Upgrade successful
/// - `401 Unauthorized` - Missing, invalid or expired session
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let (_, session) = state
        .auth
        .authenticate(&headers, params.auth.as_deref())
        .await?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let user_id = session.user.id;
    let (handle, outbound) = ConnectionHandle::channel(user_id, state.outbound_capacity);
    debug!(user_id, connection_id = handle.id(), "WebSocket client connecting");

    Ok(ws.on_upgrade(move |socket| {
        serve_connection(socket, state.registry, handle, outbound, state.write_timeout)
    }))
}

/// Runs one push connection until either side ends it.
async fn serve_connection(
    socket: WebSocket,
    registry: ConnectionRegistry,
    handle: ConnectionHandle,
    outbound: mpsc::Receiver<Arc<str>>,
    write_timeout: Duration,
) {
    let user_id = handle.user_id();
    let connection_id = handle.id();
    let (sink, stream) = socket.split();

    if let Some(previous) = registry.insert(handle.clone()) {
        info!(
            user_id,
            connection_id,
            replaced = previous.id(),
            "Replaced existing connection"
        );
    }
    info!(user_id, connection_id, "WebSocket client connected");

    let writer = tokio::spawn(write_pump(sink, outbound, handle.clone(), write_timeout));
    read_pump(stream, &handle).await;

    if registry.evict(&handle) {
        debug!(user_id, connection_id, "Connection removed from registry");
    }
    if let Err(err) = writer.await {
        warn!(user_id, connection_id, error = %err, "WebSocket writer task failed");
    }

    info!(user_id, connection_id, "WebSocket client disconnected");
}

/// Drains the outbound queue onto the socket, one bounded write at a time.
///
/// Closes the connection on the first failed or timed-out write.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    handle: ConnectionHandle,
    write_timeout: Duration,
) {
    let cancel = handle.cancelled();

    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let frame = Message::Text(message.as_ref().to_owned().into());
        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => trace!(connection_id = handle.id(), "Pushed event"),
            Ok(Err(err)) => {
                debug!(connection_id = handle.id(), error = %err, "WebSocket write failed");
                break;
            }
            Err(_) => {
                warn!(
                    user_id = handle.user_id(),
                    connection_id = handle.id(),
                    timeout_ms = write_timeout.as_millis() as u64,
                    "WebSocket write timed out"
                );
                break;
            }
        }
    }

    handle.close();
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

/// Consumes client frames in order until close, error, end of stream, or
/// the connection is closed elsewhere.
async fn read_pump(mut stream: SplitStream<WebSocket>, handle: &ConnectionHandle) {
    let cancel = handle.cancelled();

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Close(_))) => {
                debug!(connection_id = handle.id(), "WebSocket client sent close frame");
                break;
            }
            Some(Ok(_)) => {
                trace!(connection_id = handle.id(), "Ignoring client frame");
            }
            Some(Err(err)) => {
                debug!(connection_id = handle.id(), error = %err, "WebSocket read failed");
                break;
            }
            None => {
                debug!(connection_id = handle.id(), "WebSocket stream ended");
                break;
            }
        }
    }
}

// ============================================================================
// Proxied routes
// ============================================================================

async fn proxy_messages(State(state): State<AppState>, request: Request<Body>) -> Response {
    state.messages.handle(request).await
}

async fn proxy_summary(State(state): State<AppState>, request: Request<Body>) -> Response {
    state.summary.handle(request).await
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live push connections.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.registry.len(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
