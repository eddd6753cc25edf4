//! Portico Gateway - Main entry point.
//!
//! This binary starts the gateway with:
//! - Structured JSON logging for production
//! - Redis-backed sessions and broker stream
//! - The broadcast hub on its own task
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`portico_gateway::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! PORTICO_SESSION_KEY="change-me" \
//! PORTICO_REDIS_URL="redis://127.0.0.1:6379" \
//! PORTICO_MESSAGES_ADDRS="http://messages-1:80,http://messages-2:80" \
//! PORTICO_SUMMARY_ADDRS="http://summary:80" \
//! PORT=8080 \
//! cargo run --release --bin portico-gateway
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use portico_gateway::auth::Authenticator;
use portico_gateway::broker::{RedisStreamSource, StreamSettings};
use portico_gateway::config::Config;
use portico_gateway::directory::MemoryDirectory;
use portico_gateway::hub::BroadcastHub;
use portico_gateway::proxy::{ProxyDirector, ReverseProxy};
use portico_gateway::redis_cache::RedisCache;
use portico_gateway::registry::ConnectionRegistry;
use portico_gateway::routes::{create_router, AppState};
use portico_gateway::session::SessionStore;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  PORTICO_SESSION_KEY      - Secret signing session tokens");
            eprintln!("  PORTICO_REDIS_URL        - Redis URL for sessions and the broker");
            eprintln!("  PORTICO_MESSAGES_ADDRS   - Comma-separated messaging service URLs");
            eprintln!("  PORTICO_SUMMARY_ADDRS    - Comma-separated summary service URLs");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                     - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                 - Log level filter (default: info)");
            eprintln!("  PORTICO_SESSION_TTL_SECS - Sliding session lifetime (default: 3600)");
            eprintln!("  PORTICO_BROKER_STREAM    - Broker stream name (default: messages)");
            eprintln!("  PORTICO_BROKER_GROUP     - Consumer group (default: gateway)");
            eprintln!("  PORTICO_BROKER_CONSUMER  - Consumer name (default: host name)");
            eprintln!("  PORTICO_WRITE_TIMEOUT_MS - WebSocket write bound (default: 5000)");
            eprintln!("  PORTICO_OUTBOUND_QUEUE   - Per-connection queue size (default: 64)");
            eprintln!("  PORTICO_BCRYPT_COST      - Password hashing cost (default: 12)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        messages_targets = config.messages_addrs.len(),
        summary_targets = config.summary_addrs.len(),
        session_ttl_secs = config.session_ttl.as_secs(),
        broker_stream = %config.broker_stream,
        broker_consumer = %config.broker_consumer,
        "Portico gateway starting"
    );

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "Gateway stopped with an error");
            ExitCode::from(1)
        }
    }
}

/// Connects the backing services, starts the hub and serves until a
/// shutdown signal arrives.
async fn run(config: Config) -> anyhow::Result<()> {
    let redis = redis::Client::open(config.redis_url.as_str()).context("invalid Redis URL")?;

    // Stream reads block, so the broker gets its own connection.
    let cache_conn = ConnectionManager::new(redis.clone())
        .await
        .context("failed to connect to Redis for the session cache")?;
    let broker_conn = ConnectionManager::new(redis)
        .await
        .context("failed to connect to Redis for the broker")?;
    info!("Connected to Redis");

    let store = SessionStore::new(Arc::new(RedisCache::new(cache_conn)), config.session_ttl);
    let auth = Authenticator::new(config.session_key.clone(), store);

    let mut source = RedisStreamSource::new(
        broker_conn,
        StreamSettings {
            stream: config.broker_stream.clone(),
            group: config.broker_group.clone(),
            consumer: config.broker_consumer.clone(),
        },
    );
    source
        .ensure_group()
        .await
        .context("failed to set up the broker consumer group")?;

    let directory = Arc::new(
        MemoryDirectory::new(config.bcrypt_cost).context("failed to create user directory")?,
    );

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build proxy HTTP client")?;
    let messages = ReverseProxy::new(
        ProxyDirector::new(config.messages_addrs.clone(), auth.clone())?,
        http.clone(),
    );
    let summary = ReverseProxy::new(
        ProxyDirector::new(config.summary_addrs.clone(), auth.clone())?,
        http,
    );

    let registry = ConnectionRegistry::new();
    let hub_handle = BroadcastHub::new(registry.clone()).spawn(source);
    info!("Broadcast hub started");

    let state = AppState::new(auth, directory, registry, messages, summary)
        .with_connection_limits(config.write_timeout, config.outbound_queue);
    let app = create_router(state);

    // Bind to address
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(port = config.port, address = %bind_addr, "Server listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    info!("Server shutting down gracefully");
    hub_handle.abort();
    info!("Broadcast hub stopped");

    served.context("server error")
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGTERM or SIGINT (Ctrl+C) is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
