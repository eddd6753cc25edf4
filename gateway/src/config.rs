//! Gateway configuration module.
//!
//! Parses configuration from environment variables for the Portico gateway.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORTICO_SESSION_KEY` | Yes | - | Secret used to sign session tokens |
//! | `PORTICO_REDIS_URL` | Yes | - | Redis URL for sessions and the broker stream |
//! | `PORTICO_MESSAGES_ADDRS` | Yes | - | Comma-separated messaging backend URLs |
//! | `PORTICO_SUMMARY_ADDRS` | Yes | - | Comma-separated summary backend URLs |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `PORTICO_SESSION_TTL_SECS` | No | 3600 | Sliding session lifetime |
//! | `PORTICO_BROKER_STREAM` | No | `messages` | Broker stream name |
//! | `PORTICO_BROKER_GROUP` | No | `gateway` | Broker consumer group |
//! | `PORTICO_BROKER_CONSUMER` | No | host name | Consumer name within the group |
//! | `PORTICO_WRITE_TIMEOUT_MS` | No | 5000 | Bound on each WebSocket write |
//! | `PORTICO_OUTBOUND_QUEUE` | No | 64 | Per-connection outbound queue size |
//! | `PORTICO_BCRYPT_COST` | No | 12 | Password hashing cost |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

use crate::proxy::parse_target;
use crate::sid::SessionKey;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
const DEFAULT_BROKER_STREAM: &str = "messages";
const DEFAULT_BROKER_GROUP: &str = "gateway";
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_OUTBOUND_QUEUE: usize = 64;
const DEFAULT_BCRYPT_COST: u32 = 12;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Gateway configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Key signing session tokens.
    pub session_key: SessionKey,

    /// Redis connection URL.
    pub redis_url: String,

    /// Messaging service targets, in round-robin order.
    pub messages_addrs: Vec<Url>,

    /// Summary service targets, in round-robin order.
    pub summary_addrs: Vec<Url>,

    /// Sliding session lifetime.
    pub session_ttl: Duration,

    pub broker_stream: String,
    pub broker_group: String,
    pub broker_consumer: String,

    /// Bound on each WebSocket write before the connection is dropped.
    pub write_timeout: Duration,

    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,

    pub bcrypt_cost: u32,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A required environment variable is missing or empty
    /// - A value has an invalid format, including backend URLs that are not
    ///   `http` or `https`
    /// - Port number is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use portico_gateway::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Gateway will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let session_key = SessionKey::new(required_var("PORTICO_SESSION_KEY")?);
        let redis_url = required_var("PORTICO_REDIS_URL")?;
        let messages_addrs = parse_targets("PORTICO_MESSAGES_ADDRS")?;
        let summary_addrs = parse_targets("PORTICO_SUMMARY_ADDRS")?;

        let session_ttl = Duration::from_secs(parse_number_env(
            "PORTICO_SESSION_TTL_SECS",
            DEFAULT_SESSION_TTL_SECS,
        )?);
        let write_timeout = Duration::from_millis(parse_number_env(
            "PORTICO_WRITE_TIMEOUT_MS",
            DEFAULT_WRITE_TIMEOUT_MS,
        )?);
        let outbound_queue = parse_number_env("PORTICO_OUTBOUND_QUEUE", DEFAULT_OUTBOUND_QUEUE)?;
        let bcrypt_cost = parse_number_env("PORTICO_BCRYPT_COST", DEFAULT_BCRYPT_COST)?;

        let broker_stream =
            optional_var("PORTICO_BROKER_STREAM").unwrap_or_else(|| DEFAULT_BROKER_STREAM.into());
        let broker_group =
            optional_var("PORTICO_BROKER_GROUP").unwrap_or_else(|| DEFAULT_BROKER_GROUP.into());
        let broker_consumer = optional_var("PORTICO_BROKER_CONSUMER").unwrap_or_else(|| {
            gethostname::gethostname()
                .into_string()
                .unwrap_or_else(|_| "portico-gateway".to_string())
        });

        let config = Self {
            port,
            session_key,
            redis_url,
            messages_addrs,
            summary_addrs,
            session_ttl,
            broker_stream,
            broker_group,
            broker_consumer,
            write_timeout,
            outbound_queue,
            bcrypt_cost,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges that parsing alone does not catch.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.session_key.is_empty() {
            return Err(ConfigError::MissingEnvVar(
                "PORTICO_SESSION_KEY".to_string(),
            ));
        }

        if self.session_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "PORTICO_SESSION_TTL_SECS must be greater than zero".to_string(),
            ));
        }

        if self.write_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "PORTICO_WRITE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        if self.outbound_queue == 0 {
            return Err(ConfigError::ValidationError(
                "PORTICO_OUTBOUND_QUEUE must be greater than zero".to_string(),
            ));
        }

        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(ConfigError::ValidationError(
                "PORTICO_BCRYPT_COST must be between 4 and 31".to_string(),
            ));
        }

        if self.broker_consumer.is_empty() {
            return Err(ConfigError::ValidationError(
                "broker consumer name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Returns the trimmed value of `name`, treating empty as unset.
fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required_var(name: &str) -> Result<String, ConfigError> {
    optional_var(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a numeric environment variable, falling back to `default` when unset.
fn parse_number_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("'{raw}': {err}"),
        }),
        None => Ok(default),
    }
}

/// Parse a comma-separated list of backend base URLs.
///
/// Blank entries are skipped; at least one URL is required.
fn parse_targets(name: &str) -> Result<Vec<Url>, ConfigError> {
    let raw = required_var(name)?;

    let targets = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            parse_target(entry).map_err(|err| ConfigError::InvalidFormat {
                var: name.to_string(),
                message: err.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if targets.is_empty() {
        return Err(ConfigError::MissingEnvVar(name.to_string()));
    }
    Ok(targets)
}
