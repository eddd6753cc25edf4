//! Broker-driven broadcast hub.
//!
//! The hub is a single long-lived task that drains a [`MessageSource`] and
//! fans each event out to live connections in the [`ConnectionRegistry`].
//!
//! # Delivery policy
//!
//! - A message is acknowledged only after its fan-out attempt completes,
//!   so a crash mid-fan-out leads to redelivery. Clients may therefore see
//!   the same event twice.
//! - A message that is not a valid [`BroadcastEvent`] is acknowledged and
//!   dropped. Retrying cannot make it valid.
//! - Sends never wait on a client. A connection whose outbound queue is
//!   full or closed is evicted and closed; the error stays local to that
//!   connection.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::broker::MessageSource;
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Field naming the target users of an event.
pub const TARGETS_FIELD: &str = "userIDs";

/// Reasons a broker message is not a valid event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event body is not UTF-8")]
    NotUtf8,

    #[error("event body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("event body is not a JSON object")]
    NotAnObject,

    #[error("invalid userIDs: {0}")]
    InvalidTargets(String),
}

/// An event to push to connected clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEvent {
    /// Users to deliver to, or `None` for every live connection.
    pub targets: Option<BTreeSet<i64>>,

    /// Compact JSON text sent to each recipient.
    pub payload: Arc<str>,
}

impl BroadcastEvent {
    /// Parses a broker message body.
    ///
    /// `userIDs` may be an object whose values are user IDs (keys are
    /// ignored) or an array of user IDs. A missing or `null` `userIDs`
    /// addresses every connection. The payload is the body with
    /// insignificant whitespace removed; every other byte, including
    /// number literals and field order, is forwarded as received.
    ///
    /// # Errors
    ///
    /// Returns an [`EventError`] if the body is not a JSON object or
    /// `userIDs` has any other shape.
    pub fn parse(body: &[u8]) -> Result<Self, EventError> {
        let text = std::str::from_utf8(body).map_err(|_| EventError::NotUtf8)?;
        let raw: &RawValue =
            serde_json::from_str(text).map_err(|err| EventError::InvalidJson(err.to_string()))?;
        if !raw.get().trim_start().starts_with('{') {
            return Err(EventError::NotAnObject);
        }

        let envelope: Envelope = serde_json::from_str(raw.get())
            .map_err(|err| EventError::InvalidTargets(err.to_string()))?;
        let targets = match envelope.targets {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(collect_ids(map.values())?),
            Some(Value::Array(items)) => Some(collect_ids(items.iter())?),
            Some(other) => {
                return Err(EventError::InvalidTargets(format!(
                    "expected object or array, got {other}"
                )))
            }
        };

        Ok(Self {
            targets,
            payload: Arc::from(minify(raw.get())),
        })
    }
}

/// The only field the hub reads from an event.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "userIDs", default)]
    targets: Option<Value>,
}

fn collect_ids<'a>(values: impl Iterator<Item = &'a Value>) -> Result<BTreeSet<i64>, EventError> {
    values
        .map(|value| {
            value
                .as_i64()
                .ok_or_else(|| EventError::InvalidTargets(format!("{value} is not a user ID")))
        })
        .collect()
}

/// Drops whitespace outside string literals of already validated JSON.
fn minify(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in json.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
            out.push(c);
        } else if !matches!(c, ' ' | '\t' | '\n' | '\r') {
            out.push(c);
        }
    }
    out
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Connections the payload was queued for.
    pub delivered: usize,

    /// Connections evicted because they could not accept the payload.
    pub evicted: usize,
}

/// Fans broker events out to registered connections.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    registry: ConnectionRegistry,
}

impl BroadcastHub {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Queues `event` for its recipients without waiting on any of them.
    pub fn dispatch(&self, event: &BroadcastEvent) -> FanoutReport {
        let recipients: Vec<ConnectionHandle> = match &event.targets {
            Some(targets) => targets
                .iter()
                .filter_map(|user_id| self.registry.lookup(*user_id))
                .collect(),
            None => self.registry.snapshot(),
        };

        let mut report = FanoutReport::default();
        for conn in recipients {
            match conn.try_send(Arc::clone(&event.payload)) {
                Ok(()) => {
                    trace!(user_id = conn.user_id(), "Event queued");
                    report.delivered += 1;
                }
                Err(err) => {
                    warn!(
                        user_id = conn.user_id(),
                        connection_id = conn.id(),
                        error = %err,
                        "Evicting connection that cannot accept events"
                    );
                    self.registry.evict(&conn);
                    report.evicted += 1;
                }
            }
        }
        report
    }

    /// Consumes `source` until it is exhausted.
    ///
    /// Every delivery is acknowledged after it has been handled, whether it
    /// was fanned out or dropped as malformed.
    pub async fn run<S: MessageSource>(&self, mut source: S) {
        info!("Broadcast hub started");

        while let Some(delivery) = source.next_delivery().await {
            match BroadcastEvent::parse(&delivery.body) {
                Ok(event) => {
                    let report = self.dispatch(&event);
                    debug!(
                        tag = %delivery.tag,
                        delivered = report.delivered,
                        evicted = report.evicted,
                        addressed = event.targets.is_some(),
                        "Event fanned out"
                    );
                }
                Err(err) => {
                    warn!(tag = %delivery.tag, error = %err, "Dropping malformed event");
                }
            }

            if let Err(err) = source.ack(&delivery.tag).await {
                warn!(tag = %delivery.tag, error = %err, "Failed to acknowledge event");
            }
        }

        info!("Broadcast hub stopped, message source exhausted");
    }

    /// Runs the hub on its own task.
    pub fn spawn<S: MessageSource + 'static>(self, source: S) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(source).await })
    }
}
