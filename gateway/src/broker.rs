//! Message broker consumption.
//!
//! The hub reads events through the [`MessageSource`] trait: a stream of
//! [`Delivery`] values, each acknowledged explicitly once handled. A
//! delivery that is never acknowledged is delivered again after a restart.
//!
//! [`RedisStreamSource`] is the production source. The queue is a Redis
//! stream read through a consumer group, so entries survive gateway
//! restarts and stay pending until `XACK`. Producers append entries with a
//! single `payload` field holding the event JSON:
//!
//! ```text
//! XADD messages * payload '{"userIDs":{"x":7},"msg":"hi"}'
//! ```
//!
//! [`MemoryQueue`] is an in-process source for tests and local wiring. It
//! remembers only the most recent [`ACK_LOG_CAPACITY`] acknowledgements.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Stream entry field carrying the event body.
pub const PAYLOAD_FIELD: &str = "payload";

/// Entries fetched per read.
const READ_BATCH: usize = 32;

/// How long one read blocks waiting for new entries.
const READ_BLOCK: Duration = Duration::from_millis(250);

/// Pause after a failed read before trying again.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Acknowledgements a [`MemoryQueue`] remembers before dropping the oldest.
pub const ACK_LOG_CAPACITY: usize = 1024;

/// Errors from a message source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker rejected a command or could not be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Unavailable(err.to_string())
    }
}

/// One message handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Identifies the message when acknowledging it.
    pub tag: String,

    /// Raw message body.
    pub body: Vec<u8>,
}

/// A queue of deliveries with explicit acknowledgement.
#[async_trait]
pub trait MessageSource: Send {
    /// Waits for the next delivery. `None` means the source is exhausted
    /// and will never produce again.
    async fn next_delivery(&mut self) -> Option<Delivery>;

    /// Marks the delivery with `tag` as consumed.
    async fn ack(&mut self, tag: &str) -> Result<(), BrokerError>;
}

// ============================================================================
// Redis streams
// ============================================================================

/// Names identifying a consumer within a stream's consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub stream: String,
    pub group: String,
    /// Must stay stable across restarts for pending entries to be
    /// redelivered to this consumer.
    pub consumer: String,
}

/// Consumes a Redis stream through a consumer group.
///
/// On start the consumer first replays its own pending entries (read but
/// never acknowledged before a crash), then waits for new ones.
pub struct RedisStreamSource {
    conn: ConnectionManager,
    settings: StreamSettings,
    /// Position within the pending list, or `None` once it is drained.
    pending_cursor: Option<String>,
    buffer: VecDeque<Delivery>,
}

impl RedisStreamSource {
    /// Creates a source over its own connection.
    ///
    /// Reads block, so the connection should not be shared with latency
    /// sensitive callers such as the session cache.
    pub fn new(conn: ConnectionManager, settings: StreamSettings) -> Self {
        Self {
            conn,
            settings,
            pending_cursor: Some("0".to_string()),
            buffer: VecDeque::new(),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Creates the stream and consumer group if they do not exist yet.
    ///
    /// A new group starts at the beginning of the stream, so entries
    /// appended before the first gateway started are still delivered.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unavailable`] for any failure other than the
    /// group already existing.
    pub async fn ensure_group(&mut self) -> Result<(), BrokerError> {
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.settings.stream)
            .arg(&self.settings.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.settings.stream,
                    group = %self.settings.group,
                    "Created broker consumer group"
                );
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_batch(&mut self) -> Result<(), BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.settings.group)
            .arg(&self.settings.consumer)
            .arg("COUNT")
            .arg(READ_BATCH);

        let start = match &self.pending_cursor {
            Some(cursor) => cursor.clone(),
            None => {
                cmd.arg("BLOCK").arg(READ_BLOCK.as_millis() as u64);
                ">".to_string()
            }
        };
        cmd.arg("STREAMS").arg(&self.settings.stream).arg(&start);

        let reply: Option<StreamReadReply> = match cmd.query_async(&mut self.conn).await {
            Ok(reply) => reply,
            Err(err) if err.code() == Some("NOGROUP") => {
                warn!(stream = %self.settings.stream, "Consumer group missing, recreating");
                self.ensure_group().await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let entries: Vec<_> = reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default();

        if let Some(cursor) = self.pending_cursor.as_mut() {
            match entries.last() {
                Some(last) => *cursor = last.id.clone(),
                None => {
                    debug!(stream = %self.settings.stream, "Pending entries replayed");
                    self.pending_cursor = None;
                }
            }
        }

        for entry in entries {
            // Entries trimmed while pending come back without fields.
            let body: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
            trace!(tag = %entry.id, bytes = body.len(), "Stream entry received");
            self.buffer.push_back(Delivery {
                tag: entry.id,
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for RedisStreamSource {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.buffer.pop_front() {
                return Some(delivery);
            }
            if let Err(err) = self.read_batch().await {
                warn!(error = %err, "Broker read failed, retrying");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }

    async fn ack(&mut self, tag: &str) -> Result<(), BrokerError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.settings.stream)
            .arg(&self.settings.group)
            .arg(tag)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }
}

/// Appends `payload` to `stream` in the format [`RedisStreamSource`] reads.
///
/// Returns the new entry ID.
///
/// # Errors
///
/// Returns [`BrokerError::Unavailable`] if the append fails.
pub async fn publish(
    conn: &mut ConnectionManager,
    stream: &str,
    payload: &[u8],
) -> Result<String, BrokerError> {
    let id: String = redis::cmd("XADD")
        .arg(stream)
        .arg("*")
        .arg(PAYLOAD_FIELD)
        .arg(payload)
        .query_async(conn)
        .await?;
    Ok(id)
}

// ============================================================================
// In-memory queue
// ============================================================================

/// Producing side of a [`MemoryQueue`].
#[derive(Debug, Clone)]
pub struct MemoryPublisher {
    tx: mpsc::UnboundedSender<Delivery>,
    next_tag: Arc<AtomicU64>,
    acked: Arc<Mutex<VecDeque<String>>>,
}

impl MemoryPublisher {
    /// Enqueues `body` and returns its delivery tag, or `None` if the
    /// consuming side has been dropped.
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Option<String> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        self.tx
            .send(Delivery {
                tag: tag.clone(),
                body: body.into(),
            })
            .ok()
            .map(|()| tag)
    }

    /// Tags acknowledged so far, in acknowledgement order.
    pub fn acked(&self) -> Vec<String> {
        self.ack_log().tags()
    }

    /// Returns a view of the acknowledgements that does not keep the queue
    /// open.
    pub fn ack_log(&self) -> AckLog {
        AckLog(Arc::clone(&self.acked))
    }
}

/// Acknowledged tags of a [`MemoryQueue`].
#[derive(Debug, Clone)]
pub struct AckLog(Arc<Mutex<VecDeque<String>>>);

impl AckLog {
    pub fn tags(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// In-process [`MessageSource`]. Exhausted once every publisher is dropped
/// and the queue is drained.
#[derive(Debug)]
pub struct MemoryQueue {
    rx: mpsc::UnboundedReceiver<Delivery>,
    acked: Arc<Mutex<VecDeque<String>>>,
}

impl MemoryQueue {
    /// Creates a connected publisher and queue.
    pub fn channel() -> (MemoryPublisher, MemoryQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let acked = Arc::new(Mutex::new(VecDeque::new()));
        let publisher = MemoryPublisher {
            tx,
            next_tag: Arc::new(AtomicU64::new(1)),
            acked: Arc::clone(&acked),
        };
        (publisher, MemoryQueue { rx, acked })
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    async fn ack(&mut self, tag: &str) -> Result<(), BrokerError> {
        let mut acked = self
            .acked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if acked.len() == ACK_LOG_CAPACITY {
            acked.pop_front();
        }
        acked.push_back(tag.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_queue_delivers_in_order() {
        let (publisher, mut queue) = MemoryQueue::channel();
        let first = publisher.publish("one").unwrap();
        let second = publisher.publish("two").unwrap();

        let a = queue.next_delivery().await.unwrap();
        let b = queue.next_delivery().await.unwrap();
        assert_eq!((a.tag, a.body), (first, b"one".to_vec()));
        assert_eq!((b.tag, b.body), (second, b"two".to_vec()));
    }

    #[tokio::test]
    async fn memory_queue_records_acks() {
        let (publisher, mut queue) = MemoryQueue::channel();
        let tag = publisher.publish("x").unwrap();

        let delivery = queue.next_delivery().await.unwrap();
        assert!(publisher.acked().is_empty());

        queue.ack(&delivery.tag).await.unwrap();
        assert_eq!(publisher.acked(), vec![tag]);
    }

    #[tokio::test]
    async fn memory_queue_ack_log_keeps_most_recent() {
        let (publisher, mut queue) = MemoryQueue::channel();
        for n in 0..ACK_LOG_CAPACITY + 3 {
            queue.ack(&n.to_string()).await.unwrap();
        }

        let tags = publisher.acked();
        assert_eq!(tags.len(), ACK_LOG_CAPACITY);
        assert_eq!(tags.first().map(String::as_str), Some("3"));
        assert_eq!(
            tags.last().cloned(),
            Some((ACK_LOG_CAPACITY + 2).to_string())
        );
    }

    #[tokio::test]
    async fn memory_queue_ends_when_publishers_drop() {
        let (publisher, mut queue) = MemoryQueue::channel();
        publisher.publish("last").unwrap();
        drop(publisher);

        assert!(queue.next_delivery().await.is_some());
        assert!(queue.next_delivery().await.is_none());
    }

    #[test]
    fn publish_after_queue_dropped_returns_none() {
        let (publisher, queue) = MemoryQueue::channel();
        drop(queue);
        assert!(publisher.publish("x").is_none());
    }
}
