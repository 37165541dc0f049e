//! Core traits for message bus operations.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Offset into a topic partition.
pub type Offset = u64;

/// Position to seek to when starting a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// Start from the beginning.
    Beginning,
    /// Start from the end (new messages only).
    End,
    /// Start from a specific offset in every partition.
    Offset(Offset),
}

/// Headers carried alongside every published event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Type tag of the event (e.g. "UserCreated").
    pub event_type: String,
    /// Correlation id propagated from the writer.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// User on whose behalf the event was written.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl MessageHeaders {
    /// Create headers for an event type.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id: None,
            user_id: None,
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the user id.
    #[must_use]
    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Header pairs in wire naming. Absent values are sent as empty strings.
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            ("event-type", self.event_type.as_str()),
            (
                "correlation-id",
                self.correlation_id.as_deref().unwrap_or_default(),
            ),
            ("user-id", self.user_id.as_deref().unwrap_or_default()),
        ]
    }
}

/// A message published to (or polled from) the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Destination topic.
    pub topic: String,
    /// Partitioning key. Messages with the same key keep their relative order.
    pub key: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Routing headers.
    pub headers: MessageHeaders,
}

impl BusMessage {
    /// Create a message with empty headers.
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            headers: MessageHeaders::default(),
        }
    }

    /// Attach headers.
    #[must_use]
    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }
}

/// A batch of messages returned from polling.
///
/// Offsets are partition-local, so two entries may carry the same offset.
#[derive(Debug, Default)]
pub struct MessageBatch {
    /// The polled messages with their partition offsets.
    pub messages: Vec<(Offset, BusMessage)>,
}

impl MessageBatch {
    /// Create a batch from polled messages.
    pub fn new(messages: Vec<(Offset, BusMessage)>) -> Self {
        Self { messages }
    }

    /// An empty batch.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of messages in the batch.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Offset of the first message, if any.
    pub fn first_offset(&self) -> Option<Offset> {
        self.messages.first().map(|(o, _)| *o)
    }

    /// Offset of the last message, if any.
    pub fn last_offset(&self) -> Option<Offset> {
        self.messages.last().map(|(o, _)| *o)
    }
}

impl IntoIterator for MessageBatch {
    type Item = (Offset, BusMessage);
    type IntoIter = std::vec::IntoIter<(Offset, BusMessage)>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

/// Trait for publishing messages and creating consumers.
///
/// Publishing is fire-and-forget from the caller's perspective; delivery
/// retries are the bus implementation's concern.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message to its topic.
    async fn publish(&self, message: BusMessage) -> crate::Result<()>;

    /// Create a consumer reading the given topics as a consumer group.
    ///
    /// The consumer resumes from the group's last committed offsets.
    async fn consumer(&self, group: &str, topics: &[String]) -> crate::Result<Box<dyn BusConsumer>>;
}

/// Trait for polling messages with offset tracking.
#[async_trait]
pub trait BusConsumer: Send {
    /// Poll for new messages, waiting up to `timeout` when none are ready.
    async fn poll(&mut self, max_count: usize, timeout: Duration) -> crate::Result<MessageBatch>;

    /// Commit everything polled so far for this consumer group.
    async fn commit(&mut self) -> crate::Result<()>;

    /// Move the read position.
    async fn seek(&mut self, position: SeekPosition) -> crate::Result<()>;

    /// The consumer group name.
    fn group(&self) -> &str;
}
