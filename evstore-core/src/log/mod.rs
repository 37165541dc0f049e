//! The durable, append-only source of truth.
//!
//! A [`DurableLog`] stores ordered per-stream sequences of events and gives
//! every committed event two coordinates:
//!
//! - `version` - zero-based position inside its stream
//! - `position` - zero-based position in the log's global commit order
//!
//! Appends are atomic per call and guarded by an [`ExpectedVersion`]: either
//! the whole batch lands with contiguous versions or nothing does.

mod memory;
mod turso;

pub use memory::InMemoryDurableLog;
pub use turso::TursoDurableLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::events::ExpectedVersion;

/// Errors reported by a durable log implementation.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("wrong expected version on '{stream_id}': expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream_id: String,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("duplicate event id: {0}")]
    DuplicateEventId(Uuid),

    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<libsql::Error> for LogError {
    fn from(err: libsql::Error) -> Self {
        LogError::Unavailable(err.to_string())
    }
}

pub type LogResult<T> = std::result::Result<T, LogError>;

/// Direction of a stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    /// Ascending versions starting at `from`.
    Forwards,
    /// Descending versions starting at `from`. `u64::MAX` starts at the head.
    Backwards,
}

/// An event ready to be written, in the log's byte form.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// A committed event as stored by the log.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub stream_id: String,
    pub version: u64,
    pub position: u64,
    pub event_id: Uuid,
    pub event_type: String,
    pub created: DateTime<Utc>,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Stream length after the commit; pass as `ExpectedVersion::Exact` next time.
    pub next_expected_version: u64,
    /// The records exactly as committed.
    pub committed: Vec<RecordedEvent>,
}

/// Append-only, per-stream ordered event storage.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Atomically append `events` to `stream_id` if `expected` holds.
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> LogResult<AppendOutcome>;

    /// Read up to `max_count` events of one stream starting at version `from`.
    async fn read(
        &self,
        stream_id: &str,
        from: u64,
        direction: ReadDirection,
        max_count: usize,
    ) -> LogResult<Vec<RecordedEvent>>;

    /// Read up to `max_count` events across all streams in commit order,
    /// starting at global position `from_position`.
    async fn read_all(&self, from_position: u64, max_count: usize)
    -> LogResult<Vec<RecordedEvent>>;

    /// Number of events in the stream; zero if it does not exist.
    async fn stream_length(&self, stream_id: &str) -> LogResult<u64>;

    /// Global position the next committed event will receive.
    async fn head_position(&self) -> LogResult<u64>;
}
