//! Error types for the event store core.

use thiserror::Error;

use crate::events::ExpectedVersion;
use crate::log::LogError;

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the append, read, projection and snapshot pipelines.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input. Nothing was written.
    #[error("validation error: {0}")]
    Validation(String),

    /// The stream had moved past the version the writer expected.
    #[error("concurrency conflict on stream '{stream_id}': expected {expected}, actual {actual}")]
    ConcurrencyConflict {
        stream_id: String,
        expected: ExpectedVersion,
        actual: u64,
    },

    /// The durable log, read model store or snapshot store could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A committed event could not be delivered to the bus.
    #[error("publish failure: {0}")]
    PublishFailure(String),

    /// The caller's deadline elapsed before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A fold handler rejected an event.
    #[error("fold '{fold}' failed on {event_type}: {reason}")]
    Fold {
        fold: String,
        event_type: String,
        reason: String,
    },
}

impl Error {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_) | Error::PublishFailure(_) | Error::DeadlineExceeded
        )
    }
}

impl From<LogError> for Error {
    fn from(err: LogError) -> Self {
        match err {
            LogError::WrongExpectedVersion {
                stream_id,
                expected,
                actual,
            } => Error::ConcurrencyConflict {
                stream_id,
                expected,
                actual,
            },
            LogError::DuplicateEventId(id) => {
                Error::Validation(format!("event id {} already exists in the log", id))
            }
            LogError::Unavailable(msg) => Error::StorageUnavailable(msg),
            LogError::Corrupt(msg) => Error::StorageUnavailable(format!("corrupt record: {}", msg)),
        }
    }
}

impl From<libsql::Error> for Error {
    fn from(err: libsql::Error) -> Self {
        Error::StorageUnavailable(err.to_string())
    }
}

impl From<evstore_bus::Error> for Error {
    fn from(err: evstore_bus::Error) -> Self {
        Error::PublishFailure(err.to_string())
    }
}
