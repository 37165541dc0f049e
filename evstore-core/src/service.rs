//! Request-handling surface: `SaveEvent` and `LoadEvents`.

use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::append::AppendPipeline;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::events::{Event, EventInput, ExpectedVersion};
use crate::read::{ReadPipeline, ReadRange};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveEventRequest {
    pub stream_id: String,
    pub events: Vec<EventInput>,
    #[serde(default)]
    pub expected_version: ExpectedVersion,
}

impl SaveEventRequest {
    pub fn new(stream_id: impl Into<String>, events: Vec<EventInput>) -> Self {
        Self {
            stream_id: stream_id.into(),
            events,
            expected_version: ExpectedVersion::Any,
        }
    }

    pub fn expecting(mut self, expected_version: ExpectedVersion) -> Self {
        self.expected_version = expected_version;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveEventResponse {
    pub next_expected_version: u64,
    pub event_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadEventsRequest {
    pub stream_id: String,
    pub from_version: u64,
    pub to_version: u64,
    pub max_count: usize,
    /// Bypass the cache.
    #[serde(default)]
    pub consistent: bool,
}

impl LoadEventsRequest {
    pub fn new(stream_id: impl Into<String>, from_version: u64, to_version: u64, max_count: usize) -> Self {
        Self {
            stream_id: stream_id.into(),
            from_version,
            to_version,
            max_count,
            consistent: false,
        }
    }
}

impl From<LoadEventsRequest> for ReadRange {
    fn from(req: LoadEventsRequest) -> Self {
        let range = ReadRange::new(req.stream_id, req.from_version, req.to_version, req.max_count);
        if req.consistent {
            range.consistent()
        } else {
            range
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadEventsResponse {
    pub events: Vec<Event>,
    pub next_version: u64,
    pub is_end_of_stream: bool,
}

/// The event store's RPC surface, independent of any transport.
///
/// Cheap to clone; every request-handling worker can hold its own copy.
#[derive(Clone)]
pub struct EventStoreService {
    append: AppendPipeline,
    read: ReadPipeline,
}

impl EventStoreService {
    pub fn new(append: AppendPipeline, read: ReadPipeline) -> Self {
        Self { append, read }
    }

    pub fn append_pipeline(&self) -> &AppendPipeline {
        &self.append
    }

    pub fn read_pipeline(&self) -> &ReadPipeline {
        &self.read
    }

    /// Commit a batch to one stream.
    ///
    /// Returns once the batch is durable. Conflicts and storage faults are
    /// surfaced as-is and never retried here.
    #[instrument(skip(self, req, deadline), fields(stream_id = %req.stream_id, count = req.events.len()))]
    pub async fn save_event(&self, req: SaveEventRequest, deadline: Deadline) -> Result<SaveEventResponse> {
        let committed = self
            .append
            .append(&req.stream_id, req.expected_version, req.events, deadline)
            .await?;
        Ok(SaveEventResponse {
            next_expected_version: committed.next_expected_version,
            event_ids: committed.event_ids(),
        })
    }

    /// Load a contiguous version range of one stream.
    #[instrument(skip(self, req, deadline), fields(stream_id = %req.stream_id, from = req.from_version, to = req.to_version))]
    pub async fn load_events(&self, req: LoadEventsRequest, deadline: Deadline) -> Result<LoadEventsResponse> {
        let result = self.read.read(&req.into(), deadline).await?;
        Ok(LoadEventsResponse {
            events: result.events,
            next_version: result.next_version,
            is_end_of_stream: result.is_end_of_stream,
        })
    }
}
