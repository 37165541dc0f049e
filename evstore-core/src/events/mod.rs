//! Event model: what writers submit and what the store hands back.
//!
//! An [`EventInput`] is a single event as proposed by a writer. Once the
//! append pipeline commits it, it becomes an [`Event`] with a stream-local
//! `version`, a global `position` and a commit `timestamp`.
//!
//! On the durable log the payload and the correlation envelope travel as two
//! separate byte blobs; [`EventInput::encode`] and [`Event::from_recorded`]
//! convert between the two forms.

mod version;

pub use version::ExpectedVersion;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::log::{NewEvent, RecordedEvent};

/// A single event proposed by a writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    /// Client-chosen id. Generated on append when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    pub event_type: String,
    pub data: Value,
    /// Aggregate the event belongs to. Defaults to the stream id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Opaque side-channel values, stored and returned untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl EventInput {
    /// Create an input with just a type and payload.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: None,
            event_type: event_type.into(),
            data,
            aggregate_id: None,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn with_aggregate_id(mut self, id: impl Into<String>) -> Self {
        self.aggregate_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Encode into the durable log's byte form under the given id.
    pub(crate) fn encode(&self, event_id: Uuid) -> Result<NewEvent> {
        let envelope = Envelope {
            aggregate_id: self.aggregate_id.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            user_id: self.user_id.clone(),
            extra: self.metadata.clone(),
        };
        Ok(NewEvent {
            event_id,
            event_type: self.event_type.clone(),
            data: serde_json::to_vec(&self.data)?,
            metadata: serde_json::to_vec(&envelope)?,
        })
    }
}

/// A committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: String,
    pub stream_id: String,
    /// Zero-based position within the stream.
    pub version: u64,
    /// Position in the global commit order of the log.
    #[serde(default)]
    pub position: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub aggregate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Event {
    /// Deserialize the payload into a typed value.
    pub fn decode_data<P: DeserializeOwned>(&self) -> Result<P> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Rebuild a committed event from its durable log record.
    pub fn from_recorded(record: RecordedEvent) -> Result<Self> {
        let data: Value = serde_json::from_slice(&record.data)?;
        let envelope: Envelope = if record.metadata.is_empty() {
            Envelope::default()
        } else {
            serde_json::from_slice(&record.metadata)?
        };
        let aggregate_id = envelope
            .aggregate_id
            .unwrap_or_else(|| record.stream_id.clone());

        Ok(Self {
            event_id: record.event_id,
            event_type: record.event_type,
            stream_id: record.stream_id,
            version: record.version,
            position: record.position,
            timestamp: record.created,
            data,
            aggregate_id,
            correlation_id: envelope.correlation_id,
            causation_id: envelope.causation_id,
            user_id: envelope.user_id,
            metadata: envelope.extra,
        })
    }
}

/// Decode a page of records, checking that versions are contiguous from `from`.
pub(crate) fn decode_contiguous(
    stream_id: &str,
    from: u64,
    records: Vec<RecordedEvent>,
) -> Result<Vec<Event>> {
    let mut events = Vec::with_capacity(records.len());
    for (offset, record) in records.into_iter().enumerate() {
        let expected = from + offset as u64;
        if record.version != expected {
            return Err(Error::StorageUnavailable(format!(
                "durable log returned version {} of stream '{}' where {} was expected",
                record.version, stream_id, expected
            )));
        }
        events.push(Event::from_recorded(record)?);
    }
    Ok(events)
}

/// Correlation data stored next to the payload.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    extra: Map<String, Value>,
}
