//! Built-in per-stream summary projection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Projection;
use crate::fold::Fold;

pub const STREAM_SUMMARY: &str = "stream-summary";

/// Event counts and the latest event of one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub stream_id: String,
    pub event_count: u64,
    pub by_type: BTreeMap<String, u64>,
    pub last_version: Option<u64>,
    pub last_event_id: Option<Uuid>,
    pub last_event_type: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
}

pub fn stream_summary_fold() -> Fold<StreamSummary> {
    Fold::new(STREAM_SUMMARY).on_any(|summary: &mut StreamSummary, event| {
        summary.stream_id.clone_from(&event.stream_id);
        summary.event_count += 1;
        *summary.by_type.entry(event.event_type.clone()).or_default() += 1;
        summary.last_version = Some(event.version);
        summary.last_event_id = Some(event.event_id);
        summary.last_event_type = Some(event.event_type.clone());
        summary.last_event_at = Some(event.timestamp);
    })
}

/// Summary keyed by stream id, stored as `stream-summary:{stream_id}`.
pub fn stream_summary_projection() -> Projection {
    Projection::new(stream_summary_fold()).keyed_by(|event| Some(event.stream_id.clone()))
}
