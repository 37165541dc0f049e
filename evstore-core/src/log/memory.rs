//! In-memory DurableLog implementation for testing.
//!
//! Stores events in memory without persistence. Counts reads and can be
//! switched into an unavailable state so callers can exercise cache and
//! fault paths without a database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    AppendOutcome, DurableLog, LogError, LogResult, NewEvent, ReadDirection, RecordedEvent,
};
use crate::events::ExpectedVersion;

#[derive(Default)]
struct State {
    /// Per-stream events, indexed by version.
    streams: HashMap<String, Vec<RecordedEvent>>,
    /// Global order as (stream, version) pairs, indexed by position.
    all: Vec<(String, u64)>,
    ids: HashSet<uuid::Uuid>,
}

/// In-memory implementation of DurableLog.
#[derive(Default)]
pub struct InMemoryDurableLog {
    state: RwLock<State>,
    reads: AtomicU64,
    appends: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryDurableLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `LogError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `read` calls served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful appends so far.
    pub fn append_count(&self) -> u64 {
        self.appends.load(Ordering::SeqCst)
    }

    /// Total events across all streams.
    pub async fn len(&self) -> usize {
        self.state.read().await.all.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.all.is_empty()
    }

    fn ensure_available(&self) -> LogResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LogError::Unavailable("in-memory log switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableLog for InMemoryDurableLog {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> LogResult<AppendOutcome> {
        self.ensure_available()?;

        // Single write lock makes the check and the commit one step.
        let mut state = self.state.write().await;
        let current = state.streams.get(stream_id).map_or(0, |s| s.len() as u64);
        if !expected.matches(current) {
            return Err(LogError::WrongExpectedVersion {
                stream_id: stream_id.to_string(),
                expected,
                actual: current,
            });
        }

        let mut batch_ids = HashSet::with_capacity(events.len());
        for event in &events {
            if state.ids.contains(&event.event_id) || !batch_ids.insert(event.event_id) {
                return Err(LogError::DuplicateEventId(event.event_id));
            }
        }

        let created = Utc::now();
        let first_position = state.all.len() as u64;
        let committed: Vec<RecordedEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| RecordedEvent {
                stream_id: stream_id.to_string(),
                version: current + i as u64,
                position: first_position + i as u64,
                event_id: event.event_id,
                event_type: event.event_type,
                created,
                data: event.data,
                metadata: event.metadata,
            })
            .collect();

        for record in &committed {
            state.ids.insert(record.event_id);
            state.all.push((stream_id.to_string(), record.version));
        }
        state
            .streams
            .entry(stream_id.to_string())
            .or_default()
            .extend(committed.iter().cloned());

        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(AppendOutcome {
            next_expected_version: current + committed.len() as u64,
            committed,
        })
    }

    async fn read(
        &self,
        stream_id: &str,
        from: u64,
        direction: ReadDirection,
        max_count: usize,
    ) -> LogResult<Vec<RecordedEvent>> {
        self.ensure_available()?;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let state = self.state.read().await;
        let Some(stream) = state.streams.get(stream_id) else {
            return Ok(Vec::new());
        };

        let events = match direction {
            ReadDirection::Forwards => stream
                .iter()
                .skip(from.min(usize::MAX as u64) as usize)
                .take(max_count)
                .cloned()
                .collect(),
            ReadDirection::Backwards => {
                if stream.is_empty() {
                    return Ok(Vec::new());
                }
                let start = from.min(stream.len() as u64 - 1) as usize;
                stream[..=start]
                    .iter()
                    .rev()
                    .take(max_count)
                    .cloned()
                    .collect()
            }
        };
        Ok(events)
    }

    async fn read_all(
        &self,
        from_position: u64,
        max_count: usize,
    ) -> LogResult<Vec<RecordedEvent>> {
        self.ensure_available()?;

        let state = self.state.read().await;
        let mut events = Vec::new();
        for (stream_id, version) in state
            .all
            .iter()
            .skip(from_position.min(usize::MAX as u64) as usize)
            .take(max_count)
        {
            let record = state
                .streams
                .get(stream_id)
                .and_then(|s| s.get(*version as usize))
                .ok_or_else(|| {
                    LogError::Corrupt(format!("missing {}@{} in global index", stream_id, version))
                })?;
            events.push(record.clone());
        }
        Ok(events)
    }

    async fn stream_length(&self, stream_id: &str) -> LogResult<u64> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state.streams.get(stream_id).map_or(0, |s| s.len() as u64))
    }

    async fn head_position(&self) -> LogResult<u64> {
        self.ensure_available()?;
        Ok(self.state.read().await.all.len() as u64)
    }
}
