//! Snapshot manager: periodically captures compacted stream state.
//!
//! The manager tails committed events and tracks, per stream, how many
//! events landed since the newest snapshot. A stream is captured when
//! either trigger fires:
//!
//! - **Count** - `every_events` events are pending
//! - **Interval** - on each `interval` tick, any stream with at least
//!   `min_events` pending
//!
//! Capturing never blocks writers. Snapshots are advisory: [`rehydrate`]
//! falls back to a full replay whenever one is missing or unreadable.

mod rehydrate;
mod store;
mod turso;

pub use rehydrate::{Rehydrated, rehydrate};
pub use store::{InMemorySnapshotStore, Snapshot, SnapshotStore};
pub use turso::TursoSnapshotStore;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::SnapshotConfig;
use crate::error::Result;
use crate::events::Event;
use crate::fold::StateFold;
use crate::log::DurableLog;
use crate::projection::EventSource;

#[derive(Debug, Clone, Copy, Default)]
struct StreamProgress {
    /// Highest version seen for the stream.
    head: u64,
    /// Version of the newest snapshot; `None` until looked up.
    snapshot: Option<Option<u64>>,
}

impl StreamProgress {
    fn pending(&self) -> u64 {
        let covered = match self.snapshot {
            Some(Some(version)) => version + 1,
            _ => 0,
        };
        (self.head + 1).saturating_sub(covered)
    }
}

/// Captures snapshots of one fold for every stream it sees.
pub struct SnapshotManager {
    log: Arc<dyn DurableLog>,
    store: Arc<dyn SnapshotStore>,
    fold: Arc<dyn StateFold>,
    config: SnapshotConfig,
    progress: HashMap<String, StreamProgress>,
}

impl SnapshotManager {
    pub fn new(
        log: Arc<dyn DurableLog>,
        store: Arc<dyn SnapshotStore>,
        fold: Arc<dyn StateFold>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            log,
            store,
            fold,
            config,
            progress: HashMap::new(),
        }
    }

    pub fn fold_name(&self) -> &str {
        self.fold.name()
    }

    /// Events committed to `stream_id` since its newest known snapshot.
    pub fn pending(&self, stream_id: &str) -> u64 {
        self.progress
            .get(stream_id)
            .map_or(0, StreamProgress::pending)
    }

    /// Record a committed event.
    pub async fn observe(&mut self, event: &Event) {
        let known = self
            .progress
            .get(&event.stream_id)
            .and_then(|p| p.snapshot);
        let snapshot = match known {
            Some(version) => version,
            None => match self.store.latest(&event.stream_id, self.fold.name()).await {
                Ok(found) => found.map(|s| s.version),
                Err(e) => {
                    warn!(stream_id = %event.stream_id, error = %e, "Snapshot lookup failed");
                    None
                }
            },
        };

        let progress = self.progress.entry(event.stream_id.clone()).or_default();
        progress.head = progress.head.max(event.version);
        progress.snapshot = Some(snapshot);
    }

    /// Fold `stream_id` to its head and store the result.
    ///
    /// Returns `None` when the stream is empty or the newest snapshot
    /// already covers its head.
    pub async fn capture(&mut self, stream_id: &str) -> Result<Option<Snapshot>> {
        let started = Instant::now();
        let rehydrated = rehydrate(
            self.log.as_ref(),
            Some(self.store.as_ref()),
            self.fold.as_ref(),
            stream_id,
            self.config.batch_size,
        )
        .await?;

        let Some(version) = rehydrated.version else {
            return Ok(None);
        };
        if rehydrated.snapshot_version == Some(version) {
            self.settle(stream_id, version);
            return Ok(None);
        }

        let snapshot = Snapshot {
            stream_id: stream_id.to_string(),
            version,
            fold: self.fold.name().to_string(),
            state: rehydrated.state,
            taken_at: Utc::now(),
        };
        self.store.save(&snapshot).await?;
        self.settle(stream_id, version);

        let pruned = match self
            .store
            .prune(stream_id, self.fold.name(), self.config.keep.max(1))
            .await
        {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!(stream_id, error = %e, "Failed to prune old snapshots");
                0
            }
        };
        info!(
            stream_id,
            version,
            replayed = rehydrated.replayed,
            rejected = rehydrated.rejected,
            pruned,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot captured"
        );
        Ok(Some(snapshot))
    }

    /// Number of streams with tracked progress.
    pub fn tracked_streams(&self) -> usize {
        self.progress.len()
    }

    /// Note a snapshot at `version`. A stream with nothing left pending is
    /// dropped until its next event.
    fn settle(&mut self, stream_id: &str, version: u64) {
        let progress = self.progress.entry(stream_id.to_string()).or_default();
        progress.head = progress.head.max(version);
        progress.snapshot = Some(Some(version));
        if progress.pending() == 0 {
            self.progress.remove(stream_id);
        }
    }

    /// Capture every stream with at least `threshold` pending events.
    ///
    /// Failures are logged and the stream stays pending for the next round.
    pub async fn capture_due(&mut self, threshold: u64) -> usize {
        let threshold = threshold.max(1);
        let mut due: Vec<String> = self
            .progress
            .iter()
            .filter(|(_, p)| p.pending() >= threshold)
            .map(|(stream, _)| stream.clone())
            .collect();
        due.sort();

        let mut captured = 0;
        for stream_id in due {
            match self.capture(&stream_id).await {
                Ok(Some(_)) => captured += 1,
                Ok(None) => {}
                Err(e) => error!(%stream_id, error = %e, "Snapshot capture failed"),
            }
        }
        captured
    }

    /// Tail `source` and capture snapshots until `shutdown` fires.
    pub async fn run(mut self, mut source: Box<dyn EventSource>, shutdown: CancellationToken) {
        info!(
            fold = %self.fold.name(),
            source = %source.describe(),
            every_events = self.config.every_events,
            interval = ?self.config.interval,
            "Snapshot manager started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Snapshot manager received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let captured = self.capture_due(self.config.min_events).await;
                    debug!(captured, "Interval snapshot round");
                }
                polled = source.next_batch(self.config.batch_size, self.config.poll_timeout) => {
                    match polled {
                        Ok(events) if events.is_empty() => trace!("No new events"),
                        Ok(events) => {
                            for event in &events {
                                self.observe(event).await;
                            }
                            self.capture_due(self.config.every_events).await;
                            if let Err(e) = source.commit().await {
                                error!(error = %e, "Failed to commit snapshot tail position");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Poll failed");
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(self.config.poll_timeout) => {}
                            }
                        }
                    }
                }
            }
        }

        info!("Snapshot manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventInput, ExpectedVersion};
    use crate::fold::{Fold, TypedFold};
    use crate::log::InMemoryDurableLog;
    use crate::projection::LogTailSource;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        count: u64,
    }

    fn counter_fold() -> Arc<dyn StateFold> {
        Arc::new(TypedFold::new(Fold::new("counter").on_any(
            |c: &mut Counter, _: &Event| c.count += 1,
        )))
    }

    fn config(every_events: u64, min_events: u64) -> SnapshotConfig {
        SnapshotConfig {
            every_events,
            min_events,
            keep: 2,
            interval: Duration::from_secs(60),
            poll_timeout: Duration::from_millis(50),
            ..SnapshotConfig::default()
        }
    }

    async fn append(log: &InMemoryDurableLog, stream: &str, n: usize) -> Vec<Event> {
        let batch = (0..n)
            .map(|i| {
                EventInput::new("Tick", json!({ "i": i }))
                    .encode(uuid::Uuid::now_v7())
                    .unwrap()
            })
            .collect();
        log.append(stream, ExpectedVersion::Any, batch)
            .await
            .unwrap()
            .committed
            .into_iter()
            .map(|r| Event::from_recorded(r).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn captures_when_count_threshold_reached() {
        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemorySnapshotStore::new());
        let mut manager =
            SnapshotManager::new(log.clone(), store.clone(), counter_fold(), config(5, 2));

        for event in append(&log, "s-1", 4).await {
            manager.observe(&event).await;
        }
        assert_eq!(manager.pending("s-1"), 4);
        assert_eq!(manager.capture_due(5).await, 0);

        for event in append(&log, "s-1", 1).await {
            manager.observe(&event).await;
        }
        assert_eq!(manager.capture_due(5).await, 1);
        assert_eq!(manager.pending("s-1"), 0);

        let snapshot = store.latest("s-1", "counter").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.state, json!({ "count": 5 }));
    }

    #[tokio::test]
    async fn capture_builds_on_previous_snapshot() {
        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemorySnapshotStore::new());
        let mut manager =
            SnapshotManager::new(log.clone(), store.clone(), counter_fold(), config(3, 1));

        append(&log, "s-1", 3).await;
        manager.capture("s-1").await.unwrap().unwrap();
        append(&log, "s-1", 2).await;
        let second = manager.capture("s-1").await.unwrap().unwrap();

        assert_eq!(second.version, 4);
        assert_eq!(second.state, json!({ "count": 5 }));
        assert!(manager.capture("s-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn captured_streams_are_forgotten_until_next_event() {
        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemorySnapshotStore::new());
        let mut manager =
            SnapshotManager::new(log.clone(), store.clone(), counter_fold(), config(2, 1));

        for stream in ["a", "b", "c"] {
            for event in append(&log, stream, 2).await {
                manager.observe(&event).await;
            }
        }
        assert_eq!(manager.tracked_streams(), 3);
        assert_eq!(manager.capture_due(2).await, 3);
        assert_eq!(manager.tracked_streams(), 0);

        for event in append(&log, "a", 2).await {
            manager.observe(&event).await;
        }
        assert_eq!(manager.pending("a"), 2);
        assert_eq!(manager.capture_due(2).await, 1);
        assert_eq!(store.latest("a", "counter").await.unwrap().unwrap().version, 3);
    }

    #[tokio::test]
    async fn rejected_event_does_not_block_capture() {
        #[derive(Deserialize)]
        struct Tick {
            i: u64,
        }

        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemorySnapshotStore::new());
        let fold: Arc<dyn StateFold> = Arc::new(TypedFold::new(Fold::new("counter").on(
            "Tick",
            |c: &mut Counter, tick: Tick, _: &Event| c.count += tick.i + 1,
        )));
        let mut manager = SnapshotManager::new(log.clone(), store.clone(), fold, config(1, 1));

        let batch = [json!({ "i": "nope" }), json!({ "i": 1 })]
            .into_iter()
            .map(|data| EventInput::new("Tick", data).encode(uuid::Uuid::now_v7()).unwrap())
            .collect();
        log.append("s-1", ExpectedVersion::Any, batch).await.unwrap();

        let snapshot = manager.capture("s-1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.state, json!({ "count": 2 }));
    }

    #[tokio::test]
    async fn capture_prunes_to_keep() {
        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemorySnapshotStore::new());
        let mut manager =
            SnapshotManager::new(log.clone(), store.clone(), counter_fold(), config(1, 1));

        for _ in 0..4 {
            append(&log, "s-1", 1).await;
            manager.capture("s-1").await.unwrap();
        }

        let versions: Vec<u64> = store
            .list("s-1")
            .await
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![3, 2]);
    }

    #[tokio::test]
    async fn empty_stream_captures_nothing() {
        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemorySnapshotStore::new());
        let mut manager = SnapshotManager::new(log, store.clone(), counter_fold(), config(1, 1));

        assert!(manager.capture("ghost").await.unwrap().is_none());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn store_outage_leaves_stream_pending() {
        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemorySnapshotStore::new());
        let mut manager =
            SnapshotManager::new(log.clone(), store.clone(), counter_fold(), config(2, 1));

        for event in append(&log, "s-1", 2).await {
            manager.observe(&event).await;
        }
        store.set_unavailable(true);
        assert_eq!(manager.capture_due(2).await, 0);
        assert_eq!(manager.pending("s-1"), 2);

        store.set_unavailable(false);
        assert_eq!(manager.capture_due(2).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_tick_captures_below_count_threshold() {
        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemorySnapshotStore::new());
        append(&log, "s-1", 3).await;
        append(&log, "s-2", 1).await;

        let manager = SnapshotManager::new(
            log.clone(),
            store.clone(),
            counter_fold(),
            config(100, 2),
        );
        let source = Box::new(LogTailSource::from_position(log.clone(), "snapshots", 0));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(manager.run(source, shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.save_count(), 0);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(store.latest("s-1", "counter").await.unwrap().unwrap().version, 2);
        assert!(store.latest("s-2", "counter").await.unwrap().is_none());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
