//! Projection manager: folds committed events into read models.
//!
//! Each registered [`Projection`] maps an event to a record key and folds
//! it into the record stored under that key. The record carries the last
//! applied version per source stream, which gives two guarantees:
//!
//! - **Idempotence** - an event at or below the cursor is a redelivery and
//!   is skipped
//! - **Ordering** - an event above `cursor + 1` means earlier versions were
//!   lost or reordered in transit; the missing range is read back from the
//!   durable log and folded first
//!
//! # Architecture
//!
//! ```text
//!  EventSource (bus group / log tail)
//!        │ batch
//!        ▼
//!  group by record key ──► key A: e1, e4 ─┐
//!                          key B: e2      ├─► up to `concurrency` keys at once,
//!                          key C: e3, e5 ─┘   each key strictly sequential
//!                                │
//!                                ▼
//!                          ReadModelStore
//! ```

mod source;
mod store;
mod summary;
mod turso;

pub use source::{BusSource, EventSource, LogTailSource, checkpoint_key};
pub use store::{InMemoryReadModelStore, ProjectionRecord, ReadModelStore};
pub use summary::{STREAM_SUMMARY, StreamSummary, stream_summary_fold, stream_summary_projection};
pub use turso::TursoReadModelStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ProjectionConfig;
use crate::error::Result;
use crate::events::{Event, decode_contiguous};
use crate::fold::{Fold, StateFold, TypedFold};
use crate::log::{DurableLog, ReadDirection};

/// Page size for gap-repair reads.
const REPAIR_PAGE: usize = 500;

type KeyFn = Arc<dyn Fn(&Event) -> Option<String> + Send + Sync>;

/// A named fold plus the rule that picks which record an event updates.
#[derive(Clone)]
pub struct Projection {
    name: String,
    fold: Arc<dyn StateFold>,
    key: KeyFn,
}

impl Projection {
    /// A projection keyed by the event's aggregate id.
    pub fn new<S>(fold: Fold<S>) -> Self
    where
        S: Default + Serialize + DeserializeOwned + 'static,
    {
        Self::from_state_fold(Arc::new(TypedFold::new(fold)))
    }

    pub fn from_state_fold(fold: Arc<dyn StateFold>) -> Self {
        Self {
            name: fold.name().to_string(),
            fold,
            key: Arc::new(|event: &Event| Some(event.aggregate_id.clone())),
        }
    }

    /// Choose the domain key per event. `None` leaves the event out.
    pub fn keyed_by<F>(mut self, key: F) -> Self
    where
        F: Fn(&Event) -> Option<String> + Send + Sync + 'static,
    {
        self.key = Arc::new(key);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fold(&self) -> &Arc<dyn StateFold> {
        &self.fold
    }

    /// Store key for a domain key: `{projection}:{domain_key}`.
    pub fn key_for(&self, domain_key: &str) -> String {
        format!("{}:{}", self.name, domain_key)
    }

    pub fn record_key(&self, event: &Event) -> Option<String> {
        (self.key)(event).map(|k| self.key_for(&k))
    }
}

/// Counters for one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub applied: usize,
    /// Redeliveries at or below the cursor.
    pub duplicates: usize,
    /// Events read back from the log to close a gap.
    pub repaired: usize,
    /// Events the fold rejected; the cursor moves past them.
    pub rejected: usize,
}

impl BatchStats {
    fn merge(&mut self, other: BatchStats) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.repaired += other.repaired;
        self.rejected += other.rejected;
    }
}

/// Runs the registered projections over an [`EventSource`].
pub struct ProjectionManager {
    projections: Vec<Projection>,
    store: Arc<dyn ReadModelStore>,
    log: Arc<dyn DurableLog>,
    config: ProjectionConfig,
}

impl ProjectionManager {
    pub fn new(
        store: Arc<dyn ReadModelStore>,
        log: Arc<dyn DurableLog>,
        config: ProjectionConfig,
    ) -> Self {
        Self {
            projections: Vec::new(),
            store,
            log,
            config,
        }
    }

    #[must_use]
    pub fn register(mut self, projection: Projection) -> Self {
        self.projections.push(projection);
        self
    }

    pub fn projections(&self) -> &[Projection] {
        &self.projections
    }

    pub fn store(&self) -> &Arc<dyn ReadModelStore> {
        &self.store
    }

    /// Load the record a projection keeps for `domain_key`.
    pub async fn get(&self, projection: &str, domain_key: &str) -> Result<Option<ProjectionRecord>> {
        self.store
            .get_projection(&format!("{}:{}", projection, domain_key))
            .await
    }

    /// Consume `source` until `shutdown` fires.
    ///
    /// A batch that has started applying always finishes (or is retried)
    /// before the loop checks for shutdown again. Source offsets are only
    /// committed after the whole batch is stored.
    pub async fn run(&self, mut source: Box<dyn EventSource>, shutdown: CancellationToken) {
        info!(
            source = %source.describe(),
            projections = self.projections.len(),
            "Projection manager started"
        );

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Projection manager received shutdown signal");
                    break;
                }
                result = source.next_batch(self.config.batch_size, self.config.poll_timeout) => result,
            };

            match polled {
                Ok(events) if events.is_empty() => {
                    trace!("Empty batch, continuing");
                }
                Ok(events) => {
                    debug!(count = events.len(), "Processing batch");
                    if !self.apply_until_stored(&events, &shutdown).await {
                        break;
                    }
                    if let Err(e) = source.commit().await {
                        error!(error = %e, "Failed to commit source position");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    if !self.backoff(&shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Projection manager stopped");
    }

    /// Retry a batch until it is stored. Returns `false` on shutdown.
    async fn apply_until_stored(&self, events: &[Event], shutdown: &CancellationToken) -> bool {
        loop {
            match self.apply_batch(events).await {
                Ok(stats) => {
                    debug!(
                        applied = stats.applied,
                        duplicates = stats.duplicates,
                        repaired = stats.repaired,
                        rejected = stats.rejected,
                        "Batch applied"
                    );
                    return true;
                }
                Err(e) => {
                    error!(error = %e, count = events.len(), "Failed to apply batch, retrying");
                    if !self.backoff(shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn backoff(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.retry_backoff) => true,
        }
    }

    /// Fold a batch into every registered projection.
    ///
    /// Distinct record keys run concurrently; one key's events apply in
    /// batch order. On error, keys that succeeded stay stored and the
    /// whole batch can be reapplied safely.
    pub async fn apply_batch(&self, events: &[Event]) -> Result<BatchStats> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(&Projection, String, Vec<&Event>)> = Vec::new();
        for event in events {
            for projection in &self.projections {
                let Some(key) = projection.record_key(event) else {
                    continue;
                };
                match index.get(&key) {
                    Some(&i) => groups[i].2.push(event),
                    None => {
                        index.insert(key.clone(), groups.len());
                        groups.push((projection, key, vec![event]));
                    }
                }
            }
        }

        let pending: Vec<_> = groups
            .into_iter()
            .map(|(projection, key, events)| self.apply_to_key(projection, key, events))
            .collect();
        let results: Vec<Result<BatchStats>> = stream::iter(pending)
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut stats = BatchStats::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(s) => stats.merge(s),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => warn!(error = %e, "Additional projection failure in batch"),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    async fn apply_to_key(
        &self,
        projection: &Projection,
        key: String,
        events: Vec<&Event>,
    ) -> Result<BatchStats> {
        let mut stats = BatchStats::default();
        let mut record = self.store.get_projection(&key).await?;
        let mut dirty = false;

        for event in events {
            let cursor = record
                .as_ref()
                .and_then(|r| r.last_applied_version(&event.stream_id));
            if cursor.is_some_and(|applied| event.version <= applied) {
                trace!(%key, stream_id = %event.stream_id, version = event.version, "Skipping duplicate");
                stats.duplicates += 1;
                continue;
            }
            if record.is_none() && !projection.fold.handles(&event.event_type) {
                continue;
            }

            let expected = cursor.map_or(0, |applied| applied + 1);
            if event.version > expected {
                debug!(
                    %key,
                    stream_id = %event.stream_id,
                    from = expected,
                    to = event.version,
                    "Repairing gap from durable log"
                );
                for missing in self
                    .read_gap(&event.stream_id, expected, event.version)
                    .await?
                {
                    let belongs = projection.record_key(&missing).as_deref() == Some(key.as_str());
                    self.fold_into(projection, &mut record, &missing, belongs, &mut stats)?;
                    stats.repaired += 1;
                }
            }

            self.fold_into(projection, &mut record, event, true, &mut stats)?;
            stats.applied += 1;
            dirty = true;
        }

        if let Some(record) = record.as_mut().filter(|_| dirty) {
            record.updated_at = Utc::now();
            self.store.put_projection(&key, record).await?;
        }
        Ok(stats)
    }

    /// Advance the cursor for `event`, folding it when `apply` is set.
    fn fold_into(
        &self,
        projection: &Projection,
        record: &mut Option<ProjectionRecord>,
        event: &Event,
        apply: bool,
        stats: &mut BatchStats,
    ) -> Result<()> {
        let current = match record.take() {
            Some(r) => r,
            None => ProjectionRecord::new(projection.fold.initial()?),
        };
        let ProjectionRecord {
            state,
            mut last_applied,
            updated_at,
        } = current;

        let state = if apply {
            match projection.fold.apply(state.clone(), event) {
                Ok(next) => next,
                Err(e) if !e.is_transient() => {
                    error!(
                        projection = %projection.name,
                        event_id = %event.event_id,
                        stream_id = %event.stream_id,
                        version = event.version,
                        error = %e,
                        "Fold rejected event, skipping"
                    );
                    stats.rejected += 1;
                    state
                }
                Err(e) => return Err(e),
            }
        } else {
            state
        };

        last_applied.insert(event.stream_id.clone(), event.version);
        *record = Some(ProjectionRecord {
            state,
            last_applied,
            updated_at,
        });
        Ok(())
    }

    /// Versions `from..to` of a stream, read from the log in pages.
    async fn read_gap(&self, stream_id: &str, from: u64, to: u64) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut next = from;
        while next < to {
            let page = ((to - next) as usize).min(REPAIR_PAGE);
            let records = self
                .log
                .read(stream_id, next, ReadDirection::Forwards, page)
                .await?;
            if records.is_empty() {
                warn!(stream_id, from = next, to, "Durable log has no events for gap");
                break;
            }
            let decoded = decode_contiguous(stream_id, next, records)?;
            next += decoded.len() as u64;
            events.extend(decoded);
        }
        Ok(events)
    }

    /// Drop every projection record and refold the whole log.
    ///
    /// Returns the number of events processed.
    pub async fn rebuild(&self, page_size: usize) -> Result<u64> {
        for projection in &self.projections {
            let removed = self
                .store
                .delete_prefix(&format!("{}:", projection.name))
                .await?;
            info!(projection = %projection.name, removed, "Cleared projection");
        }

        let mut source = LogTailSource::from_position(self.log.clone(), "rebuild", 0);
        let mut processed = 0u64;
        loop {
            let events = source.next_batch(page_size.max(1), Duration::ZERO).await?;
            if events.is_empty() {
                break;
            }
            self.apply_batch(&events).await?;
            processed += events.len() as u64;
        }
        info!(processed, "Projection rebuild complete");
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventInput, ExpectedVersion};
    use crate::log::InMemoryDurableLog;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Cart {
        items: Vec<String>,
    }

    #[derive(Deserialize)]
    struct ItemAdded {
        sku: String,
    }

    fn cart_projection() -> Projection {
        Projection::new(
            Fold::new("cart").on("ItemAdded", |cart: &mut Cart, p: ItemAdded, _| {
                cart.items.push(p.sku)
            }),
        )
    }

    struct Fixture {
        log: Arc<InMemoryDurableLog>,
        store: Arc<InMemoryReadModelStore>,
        manager: ProjectionManager,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemoryReadModelStore::new());
        let manager = ProjectionManager::new(store.clone(), log.clone(), ProjectionConfig::default())
            .register(cart_projection())
            .register(stream_summary_projection());
        Fixture { log, store, manager }
    }

    async fn append(log: &InMemoryDurableLog, stream: &str, inputs: Vec<EventInput>) -> Vec<Event> {
        let batch = inputs
            .iter()
            .map(|i| i.encode(uuid::Uuid::now_v7()).unwrap())
            .collect();
        log.append(stream, ExpectedVersion::Any, batch)
            .await
            .unwrap()
            .committed
            .into_iter()
            .map(|r| Event::from_recorded(r).unwrap())
            .collect()
    }

    fn item(sku: &str) -> EventInput {
        EventInput::new("ItemAdded", json!({ "sku": sku }))
    }

    async fn cart_items(manager: &ProjectionManager, cart: &str) -> Vec<String> {
        let record = manager.get("cart", cart).await.unwrap().unwrap();
        serde_json::from_value::<Cart>(record.state).unwrap().items
    }

    #[tokio::test]
    async fn applies_events_in_order() {
        let f = fixture();
        let events = append(&f.log, "cart-1", vec![item("X"), item("Y")]).await;

        let stats = f.manager.apply_batch(&events).await.unwrap();
        assert_eq!(stats.applied, 4);
        assert_eq!(cart_items(&f.manager, "cart-1").await, vec!["X", "Y"]);

        let summary = f
            .manager
            .get(STREAM_SUMMARY, "cart-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.state["event_count"], 2);
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let f = fixture();
        let events = append(&f.log, "cart-1", vec![item("X")]).await;

        f.manager.apply_batch(&events).await.unwrap();
        let once = f.store.get_projection("cart:cart-1").await.unwrap().unwrap();

        let stats = f.manager.apply_batch(&events).await.unwrap();
        let twice = f.store.get_projection("cart:cart-1").await.unwrap().unwrap();

        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.applied, 0);
        assert_eq!(once.state, twice.state);
        assert_eq!(once.last_applied, twice.last_applied);
    }

    #[tokio::test]
    async fn gap_is_repaired_from_log() {
        let f = fixture();
        let events = append(&f.log, "cart-1", vec![item("A"), item("B"), item("C")]).await;

        // Only the last event arrives; versions 0 and 1 were lost in transit.
        let stats = f.manager.apply_batch(&events[2..]).await.unwrap();
        assert_eq!(stats.repaired, 4);
        assert_eq!(cart_items(&f.manager, "cart-1").await, vec!["A", "B", "C"]);

        // The lost events arriving late are duplicates.
        let late = f.manager.apply_batch(&events[..2]).await.unwrap();
        assert_eq!(late.duplicates, 4);
        assert_eq!(cart_items(&f.manager, "cart-1").await, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn unhandled_types_do_not_create_records() {
        let log = Arc::new(InMemoryDurableLog::new());
        let store = Arc::new(InMemoryReadModelStore::new());
        let manager = ProjectionManager::new(store.clone(), log.clone(), ProjectionConfig::default())
            .register(cart_projection());

        let events = append(&log, "cart-9", vec![EventInput::new("CartOpened", json!({}))]).await;
        manager.apply_batch(&events).await.unwrap();
        assert!(manager.get("cart", "cart-9").await.unwrap().is_none());
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn rejected_payload_advances_cursor() {
        let f = fixture();
        let events = append(
            &f.log,
            "cart-1",
            vec![
                EventInput::new("ItemAdded", json!({"wrong": true})),
                item("Y"),
            ],
        )
        .await;

        let stats = f.manager.apply_batch(&events).await.unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(cart_items(&f.manager, "cart-1").await, vec!["Y"]);
        let record = f.store.get_projection("cart:cart-1").await.unwrap().unwrap();
        assert_eq!(record.last_applied_version("cart-1"), Some(1));
    }

    #[tokio::test]
    async fn store_outage_fails_batch_for_retry() {
        let f = fixture();
        let events = append(&f.log, "cart-1", vec![item("X")]).await;

        f.store.set_unavailable(true);
        assert!(f.manager.apply_batch(&events).await.is_err());

        f.store.set_unavailable(false);
        f.manager.apply_batch(&events).await.unwrap();
        assert_eq!(cart_items(&f.manager, "cart-1").await, vec!["X"]);
    }

    #[tokio::test]
    async fn rebuild_refolds_everything() {
        let f = fixture();
        append(&f.log, "cart-1", vec![item("X")]).await;
        append(&f.log, "cart-2", vec![item("Y"), item("Z")]).await;

        let processed = f.manager.rebuild(2).await.unwrap();
        assert_eq!(processed, 3);
        assert_eq!(cart_items(&f.manager, "cart-2").await, vec!["Y", "Z"]);

        // Rebuilding twice yields the same state.
        f.manager.rebuild(10).await.unwrap();
        assert_eq!(cart_items(&f.manager, "cart-1").await, vec!["X"]);
    }

    #[tokio::test]
    async fn run_consumes_until_cancelled() {
        let f = fixture();
        let manager = Arc::new(f.manager);
        append(&f.log, "cart-1", vec![item("X"), item("Y")]).await;

        let source = LogTailSource::resume(f.log.clone(), f.store.clone(), "projections")
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let task = {
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { manager.run(Box::new(source), shutdown).await })
        };

        for _ in 0..50 {
            let checkpoint = f
                .store
                .get_projection(&checkpoint_key("projections"))
                .await
                .unwrap();
            if checkpoint.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(cart_items(&manager, "cart-1").await, vec!["X", "Y"]);
        let checkpoint = f
            .store
            .get_projection(&checkpoint_key("projections"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.state["position"], 2);
    }
}
