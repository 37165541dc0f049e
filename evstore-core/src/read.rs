//! Read pipeline: cache-aside range reads over the durable log.
//!
//! Cache invalidation is TTL-only. A range cached before an append keeps
//! being served until it expires, so read-your-writes callers set
//! [`ReadRange::consistent`] to go straight to the log.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::append::validate_stream_id;
use crate::cache::{Cache, range_key};
use crate::config::{CacheConfig, ReadConfig};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::events::{Event, decode_contiguous};
use crate::log::{DurableLog, ReadDirection};

/// A version range of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRange {
    pub stream_id: String,
    /// Inclusive.
    pub from_version: u64,
    /// Exclusive.
    pub to_version: u64,
    pub max_count: usize,
    /// Skip the cache and read the log directly.
    pub consistent: bool,
}

impl ReadRange {
    pub fn new(
        stream_id: impl Into<String>,
        from_version: u64,
        to_version: u64,
        max_count: usize,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            from_version,
            to_version,
            max_count,
            consistent: false,
        }
    }

    pub fn consistent(mut self) -> Self {
        self.consistent = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub events: Vec<Event>,
    pub next_version: u64,
    /// Fewer than `max_count` events came back.
    pub is_end_of_stream: bool,
}

impl ReadResult {
    fn new(from_version: u64, events: Vec<Event>, max_count: usize) -> Self {
        Self {
            next_version: from_version + events.len() as u64,
            is_end_of_stream: events.len() < max_count,
            events,
        }
    }
}

#[derive(Clone)]
pub struct ReadPipeline {
    log: Arc<dyn DurableLog>,
    cache: Option<Arc<dyn Cache>>,
    ttl: Duration,
    max_count_limit: usize,
}

impl ReadPipeline {
    pub fn new(log: Arc<dyn DurableLog>, read: &ReadConfig) -> Self {
        Self {
            log,
            cache: None,
            ttl: CacheConfig::default().ttl,
            max_count_limit: read.max_count_limit,
        }
    }

    /// Put a cache in front of the log. Ignored when `config.enabled` is false.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>, config: &CacheConfig) -> Self {
        if config.enabled {
            self.cache = Some(cache);
            self.ttl = config.ttl;
        }
        self
    }

    #[instrument(skip(self, deadline), fields(stream_id = %range.stream_id))]
    pub async fn read(&self, range: &ReadRange, deadline: Deadline) -> Result<ReadResult> {
        self.validate(range)?;
        deadline.check()?;

        let key = range_key(&range.stream_id, range.from_version, range.to_version);

        if let Some(cache) = self.cache.as_ref().filter(|_| !range.consistent) {
            if let Some(mut events) = self.cached(cache.as_ref(), &key, deadline).await? {
                events.truncate(range.max_count);
                debug!(%key, count = events.len(), "cache hit");
                return Ok(ReadResult::new(range.from_version, events, range.max_count));
            }
        }

        let span = range.to_version - range.from_version;
        let limit = (range.max_count as u64).min(span) as usize;
        let events = if limit == 0 {
            Vec::new()
        } else {
            let records = deadline
                .run(self.log.read(
                    &range.stream_id,
                    range.from_version,
                    ReadDirection::Forwards,
                    limit,
                ))
                .await??;
            decode_contiguous(&range.stream_id, range.from_version, records)?
        };

        // A page cut short by max_count is not the whole range and must not
        // answer later reads of the same key.
        let complete = events.len() as u64 == span || events.len() < limit;
        if let Some(cache) = &self.cache {
            if complete && !events.is_empty() {
                self.populate(cache.as_ref(), &key, &events, deadline).await;
            }
        }

        Ok(ReadResult::new(range.from_version, events, range.max_count))
    }

    fn validate(&self, range: &ReadRange) -> Result<()> {
        validate_stream_id(&range.stream_id)?;
        if range.to_version < range.from_version {
            return Err(Error::Validation(format!(
                "to_version {} is before from_version {}",
                range.to_version, range.from_version
            )));
        }
        if range.max_count == 0 {
            return Err(Error::Validation("max_count must be positive".to_string()));
        }
        if range.max_count > self.max_count_limit {
            return Err(Error::Validation(format!(
                "max_count {} exceeds limit {}",
                range.max_count, self.max_count_limit
            )));
        }
        Ok(())
    }

    /// Cached events for `key`. Faults and undecodable payloads count as a miss.
    async fn cached(
        &self,
        cache: &dyn Cache,
        key: &str,
        deadline: Deadline,
    ) -> Result<Option<Vec<Event>>> {
        match deadline.run(cache.get(key)).await? {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Event>>(&bytes) {
                Ok(events) => Ok(Some(events)),
                Err(e) => {
                    warn!(%key, error = %e, "discarding undecodable cache entry");
                    Ok(None)
                }
            },
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(%key, error = %e, "cache get failed, reading from log");
                Ok(None)
            }
        }
    }

    async fn populate(&self, cache: &dyn Cache, key: &str, events: &[Event], deadline: Deadline) {
        let bytes = match serde_json::to_vec(events) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%key, error = %e, "failed to encode events for cache");
                return;
            }
        };
        match deadline.run(cache.set(key, bytes, self.ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%key, error = %e, "cache set failed"),
            Err(_) => debug!(%key, "deadline reached before cache set finished"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::events::{EventInput, ExpectedVersion};
    use crate::log::InMemoryDurableLog;
    use serde_json::json;

    async fn seeded(count: usize) -> Arc<InMemoryDurableLog> {
        let log = Arc::new(InMemoryDurableLog::new());
        let events = (0..count)
            .map(|i| {
                EventInput::new("Tick", json!({ "n": i }))
                    .encode(uuid::Uuid::now_v7())
                    .unwrap()
            })
            .collect();
        log.append("s", ExpectedVersion::NoStream, events)
            .await
            .unwrap();
        log
    }

    fn pipeline(log: Arc<InMemoryDurableLog>, cache: Arc<InMemoryCache>) -> ReadPipeline {
        ReadPipeline::new(log, &ReadConfig::default()).with_cache(cache, &CacheConfig::default())
    }

    #[tokio::test]
    async fn second_identical_read_hits_cache() {
        let log = seeded(3).await;
        let cache = Arc::new(InMemoryCache::new());
        let reads = pipeline(log.clone(), cache.clone());
        let range = ReadRange::new("s", 0, 10, 10);

        let first = reads.read(&range, Deadline::none()).await.unwrap();
        let second = reads.read(&range, Deadline::none()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(log.read_count(), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(
            serde_json::to_vec(&first.events).unwrap(),
            serde_json::to_vec(&second.events).unwrap()
        );
    }

    #[tokio::test]
    async fn cache_hit_is_capped_by_max_count() {
        let log = seeded(5).await;
        let cache = Arc::new(InMemoryCache::new());
        let reads = pipeline(log.clone(), cache);

        reads
            .read(&ReadRange::new("s", 0, 5, 5), Deadline::none())
            .await
            .unwrap();
        let narrow = reads
            .read(&ReadRange::new("s", 0, 5, 2), Deadline::none())
            .await
            .unwrap();

        assert_eq!(narrow.events.len(), 2);
        assert_eq!(narrow.next_version, 2);
        assert!(!narrow.is_end_of_stream);
        assert_eq!(log.read_count(), 1);
    }

    #[tokio::test]
    async fn short_page_does_not_answer_wider_read() {
        let log = seeded(5).await;
        let cache = Arc::new(InMemoryCache::new());
        let reads = pipeline(log.clone(), cache.clone());

        let narrow = reads
            .read(&ReadRange::new("s", 0, 10, 2), Deadline::none())
            .await
            .unwrap();
        assert_eq!(narrow.events.len(), 2);
        assert!(!narrow.is_end_of_stream);
        assert!(cache.is_empty().await);

        let wide = reads
            .read(&ReadRange::new("s", 0, 10, 10), Deadline::none())
            .await
            .unwrap();
        assert_eq!(wide.events.len(), 5);
        assert_eq!(wide.next_version, 5);
        assert!(wide.is_end_of_stream);
        assert_eq!(log.read_count(), 2);
    }

    #[tokio::test]
    async fn read_reaching_head_is_cached() {
        let log = seeded(3).await;
        let cache = Arc::new(InMemoryCache::new());
        let reads = pipeline(log.clone(), cache.clone());

        reads
            .read(&ReadRange::new("s", 0, 10, 5), Deadline::none())
            .await
            .unwrap();
        let again = reads
            .read(&ReadRange::new("s", 0, 10, 8), Deadline::none())
            .await
            .unwrap();
        assert_eq!(again.events.len(), 3);
        assert!(again.is_end_of_stream);
        assert_eq!(log.read_count(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let log = seeded(0).await;
        let cache = Arc::new(InMemoryCache::new());
        let reads = pipeline(log.clone(), cache.clone());
        let range = ReadRange::new("s", 0, 10, 10);

        let result = reads.read(&range, Deadline::none()).await.unwrap();
        assert!(result.events.is_empty());
        assert!(result.is_end_of_stream);
        assert_eq!(result.next_version, 0);

        reads.read(&range, Deadline::none()).await.unwrap();
        assert_eq!(log.read_count(), 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn cache_fault_degrades_to_log_read() {
        let log = seeded(2).await;
        let cache = Arc::new(InMemoryCache::new());
        cache.set_unavailable(true);
        let reads = pipeline(log.clone(), cache);

        let result = reads
            .read(&ReadRange::new("s", 0, 2, 10), Deadline::none())
            .await
            .unwrap();
        assert_eq!(result.events.len(), 2);
    }

    #[tokio::test]
    async fn consistent_read_bypasses_cache() {
        let log = seeded(2).await;
        let cache = Arc::new(InMemoryCache::new());
        let reads = pipeline(log.clone(), cache.clone());
        let range = ReadRange::new("s", 0, 10, 10);

        reads.read(&range, Deadline::none()).await.unwrap();
        reads
            .read(&range.clone().consistent(), Deadline::none())
            .await
            .unwrap();
        assert_eq!(log.read_count(), 2);
        assert_eq!(cache.hits(), 0);
    }

    #[tokio::test]
    async fn range_is_end_exclusive() {
        let log = seeded(6).await;
        let reads = ReadPipeline::new(log, &ReadConfig::default());

        let result = reads
            .read(&ReadRange::new("s", 2, 4, 10), Deadline::none())
            .await
            .unwrap();
        let versions: Vec<u64> = result.events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(result.next_version, 4);
    }

    #[tokio::test]
    async fn rejects_bad_ranges() {
        let log = seeded(1).await;
        let reads = ReadPipeline::new(log.clone(), &ReadConfig::default());

        for range in [
            ReadRange::new("s", 5, 4, 10),
            ReadRange::new("s", 0, 4, 0),
            ReadRange::new("s", 0, 4, 1001),
            ReadRange::new("", 0, 4, 10),
        ] {
            let err = reads.read(&range, Deadline::none()).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{:?}", range);
        }
        assert_eq!(log.read_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_log_is_surfaced() {
        let log = seeded(1).await;
        log.set_unavailable(true);
        let reads = ReadPipeline::new(log, &ReadConfig::default());
        let err = reads
            .read(&ReadRange::new("s", 0, 1, 1), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }
}
