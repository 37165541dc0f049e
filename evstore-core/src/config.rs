//! Configuration for the event store pipelines and background managers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::topics::TopicRoute;

/// Top-level configuration for the event store core.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventStoreConfig {
    pub cache: CacheConfig,
    pub read: ReadConfig,
    pub topics: TopicConfig,
    pub publish: PublishConfig,
    pub projection: ProjectionConfig,
    pub snapshot: SnapshotConfig,
}

impl EventStoreConfig {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = ttl;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache.enabled = false;
        self
    }

    pub fn with_projection_source(mut self, source: ProjectionSource) -> Self {
        self.projection.source = source;
        self
    }

    pub fn with_projection(mut self, projection: ProjectionConfig) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }
}

/// Read-through cache in front of the durable log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// How long a cached range stays valid.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How often the runtime sweeps expired entries out of the cache.
    #[serde(with = "humantime_serde")]
    pub purge_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            purge_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReadConfig {
    /// Upper bound on `max_count` for a single load.
    pub max_count_limit: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            max_count_limit: 1000,
        }
    }
}

/// Event type prefix to bus topic routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicConfig {
    /// Checked in order; the first matching prefix wins.
    pub routes: Vec<TopicRoute>,
    pub default_topic: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            routes: vec![
                TopicRoute::new("User", "user-events"),
                TopicRoute::new("Conversation", "conversation-events"),
                TopicRoute::new("Message", "message-events"),
                TopicRoute::new("AI", "ai-events"),
            ],
            default_topic: "system-events".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    /// How long shutdown waits for in-flight publishes.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Where the projection manager reads committed events from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionSource {
    /// Consume the topics the append pipeline publishes to.
    #[default]
    Bus,
    /// Tail the durable log's global order directly.
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectionConfig {
    pub enabled: bool,
    pub source: ProjectionSource,

    /// Consumer group name on the bus, and checkpoint name on the log tail.
    pub group: String,

    /// Maximum events taken from the source per poll.
    pub batch_size: usize,

    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Number of projection keys folded in parallel.
    pub concurrency: usize,

    /// Wait between retries when a batch cannot be applied.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: ProjectionSource::Bus,
            group: "evstore-projections".to_string(),
            batch_size: 100,
            poll_timeout: Duration::from_secs(1),
            concurrency: 8,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Snapshot capture policy.
///
/// A stream is captured once `every_events` new events have accumulated
/// since its last snapshot. On each `interval` tick, streams with at least
/// `min_events` uncaptured events are captured as well.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    pub every_events: u64,

    pub min_events: u64,

    /// Snapshots retained per stream; older ones are pruned.
    pub keep: usize,

    /// Page size when tailing the log and replaying streams.
    pub batch_size: usize,

    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            every_events: 100,
            min_events: 10,
            keep: 3,
            batch_size: 500,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EventStoreConfig::default();
        assert!(config.cache.enabled);
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.read.max_count_limit, 1000);
        assert_eq!(config.topics.default_topic, "system-events");
        assert_eq!(config.topics.routes.len(), 4);
        assert_eq!(config.projection.source, ProjectionSource::Bus);
        assert_eq!(config.snapshot.keep, 3);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EventStoreConfig = serde_json::from_str(
            r#"{"cache": {"ttl": "30s"}, "projection": {"source": "log", "concurrency": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.cache.ttl, Duration::from_secs(30));
        assert!(config.cache.enabled);
        assert_eq!(config.projection.source, ProjectionSource::Log);
        assert_eq!(config.projection.concurrency, 2);
        assert_eq!(config.projection.batch_size, 100);
        assert_eq!(config.snapshot.interval, Duration::from_secs(60));
    }

    #[test]
    fn builder_setters_override_sections() {
        let config = EventStoreConfig::default()
            .with_cache_ttl(Duration::from_secs(10))
            .with_projection_source(ProjectionSource::Log)
            .without_cache();
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.ttl, Duration::from_secs(10));
        assert_eq!(config.projection.source, ProjectionSource::Log);
    }

    #[test]
    fn durations_serialize_humanized() {
        let json = serde_json::to_value(CacheConfig::default()).unwrap();
        assert_eq!(json["ttl"], "5m");
    }
}
