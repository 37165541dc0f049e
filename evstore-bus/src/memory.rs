//! Partitioned in-memory MessageBus.
//!
//! Simulates a topic-partitioned broker inside the process:
//! - Topics are created on first publish
//! - Messages are routed to one of `PARTITION_COUNT` partitions by key hash
//! - Each partition has its own offset sequence
//! - Consumer groups track committed offsets per topic and partition
//!
//! Useful for tests and single-process deployments without a broker.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::traits::{BusConsumer, BusMessage, MessageBatch, MessageBus, Offset, SeekPosition};

/// Number of partitions per topic.
pub const PARTITION_COUNT: usize = 8;

type Partitions = [Vec<BusMessage>; PARTITION_COUNT];
type PartitionOffsets = [Offset; PARTITION_COUNT];

/// Shared state between the bus and its consumers.
struct SharedState {
    topics: RwLock<HashMap<String, Partitions>>,
    /// Committed offsets keyed by (group, topic).
    committed: RwLock<HashMap<(String, String), PartitionOffsets>>,
    notify: Notify,
    unavailable: AtomicBool,
    published: AtomicU64,
}

/// In-memory implementation of MessageBus.
#[derive(Clone)]
pub struct InMemoryMessageBus {
    shared: Arc<SharedState>,
}

impl InMemoryMessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedState {
                topics: RwLock::new(HashMap::new()),
                committed: RwLock::new(HashMap::new()),
                notify: Notify::new(),
                unavailable: AtomicBool::new(false),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Get the partition index for a key.
    fn partition_for_key(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % PARTITION_COUNT
    }

    /// Simulate a broker outage: while set, `publish` fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Total number of messages accepted since creation.
    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    /// All messages currently held for a topic, partition by partition.
    pub async fn messages(&self, topic: &str) -> Vec<BusMessage> {
        let topics = self.shared.topics.read().await;
        topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all topics that have received at least one message.
    pub async fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("in-memory bus marked unavailable".into()));
        }

        let partition_id = Self::partition_for_key(&message.key);
        {
            let mut topics = self.shared.topics.write().await;
            let partitions = topics
                .entry(message.topic.clone())
                .or_insert_with(|| std::array::from_fn(|_| Vec::new()));
            trace!(topic = %message.topic, partition = partition_id, "Publishing message");
            partitions[partition_id].push(message);
        }

        self.shared.published.fetch_add(1, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consumer(&self, group: &str, topics: &[String]) -> Result<Box<dyn BusConsumer>> {
        let committed = self.shared.committed.read().await;
        let current = topics
            .iter()
            .map(|topic| {
                let offsets = committed
                    .get(&(group.to_string(), topic.clone()))
                    .copied()
                    .unwrap_or([0; PARTITION_COUNT]);
                (topic.clone(), offsets)
            })
            .collect();

        debug!(group, topics = ?topics, "Created in-memory consumer");
        Ok(Box::new(InMemoryConsumer {
            group: group.to_string(),
            topics: topics.to_vec(),
            shared: Arc::clone(&self.shared),
            current,
        }))
    }
}

/// In-memory consumer implementation.
struct InMemoryConsumer {
    group: String,
    topics: Vec<String>,
    shared: Arc<SharedState>,
    current: HashMap<String, PartitionOffsets>,
}

impl InMemoryConsumer {
    async fn collect(&mut self, max_count: usize) -> MessageBatch {
        let topics = self.shared.topics.read().await;
        let slots = (self.topics.len() * PARTITION_COUNT).max(1);
        let per_partition = (max_count / slots).max(1);
        let mut messages = Vec::new();

        for topic in &self.topics {
            let Some(partitions) = topics.get(topic) else {
                continue;
            };
            let offsets = self
                .current
                .entry(topic.clone())
                .or_insert([0; PARTITION_COUNT]);

            for (partition_id, partition) in partitions.iter().enumerate() {
                if messages.len() >= max_count {
                    break;
                }
                let start = offsets[partition_id] as usize;
                let budget = per_partition.min(max_count - messages.len());
                let end = std::cmp::min(start + budget, partition.len());

                for (i, message) in partition.iter().enumerate().take(end).skip(start) {
                    messages.push((i as Offset, message.clone()));
                }
                if end > start {
                    offsets[partition_id] = end as Offset;
                }
            }
        }

        MessageBatch::new(messages)
    }
}

#[async_trait]
impl BusConsumer for InMemoryConsumer {
    async fn poll(&mut self, max_count: usize, timeout: Duration) -> Result<MessageBatch> {
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);

        loop {
            // Register interest before looking so a publish in between is not missed.
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.collect(max_count).await;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(MessageBatch::empty());
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let mut committed = self.shared.committed.write().await;
        for (topic, offsets) in &self.current {
            committed.insert((self.group.clone(), topic.clone()), *offsets);
        }
        Ok(())
    }

    async fn seek(&mut self, position: SeekPosition) -> Result<()> {
        match position {
            SeekPosition::Beginning => {
                for topic in &self.topics {
                    self.current.insert(topic.clone(), [0; PARTITION_COUNT]);
                }
            }
            SeekPosition::End => {
                let topics = self.shared.topics.read().await;
                for topic in &self.topics {
                    let offsets = topics
                        .get(topic)
                        .map(|partitions| std::array::from_fn(|i| partitions[i].len() as Offset))
                        .unwrap_or([0; PARTITION_COUNT]);
                    self.current.insert(topic.clone(), offsets);
                }
            }
            SeekPosition::Offset(o) => {
                for topic in &self.topics {
                    self.current.insert(topic.clone(), [o; PARTITION_COUNT]);
                }
            }
        }
        Ok(())
    }

    fn group(&self) -> &str {
        &self.group
    }
}
