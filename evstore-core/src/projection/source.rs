//! Where background managers read committed events from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evstore_bus::{BusConsumer, MessageBus};
use serde_json::json;
use tracing::{debug, warn};

use super::store::{ProjectionRecord, ReadModelStore};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::log::DurableLog;

/// An ordered feed of committed events with a committable read position.
#[async_trait]
pub trait EventSource: Send {
    /// Next batch of at most `max_count` events, waiting up to `timeout`.
    ///
    /// An empty batch means nothing new arrived in time.
    async fn next_batch(&mut self, max_count: usize, timeout: Duration) -> Result<Vec<Event>>;

    /// Mark everything returned so far as processed.
    async fn commit(&mut self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Consumes the topics the append pipeline publishes to.
pub struct BusSource {
    consumer: Box<dyn BusConsumer>,
    topics: Vec<String>,
}

impl BusSource {
    pub async fn subscribe(bus: &dyn MessageBus, group: &str, topics: Vec<String>) -> Result<Self> {
        let consumer = bus
            .consumer(group, &topics)
            .await
            .map_err(|e| Error::StorageUnavailable(format!("bus consumer: {}", e)))?;
        Ok(Self { consumer, topics })
    }
}

#[async_trait]
impl EventSource for BusSource {
    async fn next_batch(&mut self, max_count: usize, timeout: Duration) -> Result<Vec<Event>> {
        let batch = self
            .consumer
            .poll(max_count, timeout)
            .await
            .map_err(|e| Error::StorageUnavailable(format!("bus poll: {}", e)))?;

        let mut events = Vec::with_capacity(batch.len());
        for (offset, message) in batch {
            match serde_json::from_slice::<Event>(&message.payload) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    topic = %message.topic,
                    offset,
                    error = %e,
                    "skipping undecodable bus message"
                ),
            }
        }
        Ok(events)
    }

    async fn commit(&mut self) -> Result<()> {
        self.consumer
            .commit()
            .await
            .map_err(|e| Error::StorageUnavailable(format!("bus commit: {}", e)))
    }

    fn describe(&self) -> String {
        format!("bus group {} on {}", self.consumer.group(), self.topics.join(","))
    }
}

/// Tails the durable log's global commit order.
///
/// With a checkpoint store, the committed position survives restarts under
/// the key `$checkpoint:{name}`.
pub struct LogTailSource {
    log: Arc<dyn DurableLog>,
    checkpoints: Option<Arc<dyn ReadModelStore>>,
    name: String,
    /// Position after the last event handed out.
    read_position: u64,
    committed_position: u64,
}

impl LogTailSource {
    /// Start at `position` without persisting progress.
    pub fn from_position(log: Arc<dyn DurableLog>, name: impl Into<String>, position: u64) -> Self {
        Self {
            log,
            checkpoints: None,
            name: name.into(),
            read_position: position,
            committed_position: position,
        }
    }

    /// Resume from the checkpoint stored under `name`, or from the beginning.
    pub async fn resume(
        log: Arc<dyn DurableLog>,
        checkpoints: Arc<dyn ReadModelStore>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let position = checkpoints
            .get_projection(&checkpoint_key(&name))
            .await?
            .and_then(|record| record.state.get("position").and_then(|p| p.as_u64()))
            .unwrap_or(0);
        debug!(checkpoint = %name, position, "resuming log tail");

        let mut source = Self::from_position(log, name, position);
        source.checkpoints = Some(checkpoints);
        Ok(source)
    }

    /// Position of the next event to hand out.
    pub fn position(&self) -> u64 {
        self.read_position
    }

    pub fn committed_position(&self) -> u64 {
        self.committed_position
    }
}

pub fn checkpoint_key(name: &str) -> String {
    format!("$checkpoint:{}", name)
}

#[async_trait]
impl EventSource for LogTailSource {
    async fn next_batch(&mut self, max_count: usize, timeout: Duration) -> Result<Vec<Event>> {
        let records = self.log.read_all(self.read_position, max_count).await?;
        if records.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        }

        let mut events = Vec::with_capacity(records.len());
        for record in records {
            let position = record.position;
            events.push(Event::from_recorded(record)?);
            self.read_position = position + 1;
        }
        Ok(events)
    }

    async fn commit(&mut self) -> Result<()> {
        if self.committed_position == self.read_position {
            return Ok(());
        }
        if let Some(store) = &self.checkpoints {
            let record = ProjectionRecord::new(json!({ "position": self.read_position }));
            store
                .put_projection(&checkpoint_key(&self.name), &record)
                .await?;
        }
        self.committed_position = self.read_position;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("log tail {} at {}", self.name, self.read_position)
    }
}
