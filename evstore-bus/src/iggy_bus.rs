//! Iggy-backed MessageBus implementation.
//!
//! Every event topic is an Iggy topic inside one Iggy stream. Messages are
//! partitioned by key, so events sharing a key keep their relative order.
//!
//! # Wire frame
//!
//! An Iggy message payload is a single JSON line with the routing key and
//! headers, a `\n`, then the raw event payload.
//!
//! # Reconnect Buffer
//!
//! When the connection to Iggy is lost, messages are buffered in memory up to
//! `BusConfig::reconnect_buffer`. When the buffer is full, the oldest messages
//! are dropped. When the connection is restored, buffered messages are flushed.
//!
//! Writers are never blocked by Iggy issues; persistence on the bus side is
//! best-effort during transient failures.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use iggy::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::traits::{
    BusConsumer, BusMessage, MessageBatch, MessageBus, MessageHeaders, Offset, SeekPosition,
};

/// Check if an Iggy error indicates a resource already exists.
fn is_already_exists_error(e: &IggyError) -> bool {
    let err_str = e.to_string();
    err_str.contains("already exists")
        || err_str.contains("already_exists")
        || err_str.contains("AlreadyExists")
}

/// Check if an error looks like a lost connection rather than a rejected request.
fn is_connection_error(e: &Error) -> bool {
    let err_str = e.to_string().to_lowercase();
    err_str.contains("connection")
        || err_str.contains("disconnected")
        || err_str.contains("not connected")
        || err_str.contains("broken pipe")
        || err_str.contains("reset")
}

fn named(name: &str) -> Result<Identifier> {
    Identifier::named(name).map_err(|e| Error::Iggy(format!("Invalid identifier '{}': {}", name, e)))
}

/// First line of an Iggy payload.
#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    key: String,
    headers: MessageHeaders,
}

fn encode_frame(message: &BusMessage) -> Result<Vec<u8>> {
    let header = FrameHeader {
        key: message.key.clone(),
        headers: message.headers.clone(),
    };
    let mut frame = serde_json::to_vec(&header)?;
    frame.push(b'\n');
    frame.extend_from_slice(&message.payload);
    Ok(frame)
}

fn decode_frame(topic: &str, frame: &[u8]) -> Result<BusMessage> {
    let split = frame
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| Error::Iggy("frame without header line".into()))?;
    let header: FrameHeader = serde_json::from_slice(&frame[..split])?;
    Ok(BusMessage {
        topic: topic.to_string(),
        key: header.key,
        payload: frame[split + 1..].to_vec(),
        headers: header.headers,
    })
}

fn build_client(config: &BusConfig) -> Result<IggyClient> {
    IggyClient::builder()
        .with_tcp()
        .with_server_address(config.connection_address())
        .build()
        .map_err(|e| Error::Connection(e.to_string()))
}

/// Iggy-backed implementation of MessageBus.
pub struct IggyMessageBus {
    config: BusConfig,

    /// The Iggy client for sending messages.
    client: IggyClient,

    /// Topics created on connect.
    topics: Vec<String>,

    /// Buffer for messages during disconnect.
    reconnect_buffer: RwLock<VecDeque<BusMessage>>,

    /// Whether we're connected to Iggy.
    connected: RwLock<bool>,

    /// When the last reconnect attempt was made.
    last_reconnect: Mutex<Option<tokio::time::Instant>>,
}

impl IggyMessageBus {
    /// Create a new bus client for the given topics.
    ///
    /// Call `connect()` to establish the connection.
    pub fn new(config: BusConfig, topics: Vec<String>) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self {
            config,
            client,
            topics,
            reconnect_buffer: RwLock::new(VecDeque::new()),
            connected: RwLock::new(false),
            last_reconnect: Mutex::new(None),
        })
    }

    /// Connect to the Iggy server.
    ///
    /// This establishes the connection, authenticates, and creates the stream
    /// and every configured topic if they don't exist.
    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await?;
        info!(address = %self.config.connection_address(), "Connected to Iggy server");

        self.client
            .login_user(&self.config.username, &self.config.password)
            .await?;
        debug!(user = %self.config.username, "Logged in to Iggy");

        // Get or create stream
        let streams = self.client.get_streams().await?;
        let stream_id = named(&self.config.stream)?;
        if streams.iter().any(|s| s.name == self.config.stream) {
            debug!(stream = %self.config.stream, "Stream already exists");
        } else {
            match self.client.create_stream(&self.config.stream).await {
                Ok(_) => info!(stream = %self.config.stream, "Created stream"),
                Err(e) if is_already_exists_error(&e) => {
                    debug!("Stream already exists (concurrent creation)");
                }
                Err(e) => return Err(e.into()),
            }
        }

        for topic in &self.topics {
            match self
                .client
                .create_topic(
                    &stream_id,
                    topic,
                    self.config.partitions,
                    CompressionAlgorithm::None,
                    None, // replication_factor
                    IggyExpiry::NeverExpire,
                    MaxTopicSize::ServerDefault,
                )
                .await
            {
                Ok(_) => info!(topic = %topic, partitions = self.config.partitions, "Created topic"),
                Err(e) if is_already_exists_error(&e) => {
                    debug!(topic = %topic, "Topic already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }

        *self.connected.write().await = true;
        info!("IggyMessageBus fully connected and ready");

        // Flush any buffered messages from a previous disconnection
        self.flush_buffer().await?;

        Ok(())
    }

    /// Check if connected to Iggy.
    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    /// Internal send that doesn't handle reconnection.
    async fn try_send(&self, message: &BusMessage) -> Result<()> {
        if !self.topics.iter().any(|t| t == &message.topic) {
            return Err(Error::UnknownTopic(message.topic.clone()));
        }

        let payload = encode_frame(message)?;
        let iggy_message = IggyMessage::builder()
            .payload(payload.into())
            .build()
            .map_err(|e| Error::Iggy(e.to_string()))?;

        // Partition by key (consistent hashing)
        let partitioning = Partitioning::messages_key_str(&message.key).map_err(|e| {
            Error::Iggy(format!(
                "Failed to create partition key '{}': {}",
                message.key, e
            ))
        })?;

        let stream_id = named(&self.config.stream)?;
        let topic_id = named(&message.topic)?;

        let mut messages = [iggy_message];
        self.client
            .send_messages(&stream_id, &topic_id, &partitioning, &mut messages)
            .await?;

        Ok(())
    }

    /// Buffer a message when disconnected.
    async fn buffer_message(&self, message: BusMessage) {
        let mut buffer = self.reconnect_buffer.write().await;

        if buffer.len() >= self.config.reconnect_buffer {
            warn!(
                buffer_size = buffer.len(),
                "Reconnect buffer full, dropping oldest message"
            );
            buffer.pop_front();
        }

        buffer.push_back(message);
        debug!(
            buffer_size = buffer.len(),
            "Buffered message during disconnect"
        );
    }

    /// Flush buffered messages after reconnection.
    ///
    /// On a connection error the failed message and everything after it go
    /// back to the front of the buffer. Messages Iggy rejects outright are
    /// dropped.
    async fn flush_buffer(&self) -> Result<()> {
        let mut pending = std::mem::take(&mut *self.reconnect_buffer.write().await);

        if pending.is_empty() {
            return Ok(());
        }

        info!(count = pending.len(), "Flushing reconnect buffer to Iggy");

        while let Some(message) = pending.pop_front() {
            match self.try_send(&message).await {
                Ok(()) => {}
                Err(e) if is_connection_error(&e) => {
                    pending.push_front(message);
                    self.requeue(pending).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        topic = %message.topic,
                        key = %message.key,
                        error = %e,
                        "Dropping undeliverable buffered message"
                    );
                }
            }
        }

        Ok(())
    }

    /// Put unsent messages back ahead of anything buffered since the flush began.
    async fn requeue(&self, mut unsent: VecDeque<BusMessage>) {
        let mut buffer = self.reconnect_buffer.write().await;
        unsent.extend(buffer.drain(..));

        let overflow = unsent.len().saturating_sub(self.config.reconnect_buffer);
        if overflow > 0 {
            warn!(dropped = overflow, "Reconnect buffer full, dropping oldest messages");
            unsent.drain(..overflow);
        }
        debug!(buffer_size = unsent.len(), "Requeued unsent messages");
        *buffer = unsent;
    }

    /// Reconnect if the last attempt is older than the configured interval.
    async fn maybe_reconnect(&self) {
        let mut last = self.last_reconnect.lock().await;
        let now = tokio::time::Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < self.config.reconnect_interval) {
            return;
        }
        *last = Some(now);
        drop(last);

        if let Err(e) = self.connect().await {
            warn!(error = %e, "Reconnect to Iggy failed");
        }
    }
}

#[async_trait]
impl MessageBus for IggyMessageBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        if !self.is_connected().await {
            self.maybe_reconnect().await;
            if !self.is_connected().await {
                self.buffer_message(message).await;
                return Ok(());
            }
        }

        match self.try_send(&message).await {
            Ok(()) => {
                debug!(topic = %message.topic, key = %message.key, "Published message to Iggy");
                Ok(())
            }
            Err(e) if is_connection_error(&e) => {
                warn!(error = %e, "Connection error, buffering message");
                self.buffer_message(message).await;
                *self.connected.write().await = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn consumer(&self, group: &str, topics: &[String]) -> Result<Box<dyn BusConsumer>> {
        // Each consumer needs its own connection
        let consumer_client = build_client(&self.config)?;
        consumer_client.connect().await?;
        consumer_client
            .login_user(&self.config.username, &self.config.password)
            .await?;

        let mut consumer = IggyBusConsumer {
            client: consumer_client,
            stream: self.config.stream.clone(),
            group: group.to_string(),
            topics: topics.to_vec(),
            partitions: self.config.partitions,
            offsets: HashMap::new(),
        };
        consumer.load_committed().await?;

        Ok(Box::new(consumer))
    }
}

/// Iggy-backed consumer implementation.
///
/// Polls every partition of every subscribed topic and tracks offsets per
/// partition.
pub struct IggyBusConsumer {
    client: IggyClient,
    stream: String,
    group: String,
    topics: Vec<String>,
    partitions: u32,
    /// Next offset to read, per topic and partition.
    offsets: HashMap<String, Vec<u64>>,
}

impl IggyBusConsumer {
    fn iggy_consumer(&self) -> Result<Consumer> {
        Ok(Consumer::new(named(&self.group)?))
    }

    /// Resume from offsets stored on the server for this group.
    async fn load_committed(&mut self) -> Result<()> {
        let stream_id = named(&self.stream)?;
        let consumer = self.iggy_consumer()?;

        for topic in &self.topics {
            let topic_id = named(topic)?;
            let mut offsets = vec![0u64; self.partitions as usize];
            for partition_id in 0..self.partitions {
                match self
                    .client
                    .get_consumer_offset(&consumer, &stream_id, &topic_id, Some(partition_id))
                    .await
                {
                    Ok(Some(info)) => offsets[partition_id as usize] = info.stored_offset + 1,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(topic = %topic, partition = partition_id, error = %e,
                            "Could not load stored offset, starting partition from beginning");
                    }
                }
            }
            self.offsets.insert(topic.clone(), offsets);
        }
        Ok(())
    }
}

#[async_trait]
impl BusConsumer for IggyBusConsumer {
    async fn poll(&mut self, max_count: usize, timeout: Duration) -> Result<MessageBatch> {
        let stream_id = named(&self.stream)?;
        let consumer = self.iggy_consumer()?;
        let slots = (self.topics.len() * self.partitions as usize).max(1);
        let per_partition = (max_count / slots).max(1);
        let mut messages = Vec::new();

        for topic in self.topics.clone() {
            let topic_id = named(&topic)?;
            let partitions = self.partitions;
            let offsets = self
                .offsets
                .entry(topic.clone())
                .or_insert_with(|| vec![0; partitions as usize]);

            for partition_id in 0..partitions {
                let idx = partition_id as usize;
                let strategy = PollingStrategy::offset(offsets[idx]);

                let polled = match self
                    .client
                    .poll_messages(
                        &stream_id,
                        &topic_id,
                        Some(partition_id),
                        &consumer,
                        &strategy,
                        per_partition as u32,
                        false, // auto_commit = false (manual commit)
                    )
                    .await
                {
                    Ok(polled) => polled,
                    Err(e) => {
                        // Handle invalid offset errors (e.g., messages were purged)
                        let err_str = e.to_string().to_lowercase();
                        if err_str.contains("offset")
                            || err_str.contains("not found")
                            || err_str.contains("invalid")
                        {
                            warn!(
                                topic = %topic,
                                partition = partition_id,
                                offset = offsets[idx],
                                error = %e,
                                "Invalid offset, resetting to beginning of partition"
                            );
                            offsets[idx] = 0;
                            continue;
                        }
                        return Err(e.into());
                    }
                };

                for msg in polled.messages {
                    let message = decode_frame(&topic, &msg.payload)?;
                    messages.push((msg.header.offset, message));
                    offsets[idx] = msg.header.offset + 1;
                }
            }
        }

        if messages.is_empty() {
            // Iggy polls return immediately; pace empty polls with the timeout.
            tokio::time::sleep(timeout).await;
        }

        Ok(MessageBatch::new(messages))
    }

    async fn commit(&mut self) -> Result<()> {
        let stream_id = named(&self.stream)?;
        let consumer = self.iggy_consumer()?;

        for (topic, offsets) in &self.offsets {
            let topic_id = named(topic)?;
            for (idx, next) in offsets.iter().enumerate() {
                if *next == 0 {
                    continue;
                }
                self.client
                    .store_consumer_offset(
                        &consumer,
                        &stream_id,
                        &topic_id,
                        Some(idx as u32),
                        next - 1,
                    )
                    .await?;
            }
        }

        debug!(group = %self.group, "Committed offsets to Iggy");
        Ok(())
    }

    async fn seek(&mut self, position: SeekPosition) -> Result<()> {
        let partitions = self.partitions as usize;
        for topic in &self.topics {
            let offsets = match position {
                SeekPosition::Beginning => vec![0; partitions],
                // Set to max; poll returns empty until new messages arrive
                SeekPosition::End => vec![u64::MAX; partitions],
                SeekPosition::Offset(o) => vec![o as Offset; partitions],
            };
            self.offsets.insert(topic.clone(), offsets);
        }
        debug!(group = %self.group, "Seeked consumer");
        Ok(())
    }

    fn group(&self) -> &str {
        &self.group
    }
}
