//! Fire-and-forget fan-out of committed events to the message bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use evstore_bus::{BusMessage, MessageBus, MessageHeaders};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::events::Event;
use crate::topics::TopicRouter;

/// Publishes committed events off the writer's path.
///
/// Each dispatch runs on its own tracked task. A failed publish is logged
/// as a `PublishFailure` and never reported back to the writer; the commit
/// it follows is already durable.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    router: TopicRouter,
    tracker: TaskTracker,
    failures: Arc<AtomicU64>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, router: TopicRouter) -> Self {
        Self {
            bus,
            router,
            tracker: TaskTracker::new(),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Publishes that have failed since start.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Build the bus message for an event: routed topic, aggregate key, headers.
    pub fn message_for(&self, event: &Event) -> Result<BusMessage> {
        let payload = serde_json::to_vec(event)?;
        let mut headers = MessageHeaders::new(event.event_type.clone());
        if let Some(id) = &event.correlation_id {
            headers = headers.with_correlation_id(id.clone());
        }
        if let Some(id) = &event.user_id {
            headers = headers.with_user_id(id.clone());
        }
        let topic = self.router.topic_for(&event.event_type);
        Ok(BusMessage::new(topic, event.aggregate_id.clone(), payload).with_headers(headers))
    }

    /// Publish events in order, continuing past failures.
    ///
    /// Returns the number of events that could not be published.
    pub async fn publish_all(&self, events: &[Event]) -> usize {
        let mut failed = 0;
        for event in events {
            if let Err(e) = self.publish_one(event).await {
                failed += 1;
                self.failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    event_id = %event.event_id,
                    stream_id = %event.stream_id,
                    version = event.version,
                    error = %e,
                    "failed to publish committed event"
                );
            }
        }
        failed
    }

    async fn publish_one(&self, event: &Event) -> Result<()> {
        let message = self.message_for(event)?;
        let topic = message.topic.clone();
        self.bus.publish(message).await.map_err(|e| match Error::from(e) {
            Error::PublishFailure(msg) => Error::PublishFailure(format!("{}: {}", topic, msg)),
            other => other,
        })?;
        debug!(event_id = %event.event_id, %topic, "published event");
        Ok(())
    }

    /// Hand events to a background task and return immediately.
    pub fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let publisher = self.clone();
        self.tracker.spawn(async move {
            publisher.publish_all(&events).await;
        });
    }

    /// Wait for in-flight dispatches, up to `timeout`.
    ///
    /// Returns `true` when every dispatch finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(pending, "publisher drain timed out");
        }
        // Allow dispatches again if the publisher outlives this drain.
        self.tracker.reopen();
        drained
    }
}
