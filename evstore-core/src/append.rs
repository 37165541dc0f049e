//! Append pipeline: validate, encode, commit, then publish.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::events::{Event, EventInput, ExpectedVersion};
use crate::log::DurableLog;
use crate::publish::EventPublisher;

/// Longest accepted stream id or event type, in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// Outcome of a committed append.
#[derive(Debug, Clone)]
pub struct Committed {
    /// Stream length after the commit.
    pub next_expected_version: u64,
    pub events: Vec<Event>,
}

impl Committed {
    pub fn event_ids(&self) -> Vec<Uuid> {
        self.events.iter().map(|e| e.event_id).collect()
    }
}

/// Commits batches to the durable log and schedules their publication.
///
/// The log alone decides the optimistic-concurrency check; the pipeline never
/// retries a conflict or an unavailable log.
#[derive(Clone)]
pub struct AppendPipeline {
    log: Arc<dyn DurableLog>,
    publisher: Option<EventPublisher>,
}

impl AppendPipeline {
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self {
            log,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn publisher(&self) -> Option<&EventPublisher> {
        self.publisher.as_ref()
    }

    #[instrument(skip(self, events, deadline), fields(count = events.len()))]
    pub async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<EventInput>,
        deadline: Deadline,
    ) -> Result<Committed> {
        validate(stream_id, &events)?;
        deadline.check()?;

        let encoded = events
            .iter()
            .map(|input| input.encode(input.event_id.unwrap_or_else(Uuid::now_v7)))
            .collect::<Result<Vec<_>>>()?;

        let outcome = deadline
            .run(self.log.append(stream_id, expected, encoded))
            .await??;

        let committed = outcome
            .committed
            .into_iter()
            .map(Event::from_recorded)
            .collect::<Result<Vec<_>>>()?;

        info!(
            stream_id,
            %expected,
            next = outcome.next_expected_version,
            "appended events"
        );

        match &self.publisher {
            Some(publisher) => publisher.dispatch(committed.clone()),
            None => debug!(stream_id, "no bus configured, skipping publish"),
        }

        Ok(Committed {
            next_expected_version: outcome.next_expected_version,
            events: committed,
        })
    }
}

/// Reject malformed batches before anything touches the log.
pub fn validate(stream_id: &str, events: &[EventInput]) -> Result<()> {
    validate_stream_id(stream_id)?;
    if events.is_empty() {
        return Err(Error::Validation("events must not be empty".to_string()));
    }

    let mut ids = HashSet::with_capacity(events.len());
    for (i, event) in events.iter().enumerate() {
        let event_type = event.event_type.as_str();
        if event_type.is_empty() {
            return Err(Error::Validation(format!("event {}: event_type is empty", i)));
        }
        if event_type.len() > MAX_NAME_LEN {
            return Err(Error::Validation(format!(
                "event {}: event_type longer than {} bytes",
                i, MAX_NAME_LEN
            )));
        }
        if event_type.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!(
                "event {}: event_type '{}' contains whitespace",
                i, event_type
            )));
        }
        if event.data.is_null() {
            return Err(Error::Validation(format!("event {}: data is missing", i)));
        }
        if let Some(id) = event.event_id {
            if !ids.insert(id) {
                return Err(Error::Validation(format!(
                    "event {}: duplicate event_id {} in batch",
                    i, id
                )));
            }
        }
    }
    Ok(())
}

pub fn validate_stream_id(stream_id: &str) -> Result<()> {
    if stream_id.is_empty() {
        return Err(Error::Validation("stream_id is empty".to_string()));
    }
    if stream_id.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "stream_id longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    if stream_id.starts_with('$') {
        return Err(Error::Validation(format!(
            "stream_id '{}' uses the reserved '$' prefix",
            stream_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::log::InMemoryDurableLog;
    use crate::topics::TopicRouter;
    use evstore_bus::InMemoryMessageBus;
    use serde_json::{Value, json};

    fn item(sku: &str) -> EventInput {
        EventInput::new("ItemAdded", json!({ "sku": sku }))
    }

    #[test]
    fn rejects_malformed_batches() {
        assert!(matches!(validate("cart-1", &[]), Err(Error::Validation(_))));
        assert!(validate("", &[item("A")]).is_err());
        assert!(validate("$all", &[item("A")]).is_err());
        assert!(validate(&"s".repeat(257), &[item("A")]).is_err());
        assert!(validate("s", &[EventInput::new("", json!({}))]).is_err());
        assert!(validate("s", &[EventInput::new("Item Added", json!({}))]).is_err());
        assert!(validate("s", &[EventInput::new("ItemAdded", Value::Null)]).is_err());

        let id = Uuid::now_v7();
        let dup = vec![item("A").with_id(id), item("B").with_id(id)];
        assert!(validate("s", &dup).is_err());

        assert!(validate("cart-1", &[item("A"), item("B")]).is_ok());
    }

    #[tokio::test]
    async fn appends_and_generates_ids() {
        let log = Arc::new(InMemoryDurableLog::new());
        let pipeline = AppendPipeline::new(log.clone());

        let fixed = Uuid::now_v7();
        let committed = pipeline
            .append(
                "cart-1",
                ExpectedVersion::Exact(0),
                vec![item("X").with_id(fixed), item("Y")],
                Deadline::none(),
            )
            .await
            .unwrap();

        assert_eq!(committed.next_expected_version, 2);
        let ids = committed.event_ids();
        assert_eq!(ids[0], fixed);
        assert_ne!(ids[1], fixed);
        assert_eq!(committed.events[1].version, 1);
        assert_eq!(committed.events[1].data, json!({"sku": "Y"}));
    }

    #[tokio::test]
    async fn validation_failure_never_reaches_log() {
        let log = Arc::new(InMemoryDurableLog::new());
        let pipeline = AppendPipeline::new(log.clone());

        let err = pipeline
            .append("cart-1", ExpectedVersion::Any, vec![], Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(log.append_count(), 0);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let log = Arc::new(InMemoryDurableLog::new());
        let pipeline = AppendPipeline::new(log);

        pipeline
            .append("cart-1", ExpectedVersion::Exact(0), vec![item("X")], Deadline::none())
            .await
            .unwrap();
        let err = pipeline
            .append("cart-1", ExpectedVersion::Exact(0), vec![item("Y")], Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ConcurrencyConflict { actual: 1, expected: ExpectedVersion::Exact(0), .. }
        ));
    }

    #[tokio::test]
    async fn unavailable_log_surfaces_storage_error() {
        let log = Arc::new(InMemoryDurableLog::new());
        log.set_unavailable(true);
        let pipeline = AppendPipeline::new(log);

        let err = pipeline
            .append("s", ExpectedVersion::Any, vec![item("X")], Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn expired_deadline_fails_fast() {
        let log = Arc::new(InMemoryDurableLog::new());
        let pipeline = AppendPipeline::new(log.clone());
        let deadline = Deadline::after(Duration::ZERO);

        let err = pipeline
            .append("s", ExpectedVersion::Any, vec![item("X")], deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(log.append_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_append() {
        let log = Arc::new(InMemoryDurableLog::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        bus.set_unavailable(true);
        let publisher = EventPublisher::new(bus.clone(), TopicRouter::default());
        let pipeline = AppendPipeline::new(log.clone()).with_publisher(publisher.clone());

        let committed = pipeline
            .append("s", ExpectedVersion::Any, vec![item("X")], Deadline::none())
            .await
            .unwrap();
        assert_eq!(committed.next_expected_version, 1);

        assert!(publisher.drain(Duration::from_secs(1)).await);
        assert_eq!(publisher.failure_count(), 1);
        assert_eq!(log.stream_length("s").await.unwrap(), 1);
    }
}
