//! Wiring: builds the service and owns the background managers.
//!
//! ```text
//! RuntimeBuilder::new(log, config)
//!     .with_cache(..)            optional, fronts LoadEvents
//!     .with_bus(..)              optional, fan-out + projection source
//!     .with_read_models(..)      required for projections
//!     .with_projection(..)       any number
//!     .with_snapshots(store, fold)
//!     .start().await?  ──►  EventStoreRuntime { service, managers }
//! ```
//!
//! Every collaborator is passed in explicitly. Two runtimes in one process
//! share nothing unless the caller hands them the same clients.

use std::sync::Arc;

use evstore_bus::MessageBus;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::append::AppendPipeline;
use crate::cache::Cache;
use crate::config::{EventStoreConfig, ProjectionSource};
use crate::error::Result;
use crate::fold::StateFold;
use crate::log::DurableLog;
use crate::projection::{
    BusSource, EventSource, LogTailSource, Projection, ProjectionManager, ReadModelStore,
};
use crate::publish::EventPublisher;
use crate::read::ReadPipeline;
use crate::service::EventStoreService;
use crate::snapshot::{SnapshotManager, SnapshotStore};
use crate::topics::TopicRouter;

/// Checkpoint name of the snapshot manager's log tail.
pub const SNAPSHOT_CHECKPOINT: &str = "snapshots";

/// Collects collaborators for an [`EventStoreRuntime`].
pub struct RuntimeBuilder {
    config: EventStoreConfig,
    log: Arc<dyn DurableLog>,
    cache: Option<Arc<dyn Cache>>,
    bus: Option<Arc<dyn MessageBus>>,
    read_models: Option<Arc<dyn ReadModelStore>>,
    projections: Vec<Projection>,
    snapshots: Option<(Arc<dyn SnapshotStore>, Arc<dyn StateFold>)>,
}

impl RuntimeBuilder {
    pub fn new(log: Arc<dyn DurableLog>, config: EventStoreConfig) -> Self {
        Self {
            config,
            log,
            cache: None,
            bus: None,
            read_models: None,
            projections: Vec::new(),
            snapshots: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Store for projection records and tail checkpoints.
    pub fn with_read_models(mut self, store: Arc<dyn ReadModelStore>) -> Self {
        self.read_models = Some(store);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projections.push(projection);
        self
    }

    pub fn with_snapshots(mut self, store: Arc<dyn SnapshotStore>, fold: Arc<dyn StateFold>) -> Self {
        self.snapshots = Some((store, fold));
        self
    }

    /// Build the service and spawn the background managers.
    pub async fn start(self) -> Result<EventStoreRuntime> {
        let router = TopicRouter::from_config(&self.config.topics);
        let publisher = self
            .bus
            .as_ref()
            .map(|bus| EventPublisher::new(bus.clone(), router.clone()));

        let mut append = AppendPipeline::new(self.log.clone());
        if let Some(publisher) = &publisher {
            append = append.with_publisher(publisher.clone());
        }
        let mut read = ReadPipeline::new(self.log.clone(), &self.config.read);
        if let Some(cache) = &self.cache {
            read = read.with_cache(cache.clone(), &self.config.cache);
        }
        let service = EventStoreService::new(append, read);

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        if let Some(handle) = self.spawn_projections(&router, &shutdown).await? {
            handles.push(("projections", handle));
        }
        if let Some(handle) = self.spawn_snapshots(&shutdown).await? {
            handles.push(("snapshots", handle));
        }
        if let Some(handle) = self.spawn_cache_sweeper(&shutdown) {
            handles.push(("cache-sweeper", handle));
        }

        info!(
            managers = handles.len(),
            bus = self.bus.is_some(),
            cache = self.cache.is_some(),
            "Event store runtime started"
        );

        Ok(EventStoreRuntime {
            service,
            shutdown,
            handles,
            publisher,
            config: self.config,
        })
    }

    async fn spawn_projections(
        &self,
        router: &TopicRouter,
        shutdown: &CancellationToken,
    ) -> Result<Option<JoinHandle<()>>> {
        let config = &self.config.projection;
        if !config.enabled || self.projections.is_empty() {
            return Ok(None);
        }
        let Some(store) = &self.read_models else {
            warn!("Projections registered without a read-model store, not starting");
            return Ok(None);
        };

        let source: Box<dyn EventSource> = match (&self.bus, config.source) {
            (Some(bus), ProjectionSource::Bus) => {
                Box::new(BusSource::subscribe(bus.as_ref(), &config.group, router.topics()).await?)
            }
            (None, ProjectionSource::Bus) => {
                warn!("No bus configured, projections fall back to tailing the log");
                Box::new(LogTailSource::resume(self.log.clone(), store.clone(), &config.group).await?)
            }
            (_, ProjectionSource::Log) => {
                Box::new(LogTailSource::resume(self.log.clone(), store.clone(), &config.group).await?)
            }
        };

        let manager = self
            .projections
            .iter()
            .cloned()
            .fold(
                ProjectionManager::new(store.clone(), self.log.clone(), config.clone()),
                ProjectionManager::register,
            );
        let token = shutdown.clone();
        Ok(Some(tokio::spawn(async move {
            manager.run(source, token).await;
        })))
    }

    async fn spawn_snapshots(&self, shutdown: &CancellationToken) -> Result<Option<JoinHandle<()>>> {
        if !self.config.snapshot.enabled {
            return Ok(None);
        }
        let Some((store, fold)) = &self.snapshots else {
            return Ok(None);
        };

        let source: Box<dyn EventSource> = match &self.read_models {
            Some(checkpoints) => Box::new(
                LogTailSource::resume(self.log.clone(), checkpoints.clone(), SNAPSHOT_CHECKPOINT)
                    .await?,
            ),
            None => Box::new(LogTailSource::from_position(
                self.log.clone(),
                SNAPSHOT_CHECKPOINT,
                0,
            )),
        };

        let manager = SnapshotManager::new(
            self.log.clone(),
            store.clone(),
            fold.clone(),
            self.config.snapshot.clone(),
        );
        Ok(Some(tokio::spawn(manager.run(source, shutdown.clone()))))
    }

    fn spawn_cache_sweeper(&self, shutdown: &CancellationToken) -> Option<JoinHandle<()>> {
        let config = &self.config.cache;
        if !config.enabled || config.purge_interval.is_zero() {
            return None;
        }
        let cache = self.cache.clone()?;
        let mut ticker = tokio::time::interval(config.purge_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let token = shutdown.clone();

        Some(tokio::spawn(async move {
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match cache.purge_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Purged expired cache entries"),
                        Err(e) => warn!(error = %e, "Cache purge failed"),
                    },
                }
            }
        }))
    }
}

/// A running event store: the service plus its background managers.
pub struct EventStoreRuntime {
    service: EventStoreService,
    shutdown: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    publisher: Option<EventPublisher>,
    config: EventStoreConfig,
}

impl EventStoreRuntime {
    pub fn service(&self) -> &EventStoreService {
        &self.service
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    /// Token that stops the managers when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the managers, then wait for in-flight publishes.
    ///
    /// Returns `false` if publishes were still running at the drain timeout.
    pub async fn shutdown(self) -> bool {
        info!("Shutting down event store runtime");
        self.shutdown.cancel();

        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(manager = name, error = %e, "Manager task panicked");
            }
        }

        let drained = match &self.publisher {
            Some(publisher) => publisher.drain(self.config.publish.drain_timeout).await,
            None => true,
        };
        if !drained {
            warn!("Publishes still in flight at drain timeout");
        }
        info!("Event store runtime stopped");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotConfig;
    use crate::deadline::Deadline;
    use crate::events::EventInput;
    use crate::log::InMemoryDurableLog;
    use crate::service::SaveEventRequest;
    use serde_json::json;

    #[tokio::test]
    async fn starts_without_optional_collaborators() {
        let log = Arc::new(InMemoryDurableLog::new());
        let runtime = RuntimeBuilder::new(log.clone(), EventStoreConfig::default())
            .start()
            .await
            .unwrap();

        runtime
            .service()
            .save_event(
                SaveEventRequest::new("s-1", vec![EventInput::new("Created", json!({}))]),
                Deadline::none(),
            )
            .await
            .unwrap();

        assert!(runtime.shutdown().await);
        assert_eq!(log.append_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cache_entries_are_swept() {
        let log = Arc::new(InMemoryDurableLog::new());
        let cache = Arc::new(crate::cache::InMemoryCache::new());
        let config = EventStoreConfig::default().with_cache_ttl(std::time::Duration::from_secs(5));
        let runtime = RuntimeBuilder::new(log, config)
            .with_cache(cache.clone())
            .start()
            .await
            .unwrap();

        runtime
            .service()
            .save_event(
                SaveEventRequest::new("s-1", vec![EventInput::new("Created", json!({}))]),
                Deadline::none(),
            )
            .await
            .unwrap();
        runtime
            .service()
            .load_events(crate::service::LoadEventsRequest::new("s-1", 0, 10, 10), Deadline::none())
            .await
            .unwrap();
        assert_eq!(cache.len().await, 1);

        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        assert!(cache.is_empty().await);

        assert!(runtime.shutdown().await);
    }

    #[tokio::test]
    async fn snapshot_manager_stops_on_shutdown() {
        let log = Arc::new(InMemoryDurableLog::new());
        let fold: Arc<dyn StateFold> = Arc::new(crate::fold::TypedFold::new(
            crate::projection::stream_summary_fold(),
        ));
        let config = EventStoreConfig::default().with_snapshot(SnapshotConfig {
            poll_timeout: std::time::Duration::from_millis(10),
            ..SnapshotConfig::default()
        });
        let runtime = RuntimeBuilder::new(log, config)
            .with_snapshots(Arc::new(crate::snapshot::InMemorySnapshotStore::new()), fold)
            .start()
            .await
            .unwrap();

        assert!(runtime.shutdown().await);
    }
}
