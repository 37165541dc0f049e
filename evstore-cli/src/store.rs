//! Opens the libSQL-backed collaborators named by the storage config.
//!
//! Locally each store gets its own file under the data directory. A remote
//! URL puts all three in the same database, in separate tables.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use evstore_bus::IggyMessageBus;
use evstore_core::TursoTarget;
use evstore_core::log::TursoDurableLog;
use evstore_core::projection::TursoReadModelStore;
use evstore_core::snapshot::TursoSnapshotStore;
use evstore_core::topics::TopicRouter;
use tracing::{debug, info};

use crate::config::{EvstoreConfig, StorageConfig};

pub struct Stores {
    pub log: Arc<TursoDurableLog>,
    pub read_models: Arc<TursoReadModelStore>,
    pub snapshots: Arc<TursoSnapshotStore>,
}

impl Stores {
    pub async fn open(storage: &StorageConfig) -> Result<Self> {
        if storage.url.is_none() {
            std::fs::create_dir_all(&storage.data_dir).with_context(|| {
                format!("Failed to create data dir {}", storage.data_dir.display())
            })?;
            debug!(data_dir = %storage.data_dir.display(), "Using local libSQL files");
        }

        let events = storage.events_db();
        let projections = storage.projections_db();
        let snapshots = storage.snapshots_db();

        Ok(Self {
            log: Arc::new(
                TursoDurableLog::open(target(storage, &events))
                    .await
                    .context("Failed to open event log")?,
            ),
            read_models: Arc::new(
                TursoReadModelStore::open(target(storage, &projections))
                    .await
                    .context("Failed to open read-model store")?,
            ),
            snapshots: Arc::new(
                TursoSnapshotStore::open(target(storage, &snapshots))
                    .await
                    .context("Failed to open snapshot store")?,
            ),
        })
    }
}

fn target<'a>(storage: &'a StorageConfig, local: &'a Path) -> TursoTarget<'a> {
    match storage.url.as_deref() {
        Some(url) => TursoTarget::Remote {
            url,
            token: storage.auth_token.as_deref().unwrap_or_default(),
        },
        None => TursoTarget::Local(local),
    }
}

/// Connect to Iggy when the bus is enabled.
pub async fn connect_bus(config: &EvstoreConfig) -> Result<Option<Arc<IggyMessageBus>>> {
    if !config.bus.enabled {
        return Ok(None);
    }
    let topics = TopicRouter::from_config(&config.core.topics).topics();
    let bus = IggyMessageBus::new(config.bus.iggy.clone(), topics)?;
    bus.connect()
        .await
        .with_context(|| format!("Failed to connect to Iggy at {}", config.bus.iggy.connection_address()))?;
    info!(address = %config.bus.iggy.connection_address(), "Message bus connected");
    Ok(Some(Arc::new(bus)))
}
