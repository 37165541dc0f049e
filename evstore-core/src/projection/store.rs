//! Read-model store contract and an in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// A materialized projection plus the cursor that makes its fold idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub state: Value,
    /// Highest version applied from each source stream.
    pub last_applied: BTreeMap<String, u64>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectionRecord {
    pub fn new(state: Value) -> Self {
        Self {
            state,
            last_applied: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn last_applied_version(&self, stream_id: &str) -> Option<u64> {
        self.last_applied.get(stream_id).copied()
    }
}

/// Storage for projections, written only by the projection manager.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    async fn get_projection(&self, key: &str) -> Result<Option<ProjectionRecord>>;

    async fn put_projection(&self, key: &str, record: &ProjectionRecord) -> Result<()>;

    /// All projections whose key starts with `prefix`, ordered by key.
    async fn list_projections(&self, prefix: &str) -> Result<Vec<(String, ProjectionRecord)>>;

    /// Remove every projection whose key starts with `prefix` (for rebuild).
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// In-memory implementation of ReadModelStore for testing.
#[derive(Default)]
pub struct InMemoryReadModelStore {
    records: RwLock<HashMap<String, ProjectionRecord>>,
    puts: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryReadModelStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put_projection` calls.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::StorageUnavailable(
                "in-memory read model store switched off".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReadModelStore for InMemoryReadModelStore {
    async fn get_projection(&self, key: &str) -> Result<Option<ProjectionRecord>> {
        self.ensure_available()?;
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put_projection(&self, key: &str, record: &ProjectionRecord) -> Result<()> {
        self.ensure_available()?;
        self.records
            .write()
            .await
            .insert(key.to_string(), record.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_projections(&self, prefix: &str) -> Result<Vec<(String, ProjectionRecord)>> {
        self.ensure_available()?;
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matching)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.ensure_available()?;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|key, _| !key.starts_with(prefix));
        Ok(before - records.len())
    }
}
