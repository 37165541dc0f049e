//! Snapshot store contract and an in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Fold state of one stream as of `version`, inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_id: String,
    pub version: u64,
    /// Name of the fold that produced `state`.
    pub fold: String,
    pub state: Value,
    pub taken_at: DateTime<Utc>,
}

/// Storage for snapshots keyed by `(stream_id, fold, version)`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Newest snapshot of a stream produced by `fold`.
    async fn latest(&self, stream_id: &str, fold: &str) -> Result<Option<Snapshot>>;

    /// Store a snapshot, replacing one at the same key.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Every snapshot of a stream, newest first.
    async fn list(&self, stream_id: &str) -> Result<Vec<Snapshot>>;

    /// Keep the newest `keep` snapshots of `(stream_id, fold)`. Returns how many were removed.
    async fn prune(&self, stream_id: &str, fold: &str, keep: usize) -> Result<usize>;
}

/// In-memory implementation of SnapshotStore for testing.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Vec<Snapshot>>>,
    saves: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::StorageUnavailable(
                "in-memory snapshot store switched off".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn latest(&self, stream_id: &str, fold: &str) -> Result<Option<Snapshot>> {
        self.ensure_available()?;
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(stream_id).and_then(|list| {
            list.iter()
                .filter(|s| s.fold == fold)
                .max_by_key(|s| s.version)
                .cloned()
        }))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.ensure_available()?;
        let mut snapshots = self.snapshots.write().await;
        let list = snapshots.entry(snapshot.stream_id.clone()).or_default();
        list.retain(|s| !(s.fold == snapshot.fold && s.version == snapshot.version));
        list.push(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, stream_id: &str) -> Result<Vec<Snapshot>> {
        self.ensure_available()?;
        let snapshots = self.snapshots.read().await;
        let mut list = snapshots.get(stream_id).cloned().unwrap_or_default();
        list.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(list)
    }

    async fn prune(&self, stream_id: &str, fold: &str, keep: usize) -> Result<usize> {
        self.ensure_available()?;
        let mut snapshots = self.snapshots.write().await;
        let Some(list) = snapshots.get_mut(stream_id) else {
            return Ok(0);
        };

        let before = list.len();
        if keep == 0 {
            list.retain(|s| s.fold != fold);
            return Ok(before - list.len());
        }

        let mut versions: Vec<u64> = list
            .iter()
            .filter(|s| s.fold == fold)
            .map(|s| s.version)
            .collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        let Some(&cutoff) = versions.get(keep - 1) else {
            return Ok(0);
        };
        list.retain(|s| s.fold != fold || s.version >= cutoff);
        Ok(before - list.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(stream: &str, version: u64) -> Snapshot {
        Snapshot {
            stream_id: stream.to_string(),
            version,
            fold: "cart".to_string(),
            state: json!({ "v": version }),
            taken_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn latest_picks_highest_version_for_fold() {
        let store = InMemorySnapshotStore::new();
        store.save(&snapshot("s", 4)).await.unwrap();
        store.save(&snapshot("s", 9)).await.unwrap();
        let mut other = snapshot("s", 20);
        other.fold = "other".to_string();
        store.save(&other).await.unwrap();

        let latest = store.latest("s", "cart").await.unwrap().unwrap();
        assert_eq!(latest.version, 9);
        assert!(store.latest("missing", "cart").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_newest() {
        let store = InMemorySnapshotStore::new();
        for v in [1, 5, 3, 7] {
            store.save(&snapshot("s", v)).await.unwrap();
        }

        assert_eq!(store.prune("s", "cart", 2).await.unwrap(), 2);
        let versions: Vec<u64> = store
            .list("s")
            .await
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![7, 5]);

        assert_eq!(store.prune("s", "cart", 5).await.unwrap(), 0);
        assert_eq!(store.prune("s", "cart", 0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn save_same_version_replaces() {
        let store = InMemorySnapshotStore::new();
        store.save(&snapshot("s", 2)).await.unwrap();
        let mut newer = snapshot("s", 2);
        newer.state = json!({"replaced": true});
        store.save(&newer).await.unwrap();

        let list = store.list("s").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].state, json!({"replaced": true}));
    }
}
