//! Turso/libSQL implementation of the snapshot store.

use async_trait::async_trait;
use libsql::{Connection, Database};
use tokio::sync::Mutex;
use tracing::instrument;

use super::store::{Snapshot, SnapshotStore};
use crate::error::{Error, Result};
use crate::sql::{self, TursoTarget, format_datetime, from_sql_int, parse_datetime, to_sql_int};

/// SQL schema for the snapshots table.
const SCHEMA_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    stream_id TEXT NOT NULL,
    fold TEXT NOT NULL,
    version INTEGER NOT NULL,
    state TEXT NOT NULL,
    taken_at TEXT NOT NULL,
    PRIMARY KEY (stream_id, fold, version)
)
"#;

const SELECT_COLUMNS: &str = "SELECT stream_id, fold, version, state, taken_at FROM snapshots";

/// Turso-backed snapshot store.
pub struct TursoSnapshotStore {
    _db: Database,
    conn: Mutex<Connection>,
}

impl TursoSnapshotStore {
    pub async fn open(target: TursoTarget<'_>) -> Result<Self> {
        let opened = sql::open(target).await?;
        let store = Self {
            _db: opened.db,
            conn: Mutex::new(opened.conn),
        };
        store
            .conn
            .lock()
            .await
            .execute(SCHEMA_SNAPSHOTS, ())
            .await?;
        Ok(store)
    }

    /// Create a store backed by an in-memory database (for testing).
    pub async fn new_memory() -> Result<Self> {
        Self::open(TursoTarget::Memory).await
    }

    fn parse_snapshot(row: &libsql::Row) -> Result<Snapshot> {
        let stream_id: String = row.get(0)?;
        let fold: String = row.get(1)?;
        let version: i64 = row.get(2)?;
        let state_json: String = row.get(3)?;
        let taken_at_str: String = row.get(4)?;

        Ok(Snapshot {
            stream_id,
            fold,
            version: from_sql_int(version),
            state: serde_json::from_str(&state_json)?,
            taken_at: parse_datetime(&taken_at_str).map_err(Error::StorageUnavailable)?,
        })
    }
}

#[async_trait]
impl SnapshotStore for TursoSnapshotStore {
    #[instrument(skip(self), level = "debug")]
    async fn latest(&self, stream_id: &str, fold: &str) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "{} WHERE stream_id = ? AND fold = ? ORDER BY version DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                libsql::params![stream_id.to_string(), fold.to_string()],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::parse_snapshot(&row)?))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self, snapshot), fields(stream_id = %snapshot.stream_id, version = snapshot.version), level = "debug")]
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let state_json = serde_json::to_string(&snapshot.state)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (stream_id, fold, version, state, taken_at) VALUES (?, ?, ?, ?, ?)",
            libsql::params![
                snapshot.stream_id.clone(),
                snapshot.fold.clone(),
                to_sql_int(snapshot.version),
                state_json,
                format_datetime(snapshot.taken_at)
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, stream_id: &str) -> Result<Vec<Snapshot>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("{} WHERE stream_id = ? ORDER BY version DESC", SELECT_COLUMNS),
                [stream_id.to_string()],
            )
            .await?;

        let mut snapshots = Vec::new();
        while let Some(row) = rows.next().await? {
            snapshots.push(Self::parse_snapshot(&row)?);
        }
        Ok(snapshots)
    }

    #[instrument(skip(self), level = "debug")]
    async fn prune(&self, stream_id: &str, fold: &str, keep: usize) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM snapshots WHERE stream_id = ?1 AND fold = ?2 AND version NOT IN \
                 (SELECT version FROM snapshots WHERE stream_id = ?1 AND fold = ?2 ORDER BY version DESC LIMIT ?3)",
                libsql::params![
                    stream_id.to_string(),
                    fold.to_string(),
                    to_sql_int(keep as u64)
                ],
            )
            .await?;
        Ok(removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn snapshot(version: u64) -> Snapshot {
        Snapshot {
            stream_id: "cart-1".to_string(),
            version,
            fold: "cart".to_string(),
            state: json!({ "items": version }),
            taken_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_latest_and_prune() {
        let store = TursoSnapshotStore::new_memory().await.unwrap();
        for v in [10, 30, 20, 40] {
            store.save(&snapshot(v)).await.unwrap();
        }

        let latest = store.latest("cart-1", "cart").await.unwrap().unwrap();
        assert_eq!(latest.version, 40);
        assert_eq!(latest.state, json!({"items": 40}));

        assert_eq!(store.prune("cart-1", "cart", 3).await.unwrap(), 1);
        let versions: Vec<u64> = store
            .list("cart-1")
            .await
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![40, 30, 20]);
    }

    #[tokio::test]
    async fn latest_is_scoped_to_fold() {
        let store = TursoSnapshotStore::new_memory().await.unwrap();
        store.save(&snapshot(5)).await.unwrap();
        assert!(store.latest("cart-1", "other").await.unwrap().is_none());
        assert!(store.latest("cart-2", "cart").await.unwrap().is_none());
    }
}
