//! Turso/libSQL implementation of the read-model store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use libsql::{Connection, Database};
use tokio::sync::Mutex;
use tracing::instrument;

use super::store::{ProjectionRecord, ReadModelStore};
use crate::error::{Error, Result};
use crate::sql::{self, TursoTarget, format_datetime, parse_datetime};

/// SQL schema for the projections table.
const SCHEMA_PROJECTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS projections (
    key TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    last_applied TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Turso-backed read-model store.
pub struct TursoReadModelStore {
    _db: Database,
    conn: Mutex<Connection>,
}

impl TursoReadModelStore {
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
            .execute(SCHEMA_PROJECTIONS, ())
            .await?;
        Ok(store)
    }

    /// Create a store backed by an in-memory database (for testing).
    pub async fn new_memory() -> Result<Self> {
        Self::open(TursoTarget::Memory).await
    }

    /// Parse a projection from a database row.
    fn parse_row(row: &libsql::Row) -> Result<(String, ProjectionRecord)> {
        let key: String = row.get(0)?;
        let state_json: String = row.get(1)?;
        let last_applied_json: String = row.get(2)?;
        let updated_at_str: String = row.get(3)?;

        let last_applied: BTreeMap<String, u64> = serde_json::from_str(&last_applied_json)?;
        let updated_at = parse_datetime(&updated_at_str).map_err(Error::StorageUnavailable)?;

        Ok((
            key,
            ProjectionRecord {
                state: serde_json::from_str(&state_json)?,
                last_applied,
                updated_at,
            },
        ))
    }
}

/// `LIKE` pattern matching keys that start with `prefix`.
fn like_prefix(prefix: &str) -> String {
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{}%", escaped)
}

#[async_trait]
impl ReadModelStore for TursoReadModelStore {
    #[instrument(skip(self), level = "debug")]
    async fn get_projection(&self, key: &str) -> Result<Option<ProjectionRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT key, state, last_applied, updated_at FROM projections WHERE key = ?",
                [key.to_string()],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::parse_row(&row)?.1))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self, record), level = "debug")]
    async fn put_projection(&self, key: &str, record: &ProjectionRecord) -> Result<()> {
        let state_json = serde_json::to_string(&record.state)?;
        let last_applied_json = serde_json::to_string(&record.last_applied)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projections (key, state, last_applied, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET state = excluded.state, \
             last_applied = excluded.last_applied, updated_at = excluded.updated_at",
            libsql::params![
                key.to_string(),
                state_json,
                last_applied_json,
                format_datetime(record.updated_at)
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_projections(&self, prefix: &str) -> Result<Vec<(String, ProjectionRecord)>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT key, state, last_applied, updated_at FROM projections WHERE key LIKE ? ESCAPE '\\' ORDER BY key ASC",
                [like_prefix(prefix)],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_row(&row)?);
        }
        Ok(records)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM projections WHERE key LIKE ? ESCAPE '\\'",
                [like_prefix(prefix)],
            )
            .await?;
        Ok(removed as usize)
    }
}
