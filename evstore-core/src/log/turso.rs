//! Turso/libSQL implementation of the durable log.
//!
//! Can run against:
//! - Remote Turso database (cloud)
//! - Local embedded SQLite file
//! - In-memory database (tests)
//!
//! Every append runs in one `BEGIN IMMEDIATE` transaction, so the
//! expected-version check and the insert cannot interleave with another
//! writer, in this process or another one on the same file. Should a second
//! writer still get past the check, `UNIQUE (stream_id, version)` rejects its
//! insert and the append reports a version conflict.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    AppendOutcome, DurableLog, LogError, LogResult, NewEvent, ReadDirection, RecordedEvent,
};
use crate::events::ExpectedVersion;
use crate::sql::{self, TursoTarget, format_datetime, from_sql_int, parse_datetime, to_sql_int};

/// SQL schema for the events table.
const SCHEMA_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    position INTEGER PRIMARY KEY,
    stream_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    event_id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    data BLOB NOT NULL,
    metadata BLOB NOT NULL,
    UNIQUE (stream_id, version)
)
"#;

/// Constraint message SQLite reports when a stream version is already taken.
const VERSION_TAKEN: &str = "UNIQUE constraint failed: events.stream_id, events.version";

const SELECT_COLUMNS: &str =
    "SELECT stream_id, version, position, event_id, event_type, created_at, data, metadata FROM events";

/// Turso-backed durable log.
pub struct TursoDurableLog {
    _db: Database,
    conn: Mutex<Connection>,
}

impl TursoDurableLog {
    pub async fn open(target: TursoTarget<'_>) -> LogResult<Self> {
        let opened = sql::open(target).await?;
        let log = Self {
            _db: opened.db,
            conn: Mutex::new(opened.conn),
        };
        log.ensure_schema().await?;
        Ok(log)
    }

    /// Create a log backed by an in-memory database (for testing).
    pub async fn new_memory() -> LogResult<Self> {
        Self::open(TursoTarget::Memory).await
    }

    async fn ensure_schema(&self) -> LogResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(SCHEMA_EVENTS, ()).await?;
        Ok(())
    }

    async fn append_in(
        conn: &Connection,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> LogResult<AppendOutcome> {
        let current = Self::count_stream(conn, stream_id).await?;
        if !expected.matches(current) {
            return Err(LogError::WrongExpectedVersion {
                stream_id: stream_id.to_string(),
                expected,
                actual: current,
            });
        }

        let mut batch_ids = HashSet::with_capacity(events.len());
        for event in &events {
            if !batch_ids.insert(event.event_id) {
                return Err(LogError::DuplicateEventId(event.event_id));
            }
            let mut rows = conn
                .query(
                    "SELECT 1 FROM events WHERE event_id = ?",
                    [event.event_id.to_string()],
                )
                .await?;
            if rows.next().await?.is_some() {
                return Err(LogError::DuplicateEventId(event.event_id));
            }
        }

        let mut rows = conn
            .query("SELECT COALESCE(MAX(position) + 1, 0) FROM events", ())
            .await?;
        let first_position = match rows.next().await? {
            Some(row) => from_sql_int(row.get::<i64>(0)?),
            None => 0,
        };

        let created = Utc::now();
        let mut committed = Vec::with_capacity(events.len());
        for (i, event) in events.into_iter().enumerate() {
            let record = RecordedEvent {
                stream_id: stream_id.to_string(),
                version: current + i as u64,
                position: first_position + i as u64,
                event_id: event.event_id,
                event_type: event.event_type,
                created,
                data: event.data,
                metadata: event.metadata,
            };
            conn.execute(
                "INSERT INTO events (position, stream_id, version, event_id, event_type, created_at, data, metadata) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    to_sql_int(record.position),
                    record.stream_id.clone(),
                    to_sql_int(record.version),
                    record.event_id.to_string(),
                    record.event_type.clone(),
                    format_datetime(record.created),
                    record.data.clone(),
                    record.metadata.clone()
                ],
            )
            .await
            .map_err(|e| Self::insert_error(e, stream_id, expected, current))?;
            committed.push(record);
        }

        Ok(AppendOutcome {
            next_expected_version: current + committed.len() as u64,
            committed,
        })
    }

    /// A lost race on `(stream_id, version)` is a version conflict, not an outage.
    fn insert_error(
        err: libsql::Error,
        stream_id: &str,
        expected: ExpectedVersion,
        seen: u64,
    ) -> LogError {
        if err.to_string().contains(VERSION_TAKEN) {
            LogError::WrongExpectedVersion {
                stream_id: stream_id.to_string(),
                expected,
                actual: seen,
            }
        } else {
            err.into()
        }
    }

    async fn count_stream(conn: &Connection, stream_id: &str) -> LogResult<u64> {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM events WHERE stream_id = ?",
                [stream_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(from_sql_int(row.get::<i64>(0)?)),
            None => Ok(0),
        }
    }

    async fn collect(mut rows: libsql::Rows) -> LogResult<Vec<RecordedEvent>> {
        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(Self::parse_event(&row)?);
        }
        Ok(events)
    }

    /// Parse a recorded event from a database row.
    fn parse_event(row: &libsql::Row) -> LogResult<RecordedEvent> {
        let stream_id: String = row.get(0)?;
        let version: i64 = row.get(1)?;
        let position: i64 = row.get(2)?;
        let event_id_str: String = row.get(3)?;
        let event_type: String = row.get(4)?;
        let created_str: String = row.get(5)?;
        let data: Vec<u8> = row.get(6)?;
        let metadata: Vec<u8> = row.get(7)?;

        let event_id = Uuid::parse_str(&event_id_str)
            .map_err(|_| LogError::Corrupt(format!("invalid event id: {}", event_id_str)))?;
        let created = parse_datetime(&created_str).map_err(LogError::Corrupt)?;

        Ok(RecordedEvent {
            stream_id,
            version: from_sql_int(version),
            position: from_sql_int(position),
            event_id,
            event_type,
            created,
            data,
            metadata,
        })
    }
}

#[async_trait]
impl DurableLog for TursoDurableLog {
    #[instrument(skip(self, events), fields(count = events.len()), level = "debug")]
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> LogResult<AppendOutcome> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        match Self::append_in(&tx, stream_id, expected, events).await {
            Ok(outcome) => {
                tx.commit().await?;
                debug!(
                    stream_id,
                    next = outcome.next_expected_version,
                    "committed append"
                );
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(stream_id, error = %rollback, "rollback failed");
                }
                match e {
                    LogError::WrongExpectedVersion {
                        stream_id,
                        expected,
                        ..
                    } => {
                        let actual = Self::count_stream(&conn, &stream_id).await?;
                        Err(LogError::WrongExpectedVersion {
                            stream_id,
                            expected,
                            actual,
                        })
                    }
                    other => Err(other),
                }
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn read(
        &self,
        stream_id: &str,
        from: u64,
        direction: ReadDirection,
        max_count: usize,
    ) -> LogResult<Vec<RecordedEvent>> {
        let sql = match direction {
            ReadDirection::Forwards => format!(
                "{} WHERE stream_id = ? AND version >= ? ORDER BY version ASC LIMIT ?",
                SELECT_COLUMNS
            ),
            ReadDirection::Backwards => format!(
                "{} WHERE stream_id = ? AND version <= ? ORDER BY version DESC LIMIT ?",
                SELECT_COLUMNS
            ),
        };
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &sql,
                libsql::params![
                    stream_id.to_string(),
                    to_sql_int(from),
                    to_sql_int(max_count as u64)
                ],
            )
            .await?;
        Self::collect(rows).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_all(
        &self,
        from_position: u64,
        max_count: usize,
    ) -> LogResult<Vec<RecordedEvent>> {
        let sql = format!(
            "{} WHERE position >= ? ORDER BY position ASC LIMIT ?",
            SELECT_COLUMNS
        );
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &sql,
                libsql::params![to_sql_int(from_position), to_sql_int(max_count as u64)],
            )
            .await?;
        Self::collect(rows).await
    }

    async fn stream_length(&self, stream_id: &str) -> LogResult<u64> {
        let conn = self.conn.lock().await;
        Self::count_stream(&conn, stream_id).await
    }

    async fn head_position(&self) -> LogResult<u64> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT COALESCE(MAX(position) + 1, 0) FROM events", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(from_sql_int(row.get::<i64>(0)?)),
            None => Ok(0),
        }
    }
}
