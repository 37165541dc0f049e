//! Shared libSQL plumbing for the Turso-backed stores.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database};

/// Where a Turso-backed store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TursoTarget<'a> {
    Local(&'a Path),
    Remote { url: &'a str, token: &'a str },
    Memory,
}

/// An open database with the single connection all statements go through.
///
/// One shared connection keeps `:memory:` databases alive and visible to
/// every caller; callers serialize on it with their own lock.
pub(crate) struct Opened {
    pub db: Database,
    pub conn: Connection,
}

/// How long a local writer waits for another process's lock on the file.
pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn open(target: TursoTarget<'_>) -> Result<Opened, libsql::Error> {
    let local_file = matches!(target, TursoTarget::Local(_));
    let db = match target {
        TursoTarget::Local(path) => Builder::new_local(path).build().await?,
        TursoTarget::Remote { url, token } => {
            Builder::new_remote(url.to_string(), token.to_string())
                .build()
                .await?
        }
        TursoTarget::Memory => Builder::new_local(":memory:").build().await?,
    };
    let conn = db.connect()?;
    if local_file {
        // The pragma reports the new value as a row, so it goes through query.
        conn.query(
            &format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT.as_millis()),
            (),
        )
        .await?;
    }
    Ok(Opened { db, conn })
}

/// Convert a u64 counter to SQLite's signed INTEGER.
pub(crate) fn to_sql_int(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

pub(crate) fn from_sql_int(value: i64) -> u64 {
    value.max(0) as u64
}

pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("invalid datetime: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_roundtrip() {
        let now = Utc::now();
        let parsed = parse_datetime(&format_datetime(now)).unwrap();
        assert_eq!(parsed, now);
        assert!(parse_datetime("yesterday").is_err());
    }

    #[test]
    fn int_conversion_saturates() {
        assert_eq!(to_sql_int(u64::MAX), i64::MAX);
        assert_eq!(from_sql_int(-3), 0);
        assert_eq!(from_sql_int(to_sql_int(42)), 42);
    }
}
