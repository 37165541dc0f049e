//! Rebuild a stream's fold state from its newest snapshot plus the tail.

use serde_json::Value;
use tracing::{debug, error, warn};

use super::store::SnapshotStore;
use crate::error::Result;
use crate::events::decode_contiguous;
use crate::fold::StateFold;
use crate::log::{DurableLog, ReadDirection};

/// Fold state of a stream and how it was reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Rehydrated {
    pub state: Value,
    /// Last version folded into `state`; `None` for an empty stream.
    pub version: Option<u64>,
    /// Version of the snapshot replay started from, if any.
    pub snapshot_version: Option<u64>,
    /// Events folded on top of the snapshot (or initial state).
    pub replayed: u64,
    /// Events the fold rejected; their versions still count as folded.
    pub rejected: u64,
}

/// Fold a stream up to its head.
///
/// A missing or unreadable snapshot is never an error: replay falls back to
/// the fold's initial state at version 0. Events the fold rejects are logged
/// and skipped, as the projection manager does.
pub async fn rehydrate(
    log: &dyn DurableLog,
    snapshots: Option<&dyn SnapshotStore>,
    fold: &dyn StateFold,
    stream_id: &str,
    page_size: usize,
) -> Result<Rehydrated> {
    let snapshot = match snapshots {
        Some(store) => match store.latest(stream_id, fold.name()).await {
            Ok(found) => found,
            Err(e) => {
                warn!(stream_id, error = %e, "snapshot lookup failed, replaying from start");
                None
            }
        },
        None => None,
    };

    let (mut state, mut version, snapshot_version) = match snapshot {
        Some(s) => {
            debug!(stream_id, version = s.version, "starting from snapshot");
            (s.state, Some(s.version), Some(s.version))
        }
        None => (fold.initial()?, None, None),
    };

    let page_size = page_size.max(1);
    let mut next = version.map_or(0, |v| v + 1);
    let mut replayed = 0u64;
    let mut rejected = 0u64;
    loop {
        let records = log
            .read(stream_id, next, ReadDirection::Forwards, page_size)
            .await?;
        let count = records.len();
        for event in decode_contiguous(stream_id, next, records)? {
            match fold.apply(state.clone(), &event) {
                Ok(next) => state = next,
                Err(e) if !e.is_transient() => {
                    error!(
                        fold = fold.name(),
                        stream_id,
                        version = event.version,
                        event_id = %event.event_id,
                        error = %e,
                        "Fold rejected event, skipping"
                    );
                    rejected += 1;
                }
                Err(e) => return Err(e),
            }
            version = Some(event.version);
            replayed += 1;
        }
        next += count as u64;
        if count < page_size {
            break;
        }
    }

    Ok(Rehydrated {
        state,
        version,
        snapshot_version,
        replayed,
        rejected,
    })
}
