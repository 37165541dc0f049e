//! Read-through cache in front of the durable log.
//!
//! The cache is best-effort: a fault on `get` is treated as a miss and a
//! fault on `set` is logged and dropped. It never affects correctness.

mod memory;

pub use memory::InMemoryCache;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Key-value cache with per-entry expiry.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Drop expired entries, returning how many went. Backends that expire
    /// keys on their own keep the default.
    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

/// Cache key for a version range of a stream.
pub fn range_key(stream_id: &str, from_version: u64, to_version: u64) -> String {
    format!("events:{}:{}:{}", stream_id, from_version, to_version)
}
