//! Shared fixtures for evstore-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use evstore_core::append::AppendPipeline;
use evstore_core::cache::InMemoryCache;
use evstore_core::config::EventStoreConfig;
use evstore_core::log::{DurableLog, InMemoryDurableLog};
use evstore_core::read::ReadPipeline;
use evstore_core::{EventInput, EventStoreService};
use serde_json::json;

/// A service over an in-memory log with a cache in front of reads.
pub struct Harness {
    pub log: Arc<InMemoryDurableLog>,
    pub cache: Arc<InMemoryCache>,
    pub service: EventStoreService,
}

pub fn harness() -> Harness {
    let config = EventStoreConfig::default();
    let log = Arc::new(InMemoryDurableLog::new());
    let cache = Arc::new(InMemoryCache::new());
    let service = service_over(log.clone(), Some(cache.clone()), &config);
    Harness {
        log,
        cache,
        service,
    }
}

pub fn service_over(
    log: Arc<dyn DurableLog>,
    cache: Option<Arc<InMemoryCache>>,
    config: &EventStoreConfig,
) -> EventStoreService {
    let mut read = ReadPipeline::new(log.clone(), &config.read);
    if let Some(cache) = cache {
        read = read.with_cache(cache, &config.cache);
    }
    EventStoreService::new(AppendPipeline::new(log), read)
}

pub fn item_added(sku: &str) -> EventInput {
    EventInput::new("ItemAdded", json!({ "sku": sku }))
}
