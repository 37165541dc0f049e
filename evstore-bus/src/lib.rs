//! Message bus for fanning out committed events.
//!
//! The event store publishes every committed event to a topic chosen from its
//! type. Downstream readers (the projection manager among them) subscribe to
//! one or more topics as a consumer group and track their own offsets.
//!
//! # Key Types
//!
//! - [`MessageBus`] - Trait for publishing messages and creating consumers
//! - [`BusConsumer`] - Trait for polling messages with offset tracking
//! - [`InMemoryMessageBus`] - Partitioned in-process bus for tests and local runs
//! - [`IggyMessageBus`] - Iggy-backed implementation of MessageBus

pub mod config;
pub mod error;
pub mod iggy_bus;
pub mod memory;
pub mod traits;

// Re-exports
pub use config::BusConfig;
pub use error::{Error, Result};
pub use iggy_bus::IggyMessageBus;
pub use memory::InMemoryMessageBus;
pub use traits::{
    BusConsumer, BusMessage, MessageBatch, MessageBus, MessageHeaders, Offset, SeekPosition,
};
