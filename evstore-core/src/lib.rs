//! evstore-core: append, read, project and snapshot ordered event streams.
//!
//! This crate holds the systems part of the event store:
//!
//! - **Append pipeline** - [`append::AppendPipeline`] validates a batch, commits it
//!   atomically to the [`log::DurableLog`] under optimistic concurrency, then
//!   hands the committed events to the bus without blocking the writer
//! - **Read pipeline** - [`read::ReadPipeline`] serves version ranges cache-aside
//!   over the durable log
//! - **Projection manager** - [`projection::ProjectionManager`] folds committed
//!   events into read models, idempotently and in per-stream version order
//! - **Snapshot manager** - [`snapshot::SnapshotManager`] periodically captures
//!   compacted stream state to bound replay cost
//! - **Service facade** - [`service::EventStoreService`] exposes `SaveEvent` and
//!   `LoadEvents`; [`runtime::EventStoreRuntime`] owns the background managers
//!
//! # Architecture
//!
//! ```text
//!   SaveEvent ──► AppendPipeline ──► DurableLog ◄── ReadPipeline ◄── LoadEvents
//!                      │                 │  ▲             │
//!                      │ (spawned)       │  │             └──► Cache
//!                      ▼                 │  │
//!                 MessageBus             │  └── gap repair / rehydrate
//!                      │                 │
//!                      ▼                 ▼
//!             ProjectionManager    SnapshotManager
//!                      │                 │
//!                      ▼                 ▼
//!              ReadModelStore      SnapshotStore
//! ```
//!
//! Every collaborator is injected through a trait object; there is no
//! process-wide state.

pub mod append;
pub mod cache;
pub mod config;
pub mod deadline;
pub mod error;
pub mod events;
pub mod fold;
pub mod log;
pub mod projection;
pub mod publish;
pub mod read;
pub mod runtime;
pub mod service;
pub mod snapshot;
mod sql;
pub mod topics;

// Re-export key types for convenience
pub use config::EventStoreConfig;
pub use deadline::Deadline;
pub use error::{Error, Result};
pub use events::{Event, EventInput, ExpectedVersion};
pub use fold::{Fold, StateFold, TypedFold};
pub use runtime::{EventStoreRuntime, RuntimeBuilder};
pub use sql::TursoTarget;
pub use service::{
    EventStoreService, LoadEventsRequest, LoadEventsResponse, SaveEventRequest,
    SaveEventResponse,
};
