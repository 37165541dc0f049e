//! `evstore serve`: run the projection and snapshot managers until Ctrl+C.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use evstore_core::config::ProjectionSource;
use evstore_core::projection::{stream_summary_fold, stream_summary_projection};
use evstore_core::{RuntimeBuilder, StateFold, TypedFold};
use tracing::{info, warn};

use crate::config::ConfigLoader;
use crate::store::{Stores, connect_bus};

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Tail the event log for projections even when the bus is enabled
    #[arg(long)]
    pub tail_log: bool,

    /// Do not capture snapshots
    #[arg(long)]
    pub no_snapshots: bool,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let mut config = ConfigLoader::load()?;
    let stores = Stores::open(&config.storage).await?;

    let bus = connect_bus(&config).await?;
    if args.tail_log || bus.is_none() {
        config.core = config.core.with_projection_source(ProjectionSource::Log);
    }

    let mut builder = RuntimeBuilder::new(stores.log.clone(), config.core.clone())
        .with_read_models(stores.read_models.clone())
        .with_projection(stream_summary_projection());
    if let Some(bus) = bus {
        builder = builder.with_bus(bus);
    }
    if !args.no_snapshots {
        let fold: Arc<dyn StateFold> = Arc::new(TypedFold::new(stream_summary_fold()));
        builder = builder.with_snapshots(stores.snapshots.clone(), fold);
    }

    let runtime = builder.start().await?;
    info!(
        source = ?runtime.config().projection.source,
        snapshots = !args.no_snapshots,
        "evstore running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if !runtime.shutdown().await {
        warn!("Stopped before every publish completed");
    }
    Ok(())
}
