//! `evstore replay`: rebuild read models or fold a single stream.

use anyhow::Result;
use clap::Args;
use evstore_core::fold::TypedFold;
use evstore_core::projection::{ProjectionManager, stream_summary_fold, stream_summary_projection};
use evstore_core::snapshot::{SnapshotStore, rehydrate};
use tracing::info;

use crate::config::ConfigLoader;
use crate::store::Stores;

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Fold only this stream and print its summary instead of rebuilding
    #[arg(long)]
    pub stream: Option<String>,

    /// Ignore stored snapshots when folding a stream
    #[arg(long, requires = "stream")]
    pub no_snapshot: bool,

    /// Events read per page
    #[arg(long, default_value_t = 500)]
    pub page_size: usize,
}

pub async fn run(args: ReplayArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    let stores = Stores::open(&config.storage).await?;

    match &args.stream {
        Some(stream_id) => {
            let fold = TypedFold::new(stream_summary_fold());
            let snapshots: Option<&dyn SnapshotStore> = if args.no_snapshot {
                None
            } else {
                Some(&*stores.snapshots)
            };
            let rehydrated = rehydrate(
                &*stores.log,
                snapshots,
                &fold,
                stream_id,
                args.page_size,
            )
            .await?;

            match rehydrated.snapshot_version {
                Some(version) => println!(
                    "Folded {} events on top of snapshot at version {}",
                    rehydrated.replayed, version
                ),
                None => println!("Folded {} events from the start", rehydrated.replayed),
            }
            let summary = fold.decode(rehydrated.state)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        None => {
            let manager = ProjectionManager::new(
                stores.read_models.clone(),
                stores.log.clone(),
                config.core.projection.clone(),
            )
            .register(stream_summary_projection());
            let names: Vec<&str> = manager.projections().iter().map(|p| p.name()).collect();
            info!(projections = ?names, "Rebuilding projections");

            let processed = manager.rebuild(args.page_size).await?;
            println!("Rebuilt {} projection(s) from {} events", names.len(), processed);
        }
    }
    Ok(())
}
