//! `evstore append`: commit one event to a stream.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use evstore_core::{
    Deadline, EventInput, ExpectedVersion, RuntimeBuilder, SaveEventRequest,
};
use serde_json::Value;
use tracing::debug;

use crate::config::ConfigLoader;
use crate::store::{Stores, connect_bus};

#[derive(Debug, Args)]
pub struct AppendArgs {
    /// Stream to append to
    pub stream_id: String,

    /// Event type, e.g. UserRegistered
    pub event_type: String,

    /// JSON payload
    #[arg(short, long, default_value = "{}")]
    pub data: String,

    /// Expected stream length: a number, "any" or "no-stream"
    #[arg(short, long, default_value = "any")]
    pub expected: ExpectedVersion,

    #[arg(long)]
    pub aggregate_id: Option<String>,

    #[arg(long)]
    pub correlation_id: Option<String>,

    #[arg(long)]
    pub user_id: Option<String>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}

impl AppendArgs {
    fn event(&self) -> Result<EventInput> {
        let data: Value = serde_json::from_str(&self.data).context("--data is not valid JSON")?;
        let mut event = EventInput::new(&self.event_type, data);
        if let Some(id) = &self.aggregate_id {
            event = event.with_aggregate_id(id);
        }
        if let Some(id) = &self.correlation_id {
            event = event.with_correlation_id(id);
        }
        if let Some(id) = &self.user_id {
            event = event.with_user_id(id);
        }
        Ok(event)
    }
}

pub async fn run(args: AppendArgs) -> Result<()> {
    let event = args.event()?;
    let config = ConfigLoader::load()?;
    let stores = Stores::open(&config.storage).await?;

    let mut builder = RuntimeBuilder::new(stores.log.clone(), config.core.clone());
    if let Some(bus) = connect_bus(&config).await? {
        builder = builder.with_bus(bus);
    }
    let runtime = builder.start().await?;

    let request = SaveEventRequest::new(&args.stream_id, vec![event]).expecting(args.expected);
    let result = runtime
        .service()
        .save_event(request, Deadline::after(Duration::from_secs(args.timeout)))
        .await;

    if !runtime.shutdown().await {
        debug!("Exited before every publish completed");
    }

    let response = result?;
    for id in &response.event_ids {
        println!("{}", id);
    }
    println!(
        "{}: next expected version {}",
        args.stream_id, response.next_expected_version
    );
    Ok(())
}
