//! `evstore load`: read a version range of a stream.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use evstore_core::append::AppendPipeline;
use evstore_core::read::ReadPipeline;
use evstore_core::{Deadline, Event, EventStoreService, LoadEventsRequest, LoadEventsResponse};

use crate::config::ConfigLoader;
use crate::store::Stores;

/// Longest payload shown in a table cell.
const DATA_PREVIEW: usize = 60;

#[derive(Debug, Args)]
pub struct LoadArgs {
    /// Stream to read
    pub stream_id: String,

    /// First version to return (inclusive)
    #[arg(long, default_value_t = 0)]
    pub from: u64,

    /// Stop before this version (exclusive); defaults to the stream head
    #[arg(long)]
    pub to: Option<u64>,

    /// Maximum number of events
    #[arg(short = 'n', long, default_value_t = 100)]
    pub max_count: usize,

    /// Print the response as JSON
    #[arg(long)]
    pub json: bool,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}

impl LoadArgs {
    fn request(&self) -> LoadEventsRequest {
        LoadEventsRequest::new(
            &self.stream_id,
            self.from,
            self.to.unwrap_or(u64::MAX),
            self.max_count,
        )
    }
}

pub async fn run(args: LoadArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    let stores = Stores::open(&config.storage).await?;
    let service = EventStoreService::new(
        AppendPipeline::new(stores.log.clone()),
        ReadPipeline::new(stores.log.clone(), &config.core.read),
    );

    let response = service
        .load_events(args.request(), Deadline::after(Duration::from_secs(args.timeout)))
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_table(&args.stream_id, &response);
    }
    Ok(())
}

fn print_table(stream_id: &str, response: &LoadEventsResponse) {
    if response.events.is_empty() {
        println!("No events in {} from this version.", stream_id);
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Version").fg(Color::Cyan),
        Cell::new("Type").fg(Color::Cyan),
        Cell::new("Event ID").fg(Color::Cyan),
        Cell::new("Committed").fg(Color::Cyan),
        Cell::new("Data").fg(Color::Cyan),
    ]);

    for event in &response.events {
        table.add_row(vec![
            Cell::new(event.version),
            Cell::new(&event.event_type),
            Cell::new(event.event_id),
            Cell::new(event.timestamp.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(data_preview(event)),
        ]);
    }

    println!("{table}");
    if response.is_end_of_stream {
        println!("End of stream at version {}.", response.next_version);
    } else {
        println!(
            "More events follow; continue with --from {}.",
            response.next_version
        );
    }
}

fn data_preview(event: &Event) -> String {
    let data = event.data.to_string();
    if data.chars().count() <= DATA_PREVIEW {
        data
    } else {
        let cut: String = data.chars().take(DATA_PREVIEW - 3).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(data: serde_json::Value) -> Event {
        Event {
            event_id: Uuid::now_v7(),
            event_type: "Noted".to_string(),
            stream_id: "s".to_string(),
            version: 0,
            position: 0,
            timestamp: Utc::now(),
            data,
            aggregate_id: "s".to_string(),
            correlation_id: None,
            causation_id: None,
            user_id: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn short_payloads_are_shown_whole() {
        assert_eq!(data_preview(&event(json!({"a": 1}))), r#"{"a":1}"#);
    }

    #[test]
    fn long_payloads_are_truncated() {
        let preview = data_preview(&event(json!({ "text": "x".repeat(200) })));
        assert_eq!(preview.chars().count(), DATA_PREVIEW);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn open_range_reads_to_head() {
        let args = LoadArgs {
            stream_id: "cart-1".to_string(),
            from: 5,
            to: None,
            max_count: 20,
            json: false,
            timeout: 10,
        };
        let req = args.request();
        assert_eq!(req.from_version, 5);
        assert_eq!(req.to_version, u64::MAX);
        assert_eq!(req.max_count, 20);
    }
}
