//! Server health and stream statistics.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Also fetch event stream statistics
    #[arg(long)]
    stats: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StoreStats {
    pub event_count: u64,
    pub blob_count: u64,
    pub blob_bytes: u64,
    pub events_by_type: std::collections::BTreeMap<String, u64>,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: HealthResponse = client.get_raw("/health").await?;

    match format {
        OutputFormat::Table => {
            output::print_success(&format!(
                "server is {} (version {})",
                health.status, health.version
            ));
        }
        _ => output::print_item(&health, format)?,
    }

    if args.stats {
        let stats: StoreStats = client.get("/api/v1/stats").await?;
        match format {
            OutputFormat::Table => {
                output::print_header("Stream statistics");
                output::print_detail("Events", &stats.event_count.to_string());
                output::print_detail("Blobs", &stats.blob_count.to_string());
                output::print_detail("Blob bytes", &stats.blob_bytes.to_string());
                for (event_type, count) in &stats.events_by_type {
                    output::print_detail(event_type, &count.to_string());
                }
            }
            _ => output::print_item(&stats, format)?,
        }
    }
    Ok(())
}
