//! Event stream queries.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum EventsCommands {
    /// List events matching the given filters
    List(ListArgs),

    /// Show a single event by id
    Get {
        /// Event id (UUID)
        id: String,
    },

    /// Show all events and a summary for one correlation id
    Correlation {
        /// Correlation id (c-...)
        id: String,
    },
}

#[derive(Args)]
pub struct ListArgs {
    /// Only events at or after this instant (RFC 3339)
    #[arg(long)]
    since: Option<DateTime<Utc>>,

    /// Only events before this instant (RFC 3339)
    #[arg(long)]
    until: Option<DateTime<Utc>>,

    /// Filter by event type (e.g. PR.MERGED)
    #[arg(long = "type")]
    event_type: Option<String>,

    /// Filter by correlation id tag
    #[arg(long)]
    correlation_id: Option<String>,

    /// Filter by issue id tag
    #[arg(long)]
    issue_id: Option<String>,

    /// Filter by pull request id tag
    #[arg(long)]
    pr_id: Option<String>,

    /// Maximum number of events to return
    #[arg(long)]
    limit: Option<u32>,

    /// Number of events to skip
    #[arg(long)]
    offset: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub schema_version: u32,
    pub actor: Value,
    #[serde(default)]
    pub tags: std::collections::BTreeMap<String, String>,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct EventListResponse {
    pub events: Vec<EventView>,
    pub page: PageMeta,
}

#[derive(Debug, Deserialize)]
pub struct PageMeta {
    pub total: u64,
    pub offset: u64,
    pub limit: u32,
    pub has_more: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationResponse {
    pub events: Vec<EventView>,
    pub summary: CorrelationSummary,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationSummary {
    pub correlation_id: String,
    pub event_count: u64,
    pub distinct_types: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Tabled, Serialize)]
struct EventRow {
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "Type")]
    event_type: String,
    #[tabled(rename = "Actor")]
    actor: String,
    #[tabled(rename = "Tags")]
    tags: String,
    #[tabled(rename = "Id")]
    id: String,
}

impl EventRow {
    fn from_view(event: &EventView) -> Self {
        let actor = event
            .actor
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("-")
            .to_string();
        let tags = event
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            timestamp: event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            event_type: event.event_type.clone(),
            actor,
            tags,
            id: event.id.clone(),
        }
    }
}

pub async fn execute(cmd: EventsCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        EventsCommands::List(args) => list(args, client, format).await,
        EventsCommands::Get { id } => get(&id, client, format).await,
        EventsCommands::Correlation { id } => correlation(&id, client, format).await,
    }
}

async fn list(args: ListArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let mut params: Vec<(&str, String)> = Vec::new();
    if let Some(since) = args.since {
        params.push(("since", since.to_rfc3339()));
    }
    if let Some(until) = args.until {
        params.push(("until", until.to_rfc3339()));
    }
    if let Some(t) = args.event_type {
        params.push(("type", t));
    }
    if let Some(id) = args.correlation_id {
        params.push(("correlationId", id));
    }
    if let Some(id) = args.issue_id {
        params.push(("issueId", id));
    }
    if let Some(id) = args.pr_id {
        params.push(("prId", id));
    }
    if let Some(limit) = args.limit {
        params.push(("limit", limit.to_string()));
    }
    if let Some(offset) = args.offset {
        params.push(("offset", offset.to_string()));
    }

    let path = build_path("/api/v1/events", &params);
    let response: EventListResponse = client.get(&path).await?;

    match format {
        OutputFormat::Table => {
            let rows: Vec<EventRow> = response.events.iter().map(EventRow::from_view).collect();
            output::print_list(&rows, format)?;
            output::print_info(&format!(
                "{} of {} events (offset {})",
                response.events.len(),
                response.page.total,
                response.page.offset
            ));
            if response.page.has_more {
                output::print_info(&format!(
                    "more available: rerun with --offset {}",
                    response.page.offset + response.events.len() as u64
                ));
            }
        }
        _ => output::print_item(&response.events, format)?,
    }
    Ok(())
}

async fn get(id: &str, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let event: EventView = client.get(&format!("/api/v1/events/{}", id)).await?;
    output::print_item(&event, format)
}

async fn correlation(id: &str, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let response: CorrelationResponse = client
        .get(&format!("/api/v1/events/correlation/{}", id))
        .await?;

    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Correlation {}", response.summary.correlation_id));
            output::print_detail("Events", &response.summary.event_count.to_string());
            output::print_detail("Types", &response.summary.distinct_types.join(", "));
            if let Some(started) = response.summary.started_at {
                output::print_detail("Started", &started.to_rfc3339());
            }
            if let Some(ended) = response.summary.ended_at {
                output::print_detail("Ended", &ended.to_rfc3339());
            }
            println!();
            let rows: Vec<EventRow> = response.events.iter().map(EventRow::from_view).collect();
            output::print_list(&rows, format)?;
        }
        _ => output::print_item(&response, format)?,
    }
    Ok(())
}

pub(crate) fn build_path(base: &str, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        return base.to_string();
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", base, query)
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_path_without_params() {
        assert_eq!(build_path("/api/v1/events", &[]), "/api/v1/events");
    }

    #[test]
    fn build_path_encodes_values() {
        let path = build_path(
            "/api/v1/events",
            &[("since", "2026-01-01T00:00:00+00:00".to_string())],
        );
        assert_eq!(path, "/api/v1/events?since=2026-01-01T00%3A00%3A00%2B00%3A00");
    }
}
