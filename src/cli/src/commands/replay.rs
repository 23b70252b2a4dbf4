//! Replay a past workflow run, issue, or pull request.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::ApiClient;
use crate::commands::events::{build_path, EventView};
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct ReplayArgs {
    /// Replay everything tagged with this correlation id
    #[arg(long, conflicts_with_all = ["issue_id", "pr_id"])]
    correlation_id: Option<String>,

    /// Replay everything tagged with this issue id
    #[arg(long, conflicts_with = "pr_id")]
    issue_id: Option<String>,

    /// Replay everything tagged with this pull request id
    #[arg(long)]
    pr_id: Option<String>,

    /// Reconstruct state as of this instant (RFC 3339); defaults to now
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,

    /// Restrict the timeline to one event type
    #[arg(long = "type")]
    event_type: Option<String>,

    /// Fail the replay if any referenced blob is missing
    #[arg(long)]
    strict: bool,

    /// Step through the timeline interactively
    #[arg(long, short)]
    interactive: bool,

    /// Write a markdown report to this path
    #[arg(long, value_name = "PATH")]
    report: Option<std::path::PathBuf>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub selector: Value,
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
    pub event_count: u64,
    pub missing_blob_count: u64,
    pub states: BTreeMap<String, BTreeMap<String, Value>>,
    pub timeline: Vec<TimelineEntry>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub event: EventView,
    #[serde(default)]
    pub blobs: Vec<Value>,
}

pub async fn execute(args: ReplayArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let mut params: Vec<(&str, String)> = Vec::new();
    match (&args.correlation_id, &args.issue_id, &args.pr_id) {
        (Some(id), None, None) => params.push(("correlationId", id.clone())),
        (None, Some(id), None) => params.push(("issueId", id.clone())),
        (None, None, Some(id)) => params.push(("prId", id.clone())),
        _ => bail!("exactly one of --correlation-id, --issue-id, --pr-id is required"),
    }
    if let Some(as_of) = args.as_of {
        params.push(("asOf", as_of.to_rfc3339()));
    }
    if let Some(t) = &args.event_type {
        params.push(("type", t.clone()));
    }
    if args.strict {
        params.push(("strict", "true".to_string()));
    }

    if let Some(path) = &args.report {
        let markdown = client
            .get_text(&build_path("/api/v1/replay/report", &params))
            .await?;
        std::fs::write(path, &markdown)?;
        output::print_success(&format!("report written to {}", path.display()));
        return Ok(());
    }

    let result: ReplayResult = client.get(&build_path("/api/v1/replay", &params)).await?;

    if format != OutputFormat::Table {
        return output::print_item(&result, format);
    }

    print_summary(&result);

    if args.interactive {
        step_through(&result.timeline)?;
    } else {
        for (index, entry) in result.timeline.iter().enumerate() {
            print_entry(index, result.timeline.len(), entry);
        }
    }

    print_states(&result.states);
    Ok(())
}

fn print_summary(result: &ReplayResult) {
    output::print_header("Replay");
    output::print_detail("Events", &result.event_count.to_string());
    if let Some(as_of) = result.as_of {
        output::print_detail("As of", &as_of.to_rfc3339());
    }
    if result.missing_blob_count > 0 {
        output::print_warning(&format!(
            "replayed with {} blob(s) unavailable",
            result.missing_blob_count
        ));
    }
    for warning in &result.warnings {
        output::print_warning(warning);
    }
    println!();
}

fn print_entry(index: usize, total: usize, entry: &TimelineEntry) {
    let event = &entry.event;
    println!(
        "{} {} {}",
        format!("[{}/{}]", index + 1, total).dimmed(),
        event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        event.event_type.bold()
    );
    let actor = event
        .actor
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("-");
    output::print_detail("Actor", actor);
    if !event.tags.is_empty() {
        let tags = event
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        output::print_detail("Tags", &tags);
    }
    if let Ok(payload) = serde_json::to_string(&event.payload) {
        output::print_detail("Payload", &payload);
    }
    for blob in &entry.blobs {
        match blob.get("status").and_then(Value::as_str) {
            Some("missing") => {
                let id = blob.get("blobId").and_then(Value::as_str).unwrap_or("?");
                output::print_warning(&format!("blob {} is unavailable", id));
            }
            _ => {
                let id = blob.get("blobId").and_then(Value::as_str).unwrap_or("?");
                let size = blob.get("sizeBytes").and_then(Value::as_u64).unwrap_or(0);
                output::print_detail("Blob", &format!("{} ({} bytes)", id, size));
            }
        }
    }
    println!();
}

/// Step through the timeline one event at a time. Commands: enter/n for
/// next, a number to jump, q to quit.
fn step_through(timeline: &[TimelineEntry]) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut index = 0usize;

    while index < timeline.len() {
        print_entry(index, timeline.len(), &timeline[index]);

        print!("{} ", "next [n/<number>/q]:".dimmed());
        io::stdout().flush()?;
        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        match line.trim() {
            "" | "n" | "next" => index += 1,
            "q" | "quit" => break,
            other => match other.parse::<usize>() {
                Ok(n) if n >= 1 && n <= timeline.len() => index = n - 1,
                _ => output::print_error("enter n, a step number, or q"),
            },
        }
    }
    Ok(())
}

fn print_states(states: &BTreeMap<String, BTreeMap<String, Value>>) {
    if states.is_empty() {
        return;
    }
    output::print_header("Reconstructed state");
    for (projection, entities) in states {
        for (entity, state) in entities {
            println!("{} {}", projection.bold(), entity);
            match serde_json::to_string_pretty(state) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{}", state),
            }
            println!();
        }
    }
}
