//! Chronicle CLI - command-line interface for the Chronicle event store.
//!
//! Provides commands for listing and inspecting events, replaying
//! workflow runs, and CLI configuration.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, events, health, replay};
use output::OutputFormat;

/// Chronicle - append-only event store CLI
#[derive(Parser)]
#[command(
    name = "chronicle",
    version = "0.1.0",
    about = "Chronicle - append-only event store for workflow automation",
    long_about = "CLI for querying the Chronicle event stream, inspecting correlations, and replaying past workflow runs.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "CHRONICLE_API_URL")]
    api_url: Option<String>,

    /// Actor identity sent to the server
    #[arg(long, global = true, env = "CHRONICLE_ACTOR_ID")]
    actor_id: Option<String>,

    /// Actor role sent to the server (standard or elevated)
    #[arg(long, global = true, env = "CHRONICLE_ACTOR_ROLE")]
    actor_role: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Event stream queries
    #[command(subcommand)]
    Events(events::EventsCommands),

    /// Replay a workflow run, issue, or pull request
    Replay(replay::ReplayArgs),

    /// Check server health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let stored = config::load_stored();
    let api_url = cli
        .api_url
        .clone()
        .or(stored.api_url)
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let actor_id = cli
        .actor_id
        .clone()
        .or(stored.actor_id)
        .unwrap_or_else(|| "cli".to_string());
    let actor_role = cli
        .actor_role
        .clone()
        .or(stored.actor_role)
        .unwrap_or_else(|| "elevated".to_string());

    let client = client::ApiClient::new(&api_url, &actor_id, &actor_role)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Events(cmd) => events::execute(cmd, &client, format).await,
        Commands::Replay(args) => replay::execute(args, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
