//! CLI configuration stored at ~/.chronicle/config.toml.

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a configuration value
    Set {
        /// Configuration key (api_url, actor_id, actor_role)
        key: String,
        /// Value to set
        value: String,
    },

    /// Show a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Show the full configuration
    Show,

    /// Reset the configuration to defaults
    Reset,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliConfig {
    pub api_url: Option<String>,
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
    Ok(home.join(".chronicle").join("config.toml"))
}

fn load() -> Result<CliConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("invalid config at {}", path.display()))
}

fn save(config: &CliConfig) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))
}

/// Stored values used as fallbacks when flags and environment
/// variables are absent. An unreadable file behaves as empty.
pub fn load_stored() -> CliConfig {
    load().unwrap_or_default()
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Set { key, value } => {
            let mut config = load()?;
            match key.as_str() {
                "api_url" => config.api_url = Some(value.clone()),
                "actor_id" => config.actor_id = Some(value.clone()),
                "actor_role" => config.actor_role = Some(value.clone()),
                other => return Err(anyhow!("unknown configuration key: {}", other)),
            }
            save(&config)?;
            output::print_success(&format!("{} = {}", key, value));
        }
        ConfigCommands::Get { key } => {
            let config = load()?;
            let value = match key.as_str() {
                "api_url" => config.api_url,
                "actor_id" => config.actor_id,
                "actor_role" => config.actor_role,
                other => return Err(anyhow!("unknown configuration key: {}", other)),
            };
            match value {
                Some(v) => println!("{}", v),
                None => output::print_info(&format!("{} is not set", key)),
            }
        }
        ConfigCommands::Show => {
            let config = load()?;
            output::print_item(&config, format)?;
        }
        ConfigCommands::Reset => {
            let path = config_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
            output::print_success("configuration reset to defaults");
        }
    }
    Ok(())
}
