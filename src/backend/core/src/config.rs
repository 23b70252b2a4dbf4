//! Configuration management for Chronicle Core.
//!
//! Configuration is layered: defaults, then an optional `chronicle.toml`
//! file, then `CHRONICLE__`-prefixed environment variables (double
//! underscore separates nesting levels, e.g.
//! `CHRONICLE__SERVER__PORT=8080`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-Level Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub projections: ProjectionsConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub schema: SchemaConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            projections: ProjectionsConfig::default(),
            replay: ReplayConfig::default(),
            query: QueryConfig::default(),
            schema: SchemaConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Precedence (lowest to highest): struct defaults, `chronicle.toml`
    /// if present, `CHRONICLE__*` environment variables.
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("chronicle").required(false))
            .add_source(
                config::Environment::with_prefix("CHRONICLE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(crate::error::ChronicleError::configuration(
                "server.port must be non-zero",
            ));
        }
        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_limit {
            return Err(crate::error::ChronicleError::configuration(format!(
                "query.default_limit must be in 1..={}",
                self.query.max_limit
            )));
        }
        if matches!(self.storage.backend, StorageBackendKind::Postgres)
            && self.storage.database_url.is_none()
        {
            return Err(crate::error::ChronicleError::configuration(
                "storage.database_url is required for the postgres backend",
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Comma-separable list of allowed CORS origins; empty means permissive.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════════════

/// Which storage backend to open. Everything above the storage trait is
/// unaware of the choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Postgres,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,

    /// Postgres connection string; required when `backend = "postgres"`.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Root directory for the file backend (event log, blobs, projections).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_url: None,
            max_connections: default_max_connections(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_backend() -> StorageBackendKind {
    StorageBackendKind::File
}

fn default_max_connections() -> u32 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retention
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Blobs older than this become eligible for the sweep. Expiry gates
    /// deletion, never access.
    #[serde(default = "default_blob_ttl", with = "humantime_serde")]
    pub blob_ttl: Duration,

    /// How often the background sweep runs.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Optional horizon for pruning whole event ranges. `None` keeps
    /// events forever.
    #[serde(default, with = "humantime_serde::option")]
    pub event_horizon: Option<Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            blob_ttl: default_blob_ttl(),
            sweep_interval: default_sweep_interval(),
            event_horizon: None,
        }
    }
}

fn default_blob_ttl() -> Duration {
    // 90 days
    Duration::from_secs(90 * 24 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Projections
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether projections are applied inside the append call or queued to a
/// background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectionsConfig {
    #[serde(default = "default_projection_mode")]
    pub mode: ProjectionMode,

    /// Queue capacity for async mode.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ProjectionsConfig {
    fn default() -> Self {
        Self {
            mode: default_projection_mode(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_projection_mode() -> ProjectionMode {
    ProjectionMode::Sync
}

fn default_queue_capacity() -> usize {
    1024
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replay
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayConfig {
    /// When true a missing blob aborts reconstruction; when false the
    /// timeline carries a placeholder and a warning.
    #[serde(default)]
    pub strict_blobs: bool,

    /// How many blob fetches run concurrently during reconstruction.
    #[serde(default = "default_blob_concurrency")]
    pub blob_concurrency: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            strict_blobs: false,
            blob_concurrency: default_blob_concurrency(),
        }
    }
}

fn default_blob_concurrency() -> usize {
    8
}

// ═══════════════════════════════════════════════════════════════════════════════
// Query
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    #[serde(default = "default_query_limit")]
    pub default_limit: u32,

    #[serde(default = "default_max_limit")]
    pub max_limit: u32,

    /// Upper bound applied when the caller supplies no deadline.
    #[serde(default = "default_query_deadline", with = "humantime_serde")]
    pub default_deadline: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
            max_limit: default_max_limit(),
            default_deadline: default_query_deadline(),
        }
    }
}

fn default_query_limit() -> u32 {
    100
}

fn default_max_limit() -> u32 {
    1000
}

fn default_query_deadline() -> Duration {
    Duration::from_secs(30)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schema
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SchemaConfig {
    /// When true, events of unregistered types pass validation untouched
    /// instead of being rejected.
    #[serde(default)]
    pub permissive: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Observability
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable output.
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: default_json_logs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_logs() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, StorageBackendKind::File);
        assert_eq!(config.query.default_limit, 100);
        assert_eq!(config.query.max_limit, 1000);
        assert_eq!(config.projections.mode, ProjectionMode::Sync);
        assert!(!config.replay.strict_blobs);
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_database_url_for_postgres() {
        let mut config = Config::default();
        config.storage.backend = StorageBackendKind::Postgres;
        assert!(config.validate().is_err());

        config.storage.database_url = Some("postgres://localhost/chronicle".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_limit_bounds() {
        let mut config = Config::default();
        config.query.default_limit = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_durations_deserialize_humantime() {
        let toml = r#"
            [retention]
            blob_ttl = "30d"
            sweep_interval = "15m"
            event_horizon = "365d"
        "#;
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.retention.blob_ttl, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.retention.sweep_interval, Duration::from_secs(15 * 60));
        assert_eq!(
            config.retention.event_horizon,
            Some(Duration::from_secs(365 * 24 * 3600))
        );
    }
}
