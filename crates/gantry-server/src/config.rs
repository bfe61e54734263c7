//! Server configuration.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use gantry_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL connection string.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Seconds between sweeps that queue every unfinished run again.
    /// Zero sweeps only at startup.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_database_url() -> String {
    "postgres://localhost/gantry".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_sweep_interval() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            log_format: LogFormat::default(),
            sweep_interval_secs: default_sweep_interval(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional YAML file, then `GANTRY_*`
    /// environment variables. Nested keys use `__`, as in
    /// `GANTRY_SCHEDULER__EMITTER_WORKERS`. A `.env` file is read first
    /// when present.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<Self> {
        let config = builder
            .add_source(
                Environment::with_prefix("GANTRY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
