//! Server configuration
//!
//! Defaults, optionally overlaid by a TOML file, then by command-line flags.
//!
//! # Example TOML
//! ```toml
//! channel_name = "/memstat_events"
//! lock_region_name = "/memstat_locks"
//! channel_capacity = 10
//! report_interval_ms = 1000
//! format = "text"
//! ```

use crate::cli::Cli;
use crate::consumer::ReportSettings;
use crate::report::ReportFormat;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Well-known name of the event channel
pub const DEFAULT_CHANNEL_NAME: &str = "/memstat_events";

/// Well-known name of the lock region
pub const DEFAULT_LOCK_REGION_NAME: &str = "/memstat_locks";

/// Linux's default `msg_max` for unprivileged queues
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub channel_name: String,
    pub lock_region_name: String,
    pub channel_capacity: usize,
    pub report_interval_ms: u64,
    pub format: ReportFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            lock_region_name: DEFAULT_LOCK_REGION_NAME.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            format: ReportFormat::Text,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML server config")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
    }

    /// Build the effective configuration for a command line
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(name) = &cli.channel {
            config.channel_name = name.clone();
        }
        if let Some(name) = &cli.locks {
            config.lock_region_name = name.clone();
        }
        if let Some(capacity) = cli.capacity {
            config.channel_capacity = capacity;
        }
        if let Some(interval) = cli.interval_ms {
            config.report_interval_ms = interval;
        }
        if let Some(format) = cli.format {
            config.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject names and limits the kernel would refuse
    pub fn validate(&self) -> Result<()> {
        validate_ipc_name("channel_name", &self.channel_name)?;
        validate_ipc_name("lock_region_name", &self.lock_region_name)?;

        if self.channel_capacity == 0 {
            anyhow::bail!("Invalid channel_capacity: 0 (must be >= 1)");
        }
        if self.report_interval_ms == 0 {
            anyhow::bail!("Invalid report_interval_ms: 0 (must be >= 1)");
        }
        Ok(())
    }

    pub fn report_settings(&self) -> ReportSettings {
        ReportSettings {
            interval: Duration::from_millis(self.report_interval_ms),
            format: self.format,
        }
    }
}

/// POSIX IPC names are a single leading slash followed by a plain name
fn validate_ipc_name(field: &str, name: &str) -> Result<()> {
    let Some(rest) = name.strip_prefix('/') else {
        anyhow::bail!("Invalid {}: '{}' must start with '/'", field, name);
    };
    if rest.is_empty() || rest.contains('/') {
        anyhow::bail!(
            "Invalid {}: '{}' must be '/' followed by a name without further '/'",
            field,
            name
        );
    }
    Ok(())
}
