use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::commands::ExecMode;

fn default_port() -> u16 {
    8080
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_max_output_bytes() -> usize {
    1024 * 1024
}
fn default_log_interval_ms() -> u64 {
    2000
}
fn default_stats_interval_ms() -> u64 {
    1000
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_keep_alive_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub exec_mode: ExecMode,
    /// Verbs appended to the built-in allowlist
    #[serde(default)]
    pub extra_allowed: Vec<String>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            exec_mode: ExecMode::default(),
            extra_allowed: Vec::new(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_interval_ms")]
    pub log_interval_ms: u64,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// Per-subscriber queue depth before the oldest event is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_interval_ms: default_log_interval_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            queue_capacity: default_queue_capacity(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl TelemetryConfig {
    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            command: CommandConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref()).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        Ok(cfg)
    }

    /// Load `path` if it exists, otherwise start from defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut cfg = if path.is_file() {
            debug!(path = %path.display(), "loading config file");
            Self::from_file(path)?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_number("COMMAND_TIMEOUT_SECS")? {
            self.command.timeout_secs = v;
        }
        if let Some(v) = env_number("LOG_INTERVAL_MS")? {
            self.telemetry.log_interval_ms = v;
        }
        if let Some(v) = env_number("STATS_INTERVAL_MS")? {
            self.telemetry.stats_interval_ms = v;
        }
        if let Some(v) = env_number("SUBSCRIBER_QUEUE_CAPACITY")? {
            self.telemetry.queue_capacity = usize::try_from(v)
                .context("SUBSCRIBER_QUEUE_CAPACITY does not fit in usize")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.timeout_secs == 0 {
            bail!("command.timeout_secs must be greater than zero");
        }
        if self.telemetry.log_interval_ms == 0
            || self.telemetry.stats_interval_ms == 0
            || self.telemetry.keep_alive_secs == 0
        {
            bail!("telemetry intervals must be greater than zero");
        }
        if self.telemetry.queue_capacity == 0 {
            bail!("telemetry.queue_capacity must be greater than zero");
        }
        Ok(())
    }
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("parsing {key}={raw}")),
        Err(_) => Ok(None),
    }
}
