//! Streaming Configuration Module
//!
//! Loads [`StreamingConfig`] from a TOML file with an optional
//! per-environment overlay and `STREAMING_`-prefixed environment variables.
//! Every field has a default, so an empty file is a valid configuration.
//!
//! Environment keys use `__` between path segments, e.g.
//! `STREAMING_STREAM__MAX_BATCH_SIZE=128`.

use anyhow::{Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub stream: StreamSettings,
    pub endpoint: EndpointSettings,
    pub logging: LoggingSettings,
}

/// Credit flow and path lifecycle settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Credit granted to a source in `ack_open`
    pub default_initial_demand: i32,
    /// Upper bound on elements per batch
    pub max_batch_size: i32,
    /// How long a failed redeployable path waits for a resume
    pub failure_grace_period_ms: u64,
    /// Re-grant consumed credit with every `ack_batch`
    pub credit_refill: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            default_initial_demand: 50,
            max_batch_size: 50,
            failure_grace_period_ms: 5_000,
            credit_refill: true,
        }
    }
}

impl StreamSettings {
    pub fn failure_grace_period(&self) -> Duration {
        Duration::from_millis(self.failure_grace_period_ms)
    }
}

/// Endpoint manager and transport settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Largest accepted frame body in bytes
    pub max_message_size: usize,
    /// Bytes pulled from the peer per read event
    pub read_buffer_size: usize,
    /// Frames written per write event before yielding
    pub max_frames_per_write: usize,
    /// Deficit weight of a deferred timeout
    pub timeout_task_size: u32,
    /// Deficit weight of a deferred resolve request
    pub resolve_task_size: u32,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024,
            read_buffer_size: 64 * 1024,
            max_frames_per_write: 64,
            timeout_task_size: 1,
            resolve_task_size: 1,
        }
    }
}

/// Logging output settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl StreamingConfig {
    /// Load configuration from files with environment overrides
    ///
    /// `base_path` defaults to `config/streaming.toml` and is optional: a
    /// missing base file yields the built-in defaults. The overlay for
    /// `environment` is looked up next to the base file as
    /// `environments/<env>.toml`.
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new("config/streaming.toml"));

        let mut builder = Config::builder().add_source(File::from(base).required(false));

        if let Some(env) = environment {
            let env_file = base
                .parent()
                .unwrap_or(Path::new("."))
                .join("environments")
                .join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        // Override with environment variables (STREAMING_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("STREAMING")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let loaded: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        loaded.validate()?;

        debug!(?loaded, "Streaming configuration loaded");
        Ok(loaded)
    }

    /// Parse configuration from a TOML string, without file or environment sources
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?;

        let parsed: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Render the configuration as TOML, e.g. to seed a config file
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.stream.default_initial_demand < 0 {
            anyhow::bail!(
                "stream.default_initial_demand must be >= 0, got {}",
                self.stream.default_initial_demand
            );
        }
        if self.stream.max_batch_size <= 0 {
            anyhow::bail!(
                "stream.max_batch_size must be > 0, got {}",
                self.stream.max_batch_size
            );
        }
        if self.endpoint.max_frames_per_write == 0 {
            anyhow::bail!("endpoint.max_frames_per_write must be > 0");
        }
        if self.endpoint.read_buffer_size == 0 {
            anyhow::bail!("endpoint.read_buffer_size must be > 0");
        }
        if self.endpoint.timeout_task_size == 0 || self.endpoint.resolve_task_size == 0 {
            anyhow::bail!("endpoint task sizes must be > 0");
        }
        Ok(())
    }
}

/// Convenience function to load configuration from the default location
pub fn load_config(environment: Option<&str>) -> Result<StreamingConfig> {
    let path = PathBuf::from("config/streaming.toml");
    StreamingConfig::load(Some(&path), environment)
}
