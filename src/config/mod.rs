//! Configuration management for panelbus.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{DEFAULT_BUFFER_CAPACITY, MAX_CHUNK};
use crate::error::{Error, Result};
use crate::{DEFAULT_COMMAND_PORT, DEFAULT_GROUP, DEFAULT_PORT};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Export stream receiver configuration.
    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// Panel bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.receiver.port == 0 {
            return Err(Error::InvalidConfig("Receiver port must be nonzero".into()));
        }

        if self.receiver.command_port == 0 {
            return Err(Error::InvalidConfig("Command port must be nonzero".into()));
        }

        if self.receiver.recv_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "Receive timeout must be nonzero".into(),
            ));
        }

        if let Some(group) = self.receiver.group {
            if !group.is_multicast() {
                return Err(Error::InvalidConfig(format!(
                    "{group} is not a multicast address"
                )));
            }
        }

        if self.bus.buffer_capacity == 0 {
            return Err(Error::InvalidConfig(
                "Bus buffer capacity must be nonzero".into(),
            ));
        }

        if self.bus.max_chunk == 0 || self.bus.max_chunk > MAX_CHUNK {
            return Err(Error::InvalidConfig(format!(
                "Bus chunk size must be between 1 and {MAX_CHUNK}"
            )));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "panelbus", "panelbus").map_or_else(
            || PathBuf::from("panelbus.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

/// Export stream receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Multicast group to join, or `None` for plain unicast reception.
    #[serde(default = "default_group")]
    pub group: Option<Ipv4Addr>,

    /// UDP port the export stream arrives on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// UDP port commands are sent back to on the simulator host.
    #[serde(default = "default_command_port")]
    pub command_port: u16,

    /// Bounded wait per receive call; also bounds stop latency.
    #[serde(default = "default_recv_timeout", with = "humantime_serde")]
    pub recv_timeout: Duration,
}

fn default_group() -> Option<Ipv4Addr> {
    Some(DEFAULT_GROUP)
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_command_port() -> u16 {
    DEFAULT_COMMAND_PORT
}
fn default_recv_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            command_port: default_command_port(),
            recv_timeout: default_recv_timeout(),
        }
    }
}

/// Panel bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Outgoing buffer capacity in bytes.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Largest payload per export-data frame.
    #[serde(default = "default_max_chunk")]
    pub max_chunk: usize,
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}
fn default_max_chunk() -> usize {
    MAX_CHUNK
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            max_chunk: default_max_chunk(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
