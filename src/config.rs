//! Configuration module for echo-reactor.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the daemon
#[derive(Parser, Debug)]
#[command(name = "echo-reactor")]
#[command(author = "echo-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP/UDP echo daemon", long_about = None)]
pub struct CliArgs {
    /// Port shared by the TCP listener and the UDP socket
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(long)]
    pub threads: Option<NonZeroUsize>,

    /// Secret required by `/shutdown` (no secret when absent)
    #[arg(long)]
    pub shutdown_token: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Number of worker threads
    pub threads: Option<NonZeroUsize>,
    /// Shutdown secret
    pub shutdown_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            threads: None,
            shutdown_token: None,
        }
    }
}

/// Reactor tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound on a single poll wait, in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Readiness events fetched per poll
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Scratch buffer size for TCP reads
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Receive buffer size for UDP datagrams
    #[serde(default = "default_udp_buffer")]
    pub udp_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            max_events: default_max_events(),
            read_chunk: default_read_chunk(),
            udp_buffer: default_udp_buffer(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_max_events() -> usize {
    64
}

fn default_read_chunk() -> usize {
    4096
}

fn default_udp_buffer() -> usize {
    64 * 1024 // largest possible datagram payload
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub threads: Option<NonZeroUsize>,
    pub shutdown_token: Option<String>,
    pub poll_timeout: Duration,
    pub max_events: usize,
    pub read_chunk: usize,
    pub udp_buffer: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // An empty secret means no secret at all
        let shutdown_token = cli
            .shutdown_token
            .or(toml_config.server.shutdown_token)
            .filter(|token| !token.is_empty());

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port,
            threads: cli.threads.or(toml_config.server.threads),
            shutdown_token,
            poll_timeout: Duration::from_millis(toml_config.runtime.poll_timeout_ms),
            max_events: toml_config.runtime.max_events.max(1),
            read_chunk: toml_config.runtime.read_chunk.max(1),
            udp_buffer: toml_config.runtime.udp_buffer.max(1),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Worker count, defaulting to the available hardware parallelism.
    pub fn worker_count(&self) -> usize {
        self.threads.map(NonZeroUsize::get).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Configuration used by in-process tests: loopback, ephemeral port.
    #[cfg(test)]
    pub fn for_tests(threads: usize, shutdown_token: Option<&str>) -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            threads: NonZeroUsize::new(threads),
            shutdown_token: shutdown_token.map(str::to_string),
            poll_timeout: Duration::from_millis(100),
            max_events: default_max_events(),
            read_chunk: default_read_chunk(),
            udp_buffer: default_udp_buffer(),
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
