//! Configuration module for the servicehub server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "servicehub")]
#[command(author = "servicehub authors")]
#[command(version)]
#[command(about = "A lightweight HTTP server with service registration", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Directory to serve static files from
    #[arg(short = 'w', long)]
    pub web_root: Option<PathBuf>,

    /// Socket read/write timeout in seconds
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Maximum bytes read for a single request
    #[arg(long)]
    pub max_request_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub static_files: StaticFilesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Socket read/write timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Maximum bytes read for a single request
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            max_request_size: default_max_request_size(),
        }
    }
}

/// Static file serving
#[derive(Debug, Deserialize, Default)]
pub struct StaticFilesConfig {
    /// Web root; static files are disabled when unset
    pub root: Option<PathBuf>,
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

fn default_port() -> u16 {
    8080
}

fn default_backlog() -> i32 {
    1024
}

fn default_read_timeout() -> u64 {
    30 // seconds
}

fn default_max_request_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub read_timeout: Duration,
    pub max_request_size: usize,
    pub web_root: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default_args(), TomlConfig::default())
    }
}

impl CliArgs {
    fn default_args() -> Self {
        CliArgs {
            port: None,
            config: None,
            host: None,
            web_root: None,
            read_timeout: None,
            max_request_size: None,
            log_level: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments, reading the TOML file they
    /// point at if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        if config.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: toml_config.server.backlog,
            read_timeout: Duration::from_secs(
                cli.read_timeout
                    .unwrap_or(toml_config.connection.read_timeout),
            ),
            max_request_size: cli
                .max_request_size
                .unwrap_or(toml_config.connection.max_request_size),
            web_root: cli.web_root.or(toml_config.static_files.root),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Port must be between 1 and 65535")]
    InvalidPort,
}
