//! Configuration for the tcp-events demo binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Which demo to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Echo every received chunk back to its sender
    #[default]
    Echo,
    /// Send stdin lines to every connected client
    Broadcast,
    /// Connect to a server and echo what it sends
    Client,
}

/// Command-line arguments for the demo binary
#[derive(Parser, Debug)]
#[command(name = "tcp-events")]
#[command(author = "tcp-events authors")]
#[command(version = "0.1.0")]
#[command(about = "Event-driven TCP echo, broadcast and client demos", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Demo to run
    #[arg(short = 'M', long, value_enum)]
    pub mode: Option<Mode>,

    /// Address to bind to, or to connect to in client mode ("local" picks
    /// the host's first IPv4 address)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Port (servers pick a free port when omitted)
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Disable Nagle's algorithm on every connection
    #[arg(long)]
    pub no_delay: bool,

    /// Allow other sockets to listen on the same port
    #[arg(long)]
    pub shared_port: bool,

    /// Message the client sends once connected
    #[arg(short = 'm', long)]
    pub message: Option<String>,

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
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub mode: Mode,
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    pub port: Option<u16>,
    #[serde(default = "default_exclusive")]
    pub exclusive_address_use: bool,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            listen: default_listen(),
            port: None,
            exclusive_address_use: default_exclusive(),
            workers: None,
        }
    }
}

/// Per-connection socket options
#[derive(Debug, Deserialize, Default)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub no_delay: bool,
}

/// Client demo configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_message")]
    pub message: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            message: default_message(),
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

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_exclusive() -> bool {
    true
}

fn default_message() -> String {
    "echo".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: String,
    pub port: Option<u16>,
    pub exclusive_address_use: bool,
    pub workers: Option<usize>,
    pub no_delay: bool,
    pub message: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            port: cli.port.or(toml_config.server.port),
            exclusive_address_use: !cli.shared_port && toml_config.server.exclusive_address_use,
            workers: cli.workers.or(toml_config.server.workers),
            no_delay: cli.no_delay || toml_config.connection.no_delay,
            message: cli.message.unwrap_or(toml_config.client.message),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        if config.mode == Mode::Client && config.port.is_none() {
            return Err(ConfigError::MissingPort);
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingPort => write!(f, "Client mode requires a server port"),
        }
    }
}

impl std::error::Error for ConfigError {}
