//! Configuration module for file-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::client::stats::StatsWindow;
use crate::error::ConfigError;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "file-bench")]
#[command(author = "file-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "Concurrent latency benchmark client and file-streaming server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and stream the payload file back on every request
    Server {
        /// Address to bind to (e.g., 127.0.0.1:8080)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Payload file returned for each request
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Read/write timeout in seconds
        #[arg(short = 't', long)]
        timeout: Option<u64>,

        /// Maximum number of concurrent connections
        #[arg(long)]
        max_connections: Option<usize>,
    },

    /// Open n concurrent sessions and measure request latency
    Client {
        /// The server IP/hostname
        hostname: String,

        /// The server port number
        port: u16,

        /// The number of concurrent workers (default is 100)
        n: Option<u64>,

        /// The delay between requests in milliseconds (default is 1000)
        delay: Option<u64>,

        /// Requests per worker (defaults to 55000 / delay)
        #[arg(long)]
        iterations: Option<u64>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_file")]
    pub file: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            file: default_file(),
            timeout_secs: default_timeout_secs(),
            max_connections: default_max_connections(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_connections")]
    pub connections: u64,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    pub iterations: Option<u64>,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// First iteration index counted in the statistics
    pub warmup: Option<u64>,
    /// Last iteration index counted in the statistics
    pub cool_down: Option<u64>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            delay_ms: default_delay_ms(),
            iterations: None,
            settle_ms: default_settle_ms(),
            jitter_ms: default_jitter_ms(),
            warmup: None,
            cool_down: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_file() -> PathBuf {
    PathBuf::from("data").join("file.txt")
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_max_connections() -> usize {
    10_000
}

fn default_connections() -> u64 {
    100
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_settle_ms() -> u64 {
    1000
}

fn default_jitter_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub file: PathBuf,
    pub timeout: Duration,
    pub max_connections: usize,
}

/// Resolved client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hostname: String,
    pub port: u16,
    pub connections: usize,
    pub delay_ms: u64,
    pub iterations: u64,
    pub settle: Duration,
    pub jitter_ms: u64,
    pub window: StatsWindow,
}

impl ClientConfig {
    /// Client settings with the harness defaults for the given run shape.
    pub fn new(hostname: impl Into<String>, port: u16, connections: usize, delay_ms: u64) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            connections,
            delay_ms,
            iterations: default_iterations(delay_ms),
            settle: Duration::from_millis(default_settle_ms()),
            jitter_ms: default_jitter_ms(),
            window: StatsWindow::for_delay(delay_ms),
        }
    }
}

/// Iteration count approximating a 55 second run.
pub fn default_iterations(delay_ms: u64) -> u64 {
    55_000 / delay_ms.max(1)
}

#[derive(Debug, Clone)]
pub enum Mode {
    Server(ServerConfig),
    Client(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge parsed CLI args over TOML values and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let mode = match cli.command {
            Command::Server {
                listen,
                file,
                timeout,
                max_connections,
            } => {
                let section = toml_config.server;
                let timeout_secs = timeout.unwrap_or(section.timeout_secs);
                if timeout_secs == 0 {
                    return Err(ConfigError::Invalid(
                        "timeout must be at least 1 second".to_string(),
                    ));
                }
                let max_connections = max_connections.unwrap_or(section.max_connections);
                if max_connections == 0 {
                    return Err(ConfigError::Invalid(
                        "max_connections must be at least 1".to_string(),
                    ));
                }
                Mode::Server(ServerConfig {
                    listen: listen.unwrap_or(section.listen),
                    file: file.unwrap_or(section.file),
                    timeout: Duration::from_secs(timeout_secs),
                    max_connections,
                })
            }
            Command::Client {
                hostname,
                port,
                n,
                delay,
                iterations,
            } => {
                let section = toml_config.client;
                let connections = n.unwrap_or(section.connections);
                if connections < 1 {
                    return Err(ConfigError::Invalid(
                        "number of workers may not be less than one".to_string(),
                    ));
                }
                let delay_ms = delay.unwrap_or(section.delay_ms);
                if delay_ms < 1 {
                    return Err(ConfigError::Invalid(
                        "delay may not be less than one millisecond".to_string(),
                    ));
                }

                let derived = StatsWindow::for_delay(delay_ms);
                let warmup = section.warmup.unwrap_or(derived.warmup());
                let cool_down = section.cool_down.unwrap_or(derived.cool_down());
                if cool_down < warmup {
                    return Err(ConfigError::Invalid(format!(
                        "cool_down ({cool_down}) precedes warmup ({warmup})"
                    )));
                }

                let mut config = ClientConfig::new(hostname, port, connections as usize, delay_ms);
                if let Some(iterations) = iterations.or(section.iterations) {
                    config.iterations = iterations;
                }
                config.settle = Duration::from_millis(section.settle_ms);
                config.jitter_ms = section.jitter_ms;
                config.window = StatsWindow::new(warmup, cool_down);
                Mode::Client(config)
            }
        };

        Ok(Config { log_level, mode })
    }
}
