//! Configuration module for the linkmux server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use std::collections::HashMap;
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "linkmux")]
#[command(version)]
#[command(about = "A multi-protocol connection dispatcher", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind listeners to (empty for all interfaces)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Default listening port (0 = any)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Protocol to load, as `name[:params]`; repeat in priority order
    #[arg(short = 'P', long = "protocol")]
    pub protocols: Vec<ProtocolEntry>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Directory for the administrative Unix socket
    #[arg(short = 'a', long)]
    pub admin_path: Option<PathBuf>,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// One configured protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEntry {
    pub name: String,
    /// Free-form parameter string handed to the protocol's resolvers.
    #[serde(default)]
    pub params: String,
    /// Port override for this protocol only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl FromStr for ProtocolEntry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, params) = s.split_once(':').unwrap_or((s, ""));
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::InvalidProtocol(s.to_string()));
        }
        Ok(ProtocolEntry {
            name: name.to_string(),
            params: params.to_string(),
            port: None,
        })
    }
}

/// TOML configuration file structure
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Extra environment handed to protocols.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, rename = "protocol")]
    pub protocols: Vec<ProtocolEntry>,
}

/// Server-related configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default)]
    pub host: String,
    /// Default port for protocols that do not choose their own
    pub port: Option<u16>,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Longest single wait of an acceptor, in milliseconds
    #[serde(default = "default_accept_wait_ms")]
    pub accept_wait_ms: u64,
    /// Listener socket buffer size (0 = OS default)
    #[serde(default)]
    pub window_size: usize,
    #[serde(default = "default_instance")]
    pub instance: String,
    pub program: Option<String>,
    pub tls_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: None,
            workers: None,
            max_connections: default_max_connections(),
            accept_wait_ms: default_accept_wait_ms(),
            window_size: 0,
            instance: default_instance(),
            program: None,
            tls_port: None,
        }
    }
}

/// Per-link time limits, in milliseconds (0 disables idle and read limits)
#[derive(Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_read_wait_ms")]
    pub read_wait_ms: u64,
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    #[serde(default = "default_hail_wait_ms")]
    pub hail_wait_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_wait_ms: default_read_wait_ms(),
            idle_wait_ms: default_idle_wait_ms(),
            hail_wait_ms: default_hail_wait_ms(),
        }
    }
}

/// Administrative socket configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    pub path: Option<PathBuf>,
    #[serde(default = "default_admin_mode")]
    pub mode: u32,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            path: None,
            mode: default_admin_mode(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize)]
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

fn default_max_connections() -> usize {
    10_000
}

fn default_accept_wait_ms() -> u64 {
    500
}

fn default_instance() -> String {
    "anon".to_string()
}

fn default_read_wait_ms() -> u64 {
    3_000
}

fn default_idle_wait_ms() -> u64 {
    600_000
}

fn default_hail_wait_ms() -> u64 {
    30_000
}

fn default_admin_mode() -> u32 {
    0o700
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Protocols loaded when none are configured.
fn default_protocols() -> Vec<ProtocolEntry> {
    ["ping", "echo", "stats"]
        .iter()
        .map(|name| ProtocolEntry {
            name: name.to_string(),
            params: String::new(),
            port: None,
        })
        .collect()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub config_file: Option<PathBuf>,
    pub host: String,
    /// Default port; `None` leaves the choice to each protocol.
    pub port: Option<u16>,
    pub protocols: Vec<ProtocolEntry>,
    pub workers: usize,
    pub max_connections: usize,
    pub accept_wait: Duration,
    pub window_size: usize,
    pub instance: String,
    pub host_name: String,
    pub program: String,
    pub admin_path: Option<PathBuf>,
    pub admin_mode: u32,
    pub admin_path_from_cli: bool,
    pub read_wait: Duration,
    pub idle_wait: Duration,
    pub hail_wait: Duration,
    pub env: HashMap<String, String>,
    pub argv: Vec<String>,
    pub debug: bool,
    pub tls_port: Option<u16>,
    pub log_level: String,
    /// The merged configuration, rendered back to TOML.
    pub total_config: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse(), std::env::args().collect())
    }

    pub fn from_args(cli: CliArgs, argv: Vec<String>) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref config_path) => Self::read_file(config_path)?,
            None => TomlConfig::default(),
        };
        Self::merge(cli, toml_config, argv)
    }

    fn read_file(path: &Path) -> Result<TomlConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }

    /// Overlay CLI args on the file settings.
    pub fn merge(
        cli: CliArgs,
        mut file: TomlConfig,
        argv: Vec<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(host) = cli.host {
            file.server.host = host;
        }
        if cli.port.is_some() {
            file.server.port = cli.port;
        }
        if cli.workers.is_some() {
            file.server.workers = cli.workers;
        }
        let admin_path_from_cli = cli.admin_path.is_some();
        if cli.admin_path.is_some() {
            file.admin.path = cli.admin_path;
        }
        if let Some(level) = cli.log_level {
            file.logging.level = level;
        } else if cli.debug {
            file.logging.level = "debug".to_string();
        }
        if !cli.protocols.is_empty() {
            file.protocols = cli.protocols;
        }
        if file.protocols.is_empty() {
            file.protocols = default_protocols();
        }

        let program = file.server.program.clone().unwrap_or_else(|| {
            argv.first()
                .and_then(|arg0| Path::new(arg0).file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "linkmux".to_string())
        });
        let workers = file.server.workers.filter(|&n| n > 0).unwrap_or_else(num_cpus);
        let total_config = toml::to_string(&file).map_err(ConfigError::Render)?;

        Ok(Config {
            config_file: cli.config,
            host: file.server.host,
            port: file.server.port,
            protocols: file.protocols,
            workers,
            max_connections: file.server.max_connections,
            accept_wait: Duration::from_millis(file.server.accept_wait_ms.max(1)),
            window_size: file.server.window_size,
            instance: file.server.instance,
            host_name: host_name(),
            program,
            admin_path: file.admin.path,
            admin_mode: file.admin.mode,
            admin_path_from_cli,
            read_wait: Duration::from_millis(file.timeouts.read_wait_ms),
            idle_wait: Duration::from_millis(file.timeouts.idle_wait_ms),
            hail_wait: Duration::from_millis(file.timeouts.hail_wait_ms),
            env: file.env,
            argv,
            debug: cli.debug,
            tls_port: file.server.tls_port,
            log_level: file.logging.level,
            total_config,
        })
    }
}

/// This machine's host name, or "localhost" if it cannot be read.
fn host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates
    // on success when the name fits, and the last byte is kept as NUL.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if rc != 0 {
        return "localhost".to_string();
    }
    CStr::from_bytes_until_nul(&buf)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Failed to render merged configuration: {0}")]
    Render(#[source] toml::ser::Error),
    #[error("Invalid protocol entry '{0}' (expected name[:params])")]
    InvalidProtocol(String),
}
