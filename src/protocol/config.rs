//! Values handed to protocol resolvers at startup.
//!
//! `ServiceHandles` holds long-lived shared services and may be cloned and
//! kept. `ProtocolConfig` is a per-resolution snapshot: resolvers only ever
//! see it by reference for the duration of the call, so anything a protocol
//! wants to keep must be cloned out of it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::net::{ErrorSink, TracingSink};
use crate::protocol::StatsRegistry;

/// Stable service handles shared by every protocol.
#[derive(Clone)]
pub struct ServiceHandles {
    /// Destination for socket and protocol diagnostics.
    pub errors: Arc<dyn ErrorSink>,
    /// Statistics registry every loaded protocol is added to.
    pub stats: Arc<StatsRegistry>,
    /// Extra environment passed from the `[env]` configuration table.
    pub env: Arc<HashMap<String, String>>,
}

impl ServiceHandles {
    pub fn new(errors: Arc<dyn ErrorSink>, env: HashMap<String, String>) -> Self {
        Self {
            errors,
            stats: Arc::new(StatsRegistry::new()),
            env: Arc::new(env),
        }
    }
}

impl Default for ServiceHandles {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink), HashMap::new())
    }
}

/// Point-in-time settings for one protocol resolution.
#[derive(Debug, Clone, Default)]
#[allow(dead_code)] // Built-in protocols read only the port
pub struct ProtocolConfig {
    /// Configuration file the service was started with.
    pub config_file: Option<PathBuf>,
    /// Requested port: negative = not specified, 0 = any, positive = exact.
    /// Holds the actual bound port when the factory is resolved.
    pub port: i32,
    /// Address of the listener bound for this protocol. Set only for the
    /// factory call.
    pub listener: Option<SocketAddr>,
    /// Socket buffer size for the listener (0 = OS default).
    pub window_size: usize,
    pub admin_path: Option<PathBuf>,
    pub admin_mode: u32,
    /// True when the admin path came from the command line.
    pub admin_path_set: bool,
    pub instance_name: String,
    pub host_name: String,
    pub program_name: String,
    pub host_addr: Option<IpAddr>,
    pub max_connections: usize,
    /// Longest wait for the rest of a partially received request.
    pub read_wait: Duration,
    /// Longest a bound link may stay silent.
    pub idle_wait: Duration,
    /// Longest wait for enough initial bytes to identify the protocol.
    pub hail_wait: Duration,
    pub argv: Vec<String>,
    pub debug: bool,
    pub tls_port: Option<u16>,
    /// The full merged configuration, as TOML text.
    pub total_config: String,
}

impl ProtocolConfig {
    /// Snapshot the service-wide settings. The port is left unset.
    pub fn from_config(config: &Config) -> Self {
        Self {
            config_file: config.config_file.clone(),
            port: -1,
            listener: None,
            window_size: config.window_size,
            admin_path: config.admin_path.clone(),
            admin_mode: config.admin_mode,
            admin_path_set: config.admin_path_from_cli,
            instance_name: config.instance.clone(),
            host_name: config.host_name.clone(),
            program_name: config.program.clone(),
            host_addr: config.host.parse().ok(),
            max_connections: config.max_connections,
            read_wait: config.read_wait,
            idle_wait: config.idle_wait,
            hail_wait: config.hail_wait,
            argv: config.argv.clone(),
            debug: config.debug,
            tls_port: config.tls_port,
            total_config: config.total_config.clone(),
        }
    }
}
