//! linkmux: a multi-protocol connection dispatcher
//!
//! Listeners accept raw connections and offer each one to the configured
//! protocols in priority order. The first protocol that recognizes the
//! opening bytes gets a pooled session bound to the connection and serves it
//! until it closes.
//!
//! Features:
//! - Portable socket layer over Unix and Internet domains
//! - Protocol registry with per-protocol port and factory resolution
//! - Several protocols sharing one port through protocol sniffing
//! - Built-in `ping`, `echo` and `stats` protocols
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod net;
mod protocol;
mod protocols;
mod runtime;

use config::Config;
use protocol::ProtocolRegistry;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        program = %config.program,
        instance = %config.instance,
        host_name = %config.host_name,
        host = %config.host,
        port = ?config.port,
        protocols = ?config.protocols.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        workers = config.workers,
        "Starting linkmux"
    );

    let server = runtime::start(&config, &ProtocolRegistry::builtin())?;
    for listener in server.listeners() {
        info!(
            protocols = ?listener.protocols,
            addr = ?listener.addr,
            path = ?listener.path,
            "Listening"
        );
    }
    server.join();
    Ok(())
}
