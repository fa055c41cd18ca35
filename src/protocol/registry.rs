//! Static table of known protocols.
//!
//! Each entry maps a protocol name to a factory resolver and, optionally, a
//! port resolver. Startup resolves the port first, binds the listener, records
//! the bound address in the `ProtocolConfig`, and only then resolves the
//! factory.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error};

use super::{Protocol, ProtocolConfig, ServiceHandles};
use crate::error::StartupError;
use crate::protocols;

/// Port used when neither the protocol nor the configuration names one.
pub const DEFAULT_PORT: u16 = 7070;

/// Builds the prototype instance of a protocol.
///
/// Arguments are the protocol name, its parameter string, the configuration
/// snapshot and the shared service handles. `None` means the protocol could
/// not be loaded, which aborts startup.
pub type FactoryFn =
    fn(&str, &str, &ProtocolConfig, &ServiceHandles) -> Option<Arc<dyn Protocol>>;

/// Chooses the port a protocol listens on.
///
/// Negative = failure, 0 = any port, positive = that port.
pub type PortFn = fn(&str, &str, &ProtocolConfig) -> i32;

/// Outcome of port resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChoice {
    Fail,
    Any,
    Exact(u16),
}

impl From<i32> for PortChoice {
    fn from(port: i32) -> Self {
        match port {
            p if p < 0 => PortChoice::Fail,
            0 => PortChoice::Any,
            p => u16::try_from(p).map(PortChoice::Exact).unwrap_or(PortChoice::Fail),
        }
    }
}

impl PortChoice {
    /// Port number to bind (0 for any).
    pub fn port(self) -> Option<u16> {
        match self {
            PortChoice::Fail => None,
            PortChoice::Any => Some(0),
            PortChoice::Exact(port) => Some(port),
        }
    }
}

struct Entry {
    factory: FactoryFn,
    port: Option<PortFn>,
}

/// Name to resolver table.
#[derive(Default)]
pub struct ProtocolRegistry {
    entries: HashMap<String, Entry>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every protocol that ships with the server.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(protocols::ping::NAME, protocols::ping::factory, None);
        registry.register(protocols::echo::NAME, protocols::echo::factory, None);
        registry.register(
            protocols::stats::NAME,
            protocols::stats::factory,
            Some(protocols::stats::port),
        );
        registry
    }

    /// Add or replace a protocol.
    pub fn register(&mut self, name: &str, factory: FactoryFn, port: Option<PortFn>) {
        self.entries
            .insert(name.to_string(), Entry { factory, port });
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Decide which port `name` listens on.
    ///
    /// Protocols without a port resolver follow the configured port: unset
    /// falls back to [`DEFAULT_PORT`], 0 is any port, otherwise that port.
    pub fn resolve_port(
        &self,
        name: &str,
        params: &str,
        config: &ProtocolConfig,
    ) -> Result<PortChoice, StartupError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| StartupError::UnknownProtocol(name.to_string()))?;

        let choice = match entry.port {
            Some(resolve) => PortChoice::from(resolve(name, params, config)),
            None if config.port < 0 => PortChoice::Exact(DEFAULT_PORT),
            None => PortChoice::from(config.port),
        };

        if choice == PortChoice::Fail {
            error!(protocol = name, "Port resolution failed");
            return Err(StartupError::Port {
                name: name.to_string(),
            });
        }
        debug!(protocol = name, ?choice, "Port resolved");
        Ok(choice)
    }

    /// Build the prototype instance of `name`.
    pub fn resolve_factory(
        &self,
        name: &str,
        params: &str,
        config: &ProtocolConfig,
        handles: &ServiceHandles,
    ) -> Result<Arc<dyn Protocol>, StartupError> {
        let protocol = self
            .entries
            .get(name)
            .and_then(|entry| (entry.factory)(name, params, config, handles));

        protocol.ok_or_else(|| {
            error!(protocol = name, params, "Protocol could not be loaded");
            StartupError::Factory {
                name: name.to_string(),
            }
        })
    }
}
