//! Echo protocol implementation.
//!
//! A simple echo service for throughput and I/O testing:
//! - Client sends: `<length>\r\n<data>`
//! - Server echoes: `<length>\r\n<data>`
//!
//! ## Protocol Format
//!
//! Length-prefixed binary protocol for predictable framing:
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//!
//! Example:
//! Request:  5\r\nhello
//! Response: 5\r\nhello
//! ```
//!
//! `QUIT\r\n` closes the connection gracefully. A link is claimed only when
//! its first line is a length header.
//!
//! ## Parameters
//!
//! `max=<bytes>` caps the payload size. Without it the `echo.max` entry of
//! the `[env]` table applies, then the 16MB default.

pub mod handler;
pub mod parser;

use std::sync::Arc;

use crate::protocol::{Protocol, ProtocolConfig, ServiceHandles};

pub use handler::Echo;

pub const NAME: &str = "echo";

/// Default payload cap.
pub const MAX_ECHO_SIZE: usize = 16 * 1024 * 1024;

/// Environment key overriding the default payload cap.
pub const MAX_ENV_KEY: &str = "echo.max";

/// Factory resolver. Returns `None` for malformed parameters.
pub fn factory(
    name: &str,
    params: &str,
    _config: &ProtocolConfig,
    handles: &ServiceHandles,
) -> Option<Arc<dyn Protocol>> {
    let default = match handles.env.get(MAX_ENV_KEY) {
        Some(value) => parse_max(value)?,
        None => MAX_ECHO_SIZE,
    };
    let max = parse_params(params, default)?;
    Some(Arc::new(Echo::prototype(name, max)))
}

fn parse_max(value: &str) -> Option<usize> {
    value.trim().parse().ok().filter(|&m| m > 0)
}

fn parse_params(params: &str, default: usize) -> Option<usize> {
    let mut max = default;
    for param in params.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match param.split_once('=') {
            Some(("max", value)) => max = parse_max(value)?,
            _ => return None,
        }
    }
    Some(max)
}
