//! Ping protocol implementation.
//!
//! A minimal protocol for health checks and latency measurement:
//! - Client sends: `PING\r\n` or `PING <message>\r\n`
//! - Server responds: `PONG\r\n` or `PONG <message>\r\n`
//! - `QUIT\r\n` is answered with `OK\r\n` and ends the conversation.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  PING\r\n
//! Response: PONG\r\n
//!
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//! ```
//!
//! A link is claimed once its first complete line is a ping command.

pub mod handler;
pub mod parser;

use std::sync::Arc;

use crate::protocol::{Protocol, ProtocolConfig, ServiceHandles};

pub use handler::Ping;

pub const NAME: &str = "ping";

/// Factory resolver. Ping takes no parameters.
pub fn factory(
    name: &str,
    params: &str,
    _config: &ProtocolConfig,
    _handles: &ServiceHandles,
) -> Option<Arc<dyn Protocol>> {
    if !params.trim().is_empty() {
        return None;
    }
    Some(Arc::new(Ping::prototype(name)))
}
