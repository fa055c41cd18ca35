//! Protocol implementations.
//!
//! Each protocol has a parser module and a handler implementing
//! [`crate::protocol::Protocol`].
//!
//! - `ping`: minimal ping/pong for health checks
//! - `echo`: length-prefixed echo for I/O testing
//! - `stats`: one-shot statistics report

pub mod echo;
pub mod ping;
pub mod stats;

/// Sessions kept idle per protocol for reuse.
pub(crate) const POOL_SIZE: usize = 256;

/// Find \r\n in buffer, returning the position of \r.
pub(crate) fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
