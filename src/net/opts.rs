//! Descriptor-level tuning helpers.
//!
//! These operate on any socket descriptor, owned by a `NetSocket` or not.
//! A batch is always attempted in full; the first failure is returned and
//! every failure is reported to the sink.

use std::io;
use std::os::fd::{AsFd, AsRawFd};

use socket2::SockRef;

use super::{ErrorSink, SockOpts};
use crate::error::SocketError;

struct Batch<'a> {
    sink: Option<&'a dyn ErrorSink>,
    target: String,
    first: Option<SocketError>,
}

impl<'a> Batch<'a> {
    fn new<F: AsRawFd>(fd: &F, sink: Option<&'a dyn ErrorSink>) -> Self {
        Self {
            sink,
            target: format!("fd {}", fd.as_raw_fd()),
            first: None,
        }
    }

    fn error(&self, op: &'static str, source: io::Error) -> SocketError {
        if let Some(sink) = self.sink {
            sink.report(&format!("{op} on {}", self.target), &source);
        }
        SocketError::Io {
            op,
            target: self.target.clone(),
            source,
        }
    }

    fn apply(&mut self, op: &'static str, result: io::Result<()>) {
        if let Err(e) = result {
            let err = self.error(op, e);
            self.first.get_or_insert(err);
        }
    }

    fn finish(self) -> Result<(), SocketError> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Apply `opts` to `fd`.
///
/// Flags that only make sense for TCP are skipped on Unix-domain sockets.
pub fn set_opts<F: AsFd + AsRawFd>(
    fd: &F,
    opts: SockOpts,
    sink: Option<&dyn ErrorSink>,
) -> Result<(), SocketError> {
    let sock = SockRef::from(fd);
    let mut batch = Batch::new(fd, sink);
    let is_inet = sock
        .local_addr()
        .map(|addr| addr.as_socket().is_some())
        .unwrap_or(false);

    if opts.contains(SockOpts::REUSEADDR) {
        batch.apply("set SO_REUSEADDR", sock.set_reuse_address(true));
    }
    if opts.contains(SockOpts::KEEPALIVE) && is_inet {
        batch.apply("set SO_KEEPALIVE", sock.set_keepalive(true));
    }
    if opts.contains(SockOpts::NODELAY) && is_inet {
        batch.apply("set TCP_NODELAY", sock.set_nodelay(true));
    }
    if opts.contains(SockOpts::NOLINGER) {
        batch.apply("set SO_LINGER", sock.set_linger(None));
    }
    if opts.contains(SockOpts::NONBLOCK) {
        batch.apply("set O_NONBLOCK", sock.set_nonblocking(true));
    }

    batch.finish()
}

/// Set both the send and receive buffer sizes of `fd` to `size` bytes.
pub fn set_window<F: AsFd + AsRawFd>(
    fd: &F,
    size: usize,
    sink: Option<&dyn ErrorSink>,
) -> Result<(), SocketError> {
    let sock = SockRef::from(fd);
    let mut batch = Batch::new(fd, sink);
    batch.apply("set SO_RCVBUF", sock.set_recv_buffer_size(size));
    batch.apply("set SO_SNDBUF", sock.set_send_buffer_size(size));
    batch.finish()
}

/// Current receive buffer size of `fd`, as reported by the kernel.
pub fn get_window<F: AsFd + AsRawFd>(
    fd: &F,
    sink: Option<&dyn ErrorSink>,
) -> Result<usize, SocketError> {
    let sock = SockRef::from(fd);
    let batch = Batch::new(fd, sink);
    sock.recv_buffer_size()
        .map_err(|e| batch.error("get SO_RCVBUF", e))
}
