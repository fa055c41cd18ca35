//! A live client connection and its buffered I/O.
//!
//! The link owns a non-blocking stream plus input and output buffers. Bytes
//! read during protocol sniffing stay in the input buffer, so the handler that
//! claims the link sees the stream from its first byte.

use std::io::{self, Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use mio::event::Source;
use mio::net::{TcpStream, UnixStream};
use mio::{Interest, Registry, Token};

use crate::net::{numeric_name, ErrorSink, NetSocket, SocketDomain};

/// Read chunk size
const READ_CHUNK: usize = 16 * 1024;

/// Most bytes one `fill` call takes off the socket.
pub const READ_BUDGET: usize = 64 * 1024;

/// Underlying transport of a link.
pub enum LinkStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for LinkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for LinkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Unix(stream) => stream.flush(),
        }
    }
}

impl Source for LinkStream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.register(registry, token, interests),
            Self::Unix(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.reregister(registry, token, interests),
            Self::Unix(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.deregister(registry),
            Self::Unix(stream) => stream.deregister(registry),
        }
    }
}

/// A connection being sniffed or served.
pub struct Link {
    id: u64,
    stream: LinkStream,
    peer: String,
    input: BytesMut,
    output: BytesMut,
    eof: bool,
    /// The last fill stopped at its limit, not at `WouldBlock`.
    unread: bool,
    bytes_in: u64,
    bytes_out: u64,
    connected_at: Instant,
    connected_wall: DateTime<Utc>,
    last_read: Instant,
}

impl Link {
    /// Build a link from an accepted descriptor.
    ///
    /// The descriptor is switched to non-blocking mode. The peer is recorded
    /// by numeric address; no name lookup happens here.
    pub fn from_fd(id: u64, fd: OwnedFd, sink: Option<Arc<dyn ErrorSink>>) -> io::Result<Link> {
        let mut socket = NetSocket::attach(sink, fd);
        let peer = socket
            .peer_addr()
            .map(|addr| numeric_name(&addr))
            .unwrap_or_else(|| "unknown".to_string());
        let is_unix = matches!(socket.domain(), Some(SocketDomain::Unix(_)));
        let fd = socket
            .detach()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "descriptor lost"))?;

        let stream = if is_unix {
            let std = StdUnixStream::from(fd);
            std.set_nonblocking(true)?;
            LinkStream::Unix(UnixStream::from_std(std))
        } else {
            let std = StdTcpStream::from(fd);
            std.set_nonblocking(true)?;
            LinkStream::Tcp(TcpStream::from_std(std))
        };

        Ok(Link::new(id, stream, peer))
    }

    fn new(id: u64, stream: LinkStream, peer: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            stream,
            peer,
            input: BytesMut::with_capacity(READ_CHUNK),
            output: BytesMut::new(),
            eof: false,
            unread: false,
            bytes_in: 0,
            bytes_out: 0,
            connected_at: now,
            connected_wall: Utc::now(),
            last_read: now,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read what is currently available into the input buffer, up to
    /// `READ_BUDGET` bytes.
    ///
    /// Returns the number of bytes added. A closed peer sets `is_eof` and
    /// is not an error.
    pub fn fill(&mut self) -> io::Result<usize> {
        self.fill_limited(READ_BUDGET)
    }

    /// Like `fill`, but takes at most `limit` bytes. When the limit is hit
    /// `has_unread` reports that the socket may still hold data.
    pub fn fill_limited(&mut self, limit: usize) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        self.unread = false;
        while !self.eof {
            if total >= limit {
                self.unread = true;
                break;
            }
            let want = (limit - total).min(READ_CHUNK);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    self.input.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if total > 0 {
            self.bytes_in += total as u64;
            self.last_read = Instant::now();
        }
        Ok(total)
    }

    /// Buffered input not yet consumed.
    pub fn peek(&self) -> &[u8] {
        &self.input
    }

    /// Drop `n` bytes from the front of the input buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.input.len());
        self.input.advance(n);
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Whether the last fill left bytes in the socket. Readiness is
    /// edge-triggered, so the caller must read again without waiting.
    pub fn has_unread(&self) -> bool {
        self.unread
    }

    /// Queue `data` and write as much as the socket accepts right now.
    pub fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.output.extend_from_slice(data);
        self.flush().map(|_| ())
    }

    /// Write queued output. Returns `true` once nothing is left queued.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.output.advance(n);
                    self.bytes_out += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Time since the connection was accepted.
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Wall-clock accept time.
    pub fn connected_since(&self) -> DateTime<Utc> {
        self.connected_wall
    }

    /// Time since bytes last arrived (or since accept, if none have).
    pub fn idle_for(&self) -> Duration {
        self.last_read.elapsed()
    }

    pub(crate) fn stream_mut(&mut self) -> &mut LinkStream {
        &mut self.stream
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("buffered", &self.input.len())
            .field("eof", &self.eof)
            .finish()
    }
}

/// A connected link plus the client end of its socket pair.
#[cfg(test)]
pub(crate) fn test_link(id: u64) -> (Link, StdUnixStream) {
    let (server, client) = StdUnixStream::pair().expect("socket pair");
    server.set_nonblocking(true).expect("nonblocking");
    let link = Link::new(
        id,
        LinkStream::Unix(UnixStream::from_std(server)),
        "localhost".to_string(),
    );
    (link, client)
}

/// Write `data` from the client side and pull it into the link.
#[cfg(test)]
pub(crate) fn feed(link: &mut Link, client: &mut StdUnixStream, data: &[u8]) {
    client.write_all(data).expect("client write");
    let mut got = 0;
    let deadline = Instant::now() + Duration::from_secs(2);
    while got < data.len() && Instant::now() < deadline {
        got += link.fill().expect("fill");
    }
    assert_eq!(got, data.len(), "link did not receive all bytes");
}

/// Read whatever the link has sent, waiting briefly for it to arrive.
#[cfg(test)]
pub(crate) fn drain(client: &mut StdUnixStream, expected: usize) -> Vec<u8> {
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    let mut out = vec![0u8; expected];
    client.read_exact(&mut out).expect("client read");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_peek_consume() {
        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"PING\r\nrest");

        assert_eq!(link.peek(), b"PING\r\nrest");
        link.consume(6);
        assert_eq!(link.peek(), b"rest");
        link.consume(100);
        assert!(link.peek().is_empty());
        assert_eq!(link.bytes_in(), 10);
    }

    #[test]
    fn test_fill_limited_leaves_rest_in_socket() {
        let (mut link, mut client) = test_link(1);
        client.write_all(&[b'a'; 3000]).unwrap();

        assert_eq!(link.fill_limited(1024).unwrap(), 1024);
        assert!(link.has_unread());
        assert_eq!(link.peek().len(), 1024);

        assert_eq!(link.fill().unwrap(), 3000 - 1024);
        assert!(!link.has_unread());
        assert_eq!(link.bytes_in(), 3000);
    }

    #[test]
    fn test_fill_stops_at_budget() {
        let (mut link, mut client) = test_link(1);
        let writer = std::thread::spawn(move || {
            client.write_all(&vec![b'z'; READ_BUDGET * 2]).unwrap();
            client
        });

        let mut total = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while total < READ_BUDGET * 2 && Instant::now() < deadline {
            let n = link.fill().unwrap();
            assert!(n <= READ_BUDGET);
            total += n;
        }
        assert_eq!(total, READ_BUDGET * 2);
        drop(writer.join().unwrap());
    }

    #[test]
    fn test_fill_without_data_is_not_eof() {
        let (mut link, _client) = test_link(1);
        assert_eq!(link.fill().unwrap(), 0);
        assert!(!link.is_eof());
    }

    #[test]
    fn test_eof_detected() {
        let (mut link, client) = test_link(1);
        drop(client);
        assert_eq!(link.fill().unwrap(), 0);
        assert!(link.is_eof());
    }

    #[test]
    fn test_send_reaches_peer() {
        let (mut link, mut client) = test_link(1);
        link.send(b"PONG\r\n").unwrap();
        assert!(!link.has_pending_output());
        assert_eq!(drain(&mut client, 6), b"PONG\r\n");
        assert_eq!(link.bytes_out(), 6);
    }

    #[test]
    fn test_from_fd_inet() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let link = Link::from_fd(7, OwnedFd::from(accepted), None).unwrap();
        assert_eq!(link.id(), 7);
        assert_eq!(link.peer(), "127.0.0.1");
        assert!(matches!(link.stream, LinkStream::Tcp(_)));
    }
}
