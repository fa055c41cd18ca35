//! Single-descriptor socket wrapper.
//!
//! One `open` call covers every combination of role and domain:
//!
//! ```text
//!          client                         server
//!          unix          inet             unix          inet
//! target   /path         host[:port]      /path         "" or host
//! port     None          Some or None     None          Some(port)
//! flags    !SERVER       !SERVER          SERVER        SERVER
//! ```
//!
//! Binding a port always sets `SO_REUSEADDR`.

use std::ffi::CStr;
use std::fs::{self, DirBuilder};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::debug;

use super::{get_window, set_opts, set_window, ErrorSink, OpenFlags};
use crate::error::SocketError;

const LISTEN_BACKLOG: i32 = 1024;

/// Longest host name `getnameinfo` may return.
const NI_MAXHOST: usize = 1025;

/// Role assigned by the most recent `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Unattached,
    Client,
    /// Bound datagram socket.
    Server,
    /// Bound and listening stream socket.
    Listener,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketDomain {
    Unix(PathBuf),
    Inet,
}

/// Owner of at most one OS socket.
///
/// Dropping the value closes the descriptor and removes any filesystem node
/// this instance created.
pub struct NetSocket {
    sock: Option<Socket>,
    role: SocketRole,
    domain: Option<SocketDomain>,
    err_code: i32,
    peer_name: Option<String>,
    owned_path: Option<PathBuf>,
    sink: Option<Arc<dyn ErrorSink>>,
}

impl NetSocket {
    /// An unopened socket. No I/O is performed.
    pub fn new(sink: Option<Arc<dyn ErrorSink>>) -> Self {
        Self {
            sock: None,
            role: SocketRole::Unattached,
            domain: None,
            err_code: 0,
            peer_name: None,
            owned_path: None,
            sink,
        }
    }

    /// Wrap an already connected descriptor, e.g. one returned by `accept`.
    pub fn attach(sink: Option<Arc<dyn ErrorSink>>, fd: OwnedFd) -> Self {
        let sock = Socket::from(fd);
        let domain = match sock.local_addr() {
            Ok(addr) if addr.as_socket().is_some() => Some(SocketDomain::Inet),
            Ok(_) => Some(SocketDomain::Unix(PathBuf::new())),
            Err(_) => None,
        };
        let mut this = Self::new(sink);
        this.sock = Some(sock);
        this.role = SocketRole::Client;
        this.domain = domain;
        this
    }

    /// Create a named Unix-domain server socket at `base/file`.
    ///
    /// A stale socket node at the path is replaced; any other file there makes
    /// this fail and is left untouched. The node is chmod'ed to `mode` and is
    /// removed again when the returned socket closes.
    pub fn create(
        sink: Option<Arc<dyn ErrorSink>>,
        base: &Path,
        file: &str,
        mode: u32,
        datagram: bool,
    ) -> Result<NetSocket, SocketError> {
        let path = Self::socket_path(sink.as_deref(), base, file, mode)?;
        let target = path.to_string_lossy().into_owned();

        let mut socket = NetSocket::new(sink);
        let mut flags = OpenFlags::SERVER;
        if datagram {
            flags |= OpenFlags::UDP;
        }
        socket.open(&target, None, flags, 0)?;

        if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(mode)) {
            let err = socket.fail("chmod", &target, e);
            socket.close();
            return Err(err);
        }

        Ok(socket)
    }

    /// Open the socket per the table in the module docs and return its
    /// descriptor.
    ///
    /// Only one descriptor may be live; call `close` or `detach` first to
    /// reopen. `window` > 0 sets the send and receive buffer sizes.
    pub fn open(
        &mut self,
        target: &str,
        port: Option<u16>,
        flags: OpenFlags,
        window: usize,
    ) -> Result<RawFd, SocketError> {
        if self.sock.is_some() {
            self.err_code = libc::EBUSY;
            return Err(SocketError::AlreadyOpen);
        }
        self.err_code = 0;
        self.peer_name = None;

        let ty = if flags.contains(OpenFlags::UDP) {
            Type::DGRAM
        } else {
            Type::STREAM
        };
        let server = flags.contains(OpenFlags::SERVER);

        let (sock, role, domain) = if target.starts_with('/') {
            let path = PathBuf::from(target);
            let (sock, role) = if server {
                self.bind_unix(&path, ty, window)?
            } else {
                (self.connect_unix(&path, ty, window)?, SocketRole::Client)
            };
            (sock, role, SocketDomain::Unix(path))
        } else if server {
            let (sock, role) = self.bind_inet(target, port, ty, window)?;
            (sock, role, SocketDomain::Inet)
        } else {
            let sock = self.connect_inet(target, port, ty, window)?;
            (sock, SocketRole::Client, SocketDomain::Inet)
        };

        let opts = flags.sock_opts();
        if !opts.is_empty() {
            if let Err(e) = set_opts(&sock, opts, self.sink.as_deref()) {
                self.err_code = e.errno();
                if let SocketDomain::Unix(path) = &domain {
                    if server {
                        let _ = fs::remove_file(path);
                    }
                }
                return Err(e);
            }
        }

        let fd = sock.as_raw_fd();
        if server {
            if let SocketDomain::Unix(path) = &domain {
                self.owned_path = Some(path.clone());
            }
        }
        debug!(fd, target, role = ?role, "Socket opened");

        self.sock = Some(sock);
        self.role = role;
        self.domain = Some(domain);
        Ok(fd)
    }

    /// Wait up to `timeout` (forever if `None`) for an incoming connection.
    ///
    /// Returns `Ok(None)` when the wait expires; `last_error` is then 0. The
    /// accepted descriptor is close-on-exec.
    pub fn accept(&mut self, timeout: Option<Duration>) -> Result<Option<OwnedFd>, SocketError> {
        let fd = match (&self.sock, self.role) {
            (None, _) => {
                self.err_code = libc::EBADF;
                return Err(SocketError::NotOpen);
            }
            (Some(sock), SocketRole::Listener) => sock.as_raw_fd(),
            (Some(_), _) => {
                self.err_code = libc::EINVAL;
                return Err(SocketError::NotListening);
            }
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let wait_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    // Round up so a sub-millisecond remainder still waits.
                    left.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32
                }
            };

            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: `pfd` is a valid pollfd for the duration of the call.
            let rc = unsafe { libc::poll(&mut pfd, 1, wait_ms) };
            if rc < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(self.fail("poll", "listener", e));
            }
            if rc == 0 {
                self.err_code = 0;
                return Ok(None);
            }
            break;
        }

        let accepted = match self.sock.as_ref().map(accept_retry) {
            Some(Ok(conn)) => conn,
            Some(Err(e)) => return Err(self.fail("accept", "listener", e)),
            None => return Err(SocketError::NotOpen),
        };
        if let Err(e) = accepted.set_cloexec(true) {
            return Err(self.fail("set FD_CLOEXEC", "accepted socket", e));
        }

        self.err_code = 0;
        Ok(Some(accepted.into()))
    }

    /// Release the descriptor and any socket node this instance created.
    pub fn close(&mut self) {
        if let Some(sock) = self.sock.take() {
            debug!(fd = sock.as_raw_fd(), "Socket closed");
        }
        if let Some(path) = self.owned_path.take() {
            let _ = fs::remove_file(path);
        }
        self.reset();
    }

    /// Hand the descriptor to the caller without closing it.
    pub fn detach(&mut self) -> Option<OwnedFd> {
        let sock = self.sock.take();
        self.owned_path = None;
        self.reset();
        sock.map(OwnedFd::from)
    }

    fn reset(&mut self) {
        self.role = SocketRole::Unattached;
        self.domain = None;
        self.peer_name = None;
    }

    pub fn last_error(&self) -> i32 {
        self.err_code
    }

    pub fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    pub fn domain(&self) -> Option<&SocketDomain> {
        self.domain.as_ref()
    }

    pub fn sock_num(&self) -> Option<RawFd> {
        self.sock.as_ref().map(|s| s.as_raw_fd())
    }

    /// Raw address of the remote endpoint.
    pub fn peer_addr(&self) -> Option<SockAddr> {
        self.sock.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Host name of the remote endpoint. May block on a DNS lookup.
    ///
    /// Reverse lookup falls back to the numeric address; Unix-domain peers
    /// are reported as `localhost`. The result is cached until the socket
    /// closes.
    #[allow(dead_code)]
    pub fn peer_name(&mut self) -> Option<&str> {
        if self.peer_name.is_none() {
            let addr = match self.sock.as_ref().map(Socket::peer_addr) {
                Some(Ok(addr)) => addr,
                Some(Err(e)) => {
                    let _ = self.fail("getpeername", "socket", e);
                    return None;
                }
                None => {
                    self.err_code = libc::EBADF;
                    return None;
                }
            };
            let name = match addr.as_socket() {
                Some(_) => reverse_lookup(&addr).unwrap_or_else(|| numeric_name(&addr)),
                None => numeric_name(&addr),
            };
            self.peer_name = Some(name);
        }
        self.peer_name.as_deref()
    }

    /// Textual local name: `ip:port` for Internet sockets, the path for Unix.
    pub fn sock_name(&mut self) -> Result<String, SocketError> {
        if let (Some(SocketDomain::Unix(path)), SocketRole::Server | SocketRole::Listener) =
            (&self.domain, self.role)
        {
            if !path.as_os_str().is_empty() {
                return Ok(path.display().to_string());
            }
        }
        match self.sock.as_ref().map(Socket::local_addr) {
            Some(Ok(addr)) => Ok(match addr.as_socket() {
                Some(inet) => inet.to_string(),
                None => "localhost".to_string(),
            }),
            Some(Err(e)) => Err(self.fail("getsockname", "socket", e)),
            None => {
                self.err_code = libc::EBADF;
                Err(SocketError::NotOpen)
            }
        }
    }

    /// Bound local address of an Internet socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    /// Compute the path of a named socket at `base/file`, creating missing
    /// directories with `mode`. An empty `file` means `base` itself names the
    /// socket.
    ///
    /// The socket node is not created. If the full path exists it must
    /// already be a socket.
    pub fn socket_path(
        sink: Option<&dyn ErrorSink>,
        base: &Path,
        file: &str,
        mode: u32,
    ) -> Result<PathBuf, SocketError> {
        let path = if file.is_empty() {
            base.to_path_buf()
        } else {
            base.join(file)
        };

        let report = |op: &'static str, e: io::Error| {
            if let Some(sink) = sink {
                sink.report(&format!("{op} {}", path.display()), &e);
            }
            SocketError::Io {
                op,
                target: path.display().to_string(),
                source: e,
            }
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            // Directories need search permission to be usable at all.
            DirBuilder::new()
                .recursive(true)
                .mode(mode | 0o700)
                .create(dir)
                .map_err(|e| report("mkdir", e))?;
        }

        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_socket() => Ok(path),
            Ok(_) => {
                if let Some(sink) = sink {
                    let e = io::Error::from_raw_os_error(libc::ENOTSOCK);
                    sink.report(&format!("validate {}", path.display()), &e);
                }
                Err(SocketError::NotSocket { path })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(path),
            Err(e) => Err(report("stat", e)),
        }
    }

    fn bind_unix(
        &mut self,
        path: &Path,
        ty: Type,
        window: usize,
    ) -> Result<(Socket, SocketRole), SocketError> {
        let target = path.display().to_string();
        let addr = SockAddr::unix(path).map_err(|e| self.fail("resolve", &target, e))?;
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                // Only a node nobody answers on may be replaced.
                let probe = self.new_socket(Domain::UNIX, ty, &target)?;
                match probe.connect(&addr) {
                    Ok(()) => {
                        self.err_code = libc::EADDRINUSE;
                        return Err(SocketError::InUse {
                            path: path.to_path_buf(),
                        });
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::ConnectionRefused
                            || e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(self.fail("connect", &target, e)),
                }
                fs::remove_file(path).map_err(|e| self.fail("unlink", &target, e))?;
            }
            Ok(_) => {
                self.err_code = libc::ENOTSOCK;
                return Err(SocketError::NotSocket {
                    path: path.to_path_buf(),
                });
            }
            Err(_) => {}
        }

        let sock = self.new_socket(Domain::UNIX, ty, &target)?;
        self.apply_window(&sock, window)?;
        sock.bind(&addr).map_err(|e| self.fail("bind", &target, e))?;

        if ty == Type::STREAM {
            if let Err(e) = sock.listen(LISTEN_BACKLOG) {
                let _ = fs::remove_file(path);
                return Err(self.fail("listen", &target, e));
            }
            Ok((sock, SocketRole::Listener))
        } else {
            Ok((sock, SocketRole::Server))
        }
    }

    fn connect_unix(&mut self, path: &Path, ty: Type, window: usize) -> Result<Socket, SocketError> {
        let target = path.display().to_string();
        let addr = SockAddr::unix(path).map_err(|e| self.fail("resolve", &target, e))?;
        let sock = self.new_socket(Domain::UNIX, ty, &target)?;
        self.apply_window(&sock, window)?;
        sock.connect(&addr)
            .map_err(|e| self.fail("connect", &target, e))?;
        Ok(sock)
    }

    fn bind_inet(
        &mut self,
        host: &str,
        port: Option<u16>,
        ty: Type,
        window: usize,
    ) -> Result<(Socket, SocketRole), SocketError> {
        let port = port.unwrap_or(0);
        let addr = if host.is_empty() {
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            self.resolve(host, port)?
                .into_iter()
                .next()
                .ok_or_else(|| SocketError::InvalidTarget(host.to_string()))?
        };
        let target = addr.to_string();

        let sock = self.new_socket(Domain::for_address(addr), ty, &target)?;
        sock.set_reuse_address(true)
            .map_err(|e| self.fail("set SO_REUSEADDR", &target, e))?;
        self.apply_window(&sock, window)?;
        sock.bind(&addr.into())
            .map_err(|e| self.fail("bind", &target, e))?;

        if ty == Type::STREAM {
            sock.listen(LISTEN_BACKLOG)
                .map_err(|e| self.fail("listen", &target, e))?;
            Ok((sock, SocketRole::Listener))
        } else {
            Ok((sock, SocketRole::Server))
        }
    }

    fn connect_inet(
        &mut self,
        target: &str,
        port: Option<u16>,
        ty: Type,
        window: usize,
    ) -> Result<Socket, SocketError> {
        let (host, port) = match port {
            Some(port) => (target, port),
            None => {
                let (host, port) = target
                    .rsplit_once(':')
                    .ok_or_else(|| self.invalid(target))?;
                let port = port.parse::<u16>().map_err(|_| self.invalid(target))?;
                (host.trim_start_matches('[').trim_end_matches(']'), port)
            }
        };
        if host.is_empty() {
            return Err(self.invalid(target));
        }

        let mut last = None;
        for addr in self.resolve(host, port)? {
            let sock = self.new_socket(Domain::for_address(addr), ty, target)?;
            self.apply_window(&sock, window)?;
            match sock.connect(&addr.into()) {
                Ok(()) => return Ok(sock),
                Err(e) => last = Some(e),
            }
        }
        let e = last.unwrap_or_else(|| io::Error::from_raw_os_error(libc::EHOSTUNREACH));
        Err(self.fail("connect", target, e))
    }

    fn resolve(&mut self, host: &str, port: u16) -> Result<Vec<SocketAddr>, SocketError> {
        match (host, port).to_socket_addrs() {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    return Err(self.invalid(host));
                }
                Ok(addrs)
            }
            Err(e) => {
                self.err_code = e.raw_os_error().unwrap_or(libc::EHOSTUNREACH);
                if let Some(sink) = &self.sink {
                    sink.report(&format!("resolve {host}"), &e);
                }
                Err(SocketError::Resolve {
                    target: format!("{host}:{port}"),
                    source: e,
                })
            }
        }
    }

    fn new_socket(&mut self, domain: Domain, ty: Type, target: &str) -> Result<Socket, SocketError> {
        Socket::new(domain, ty, None).map_err(|e| self.fail("socket", target, e))
    }

    fn apply_window(&mut self, sock: &Socket, window: usize) -> Result<(), SocketError> {
        if window == 0 {
            return Ok(());
        }
        set_window(sock, window, self.sink.as_deref()).map_err(|e| {
            self.err_code = e.errno();
            e
        })?;
        if let Ok(actual) = get_window(sock, None) {
            debug!(requested = window, actual, "Socket window set");
        }
        Ok(())
    }

    fn invalid(&mut self, target: &str) -> SocketError {
        self.err_code = libc::EINVAL;
        SocketError::InvalidTarget(target.to_string())
    }

    fn fail(&mut self, op: &'static str, target: &str, e: io::Error) -> SocketError {
        self.err_code = e.raw_os_error().unwrap_or(libc::EIO);
        if let Some(sink) = &self.sink {
            sink.report(&format!("{op} {target}"), &e);
        }
        SocketError::Io {
            op,
            target: target.to_string(),
            source: e,
        }
    }
}

impl Drop for NetSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for NetSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetSocket")
            .field("fd", &self.sock_num())
            .field("role", &self.role)
            .field("domain", &self.domain)
            .field("err_code", &self.err_code)
            .finish()
    }
}

/// Printable peer address without any name lookup: the IP for Internet
/// peers, `localhost` for Unix ones.
pub fn numeric_name(addr: &SockAddr) -> String {
    match addr.as_socket() {
        Some(inet) => inet.ip().to_string(),
        None => "localhost".to_string(),
    }
}

fn accept_retry(sock: &Socket) -> io::Result<Socket> {
    loop {
        match sock.accept() {
            Ok((conn, _)) => return Ok(conn),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn reverse_lookup(addr: &SockAddr) -> Option<String> {
    let mut host = [0 as libc::c_char; NI_MAXHOST];
    // SAFETY: `addr` points at a valid sockaddr of `addr.len()` bytes and
    // `host` is writable for its full length.
    let rc = unsafe {
        libc::getnameinfo(
            addr.as_ptr().cast::<libc::sockaddr>(),
            addr.len(),
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }
    // SAFETY: getnameinfo NUL-terminates the host buffer on success.
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}
