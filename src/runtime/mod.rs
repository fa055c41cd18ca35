//! Listener, acceptor and worker runtime.
//!
//! Startup walks the configured protocols in order. For each one the port is
//! resolved, a listener is bound (protocols resolving to the same fixed port
//! share it), the bound address is recorded in the protocol's configuration
//! snapshot, and only then is the protocol's factory resolved.
//!
//! Threads:
//! - one acceptor per listener, waiting in `NetSocket::accept`
//! - `workers` mio event loops; accepted links are handed out round robin

mod acceptor;
mod connection;
pub mod link;
mod worker;

pub use link::Link;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::StartupError;
use crate::net::{ErrorSink, NetSocket, OpenFlags, SocketDomain, TracingSink};
use crate::protocol::{
    Dispatcher, PortChoice, Protocol, ProtocolConfig, ProtocolRegistry, ServiceHandles,
};
use acceptor::Acceptor;
use worker::{Timeouts, Worker, WorkerHandle};

/// Name of the administrative socket inside the admin directory.
const ADMIN_SOCKET: &str = "admin";

/// A bound listener and the protocols probed on it, in priority order.
struct Listener {
    name: String,
    port: Option<u16>,
    socket: NetSocket,
    dispatcher: Dispatcher,
}

/// Where a listener ended up.
#[derive(Debug, Clone)]
pub struct BoundListener {
    pub protocols: Vec<String>,
    /// `None` for the Unix-domain admin listener.
    pub addr: Option<SocketAddr>,
    pub path: Option<PathBuf>,
}

/// Running server.
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    threads: Vec<JoinHandle<()>>,
    listeners: Vec<BoundListener>,
    handles: ServiceHandles,
}

impl ServerHandle {
    /// Ask every thread to stop. Returns immediately; use `join` to wait.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in &self.workers {
            let _ = worker.wake();
        }
    }

    /// Wait for every acceptor and worker to exit.
    pub fn join(self) {
        for handle in self.threads {
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                error!(thread = ?name, "Thread panicked");
            }
        }
        debug!(report = %self.handles.stats.report(), "Final statistics");
    }

    pub fn listeners(&self) -> &[BoundListener] {
        &self.listeners
    }

    /// Internet address serving `protocol`.
    pub fn local_addr(&self, protocol: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .filter(|l| l.protocols.iter().any(|p| p == protocol))
            .find_map(|l| l.addr)
    }

    #[cfg(test)]
    pub fn admin_path(&self) -> Option<&std::path::Path> {
        self.listeners.iter().find_map(|l| l.path.as_deref())
    }
}

/// Bind every configured protocol and start serving.
pub fn start(config: &Config, registry: &ProtocolRegistry) -> Result<ServerHandle, StartupError> {
    if config.protocols.is_empty() {
        return Err(StartupError::NoProtocols);
    }

    let sink: Arc<dyn ErrorSink> = Arc::new(TracingSink);
    let handles = ServiceHandles::new(Arc::clone(&sink), config.env.clone());
    let base = ProtocolConfig::from_config(config);

    let mut listeners: Vec<Listener> = Vec::new();
    let mut loaded: Vec<Arc<dyn Protocol>> = Vec::new();

    for entry in &config.protocols {
        let mut pcfg = base.clone();
        pcfg.port = entry.port.or(config.port).map_or(-1, i32::from);

        let choice = registry.resolve_port(&entry.name, &entry.params, &pcfg)?;
        let port = choice.port().ok_or_else(|| StartupError::Port {
            name: entry.name.clone(),
        })?;

        let shared = match choice {
            PortChoice::Exact(port) => listeners.iter().position(|l| l.port == Some(port)),
            _ => None,
        };
        let idx = match shared {
            Some(idx) => idx,
            None => {
                let listener = bind(config, &entry.name, port, &sink)?;
                listeners.push(Listener {
                    port: matches!(choice, PortChoice::Exact(_)).then_some(port),
                    ..listener
                });
                listeners.len() - 1
            }
        };

        let listener = &mut listeners[idx];
        let addr = listener.socket.local_addr();
        pcfg.listener = addr;
        if let Some(addr) = addr {
            pcfg.port = i32::from(addr.port());
        }

        let protocol = registry.resolve_factory(&entry.name, &entry.params, &pcfg, &handles)?;
        handles.stats.register(Arc::clone(&protocol));
        listener.dispatcher.push(Arc::clone(&protocol));
        loaded.push(protocol);

        info!(
            protocol = %entry.name,
            params = %entry.params,
            listener = %listener.name,
            "Protocol loaded"
        );
    }

    if let Some(dir) = &config.admin_path {
        let socket = NetSocket::create(
            Some(Arc::clone(&sink)),
            dir,
            ADMIN_SOCKET,
            config.admin_mode,
            false,
        )
        .map_err(|source| StartupError::Bind {
            name: ADMIN_SOCKET.to_string(),
            source,
        })?;
        let mut dispatcher = Dispatcher::new();
        for protocol in &loaded {
            dispatcher.push(Arc::clone(protocol));
        }
        let name = dir.join(ADMIN_SOCKET).display().to_string();
        info!(path = %name, mode = %format!("{:o}", config.admin_mode), "Admin socket ready");
        listeners.push(Listener {
            name,
            port: None,
            socket,
            dispatcher,
        });
    }

    spawn(config, listeners, handles)
}

fn bind(
    config: &Config,
    protocol: &str,
    port: u16,
    sink: &Arc<dyn ErrorSink>,
) -> Result<Listener, StartupError> {
    let mut socket = NetSocket::new(Some(Arc::clone(sink)));
    socket
        .open(&config.host, Some(port), OpenFlags::SERVER, config.window_size)
        .map_err(|source| StartupError::Bind {
            name: protocol.to_string(),
            source,
        })?;
    let name = socket
        .sock_name()
        .unwrap_or_else(|_| format!("{}:{}", config.host, port));
    info!(protocol, addr = %name, role = ?socket.role(), "Listener bound");
    Ok(Listener {
        name,
        port: None,
        socket,
        dispatcher: Dispatcher::new(),
    })
}

fn spawn(
    config: &Config,
    listeners: Vec<Listener>,
    handles: ServiceHandles,
) -> Result<ServerHandle, StartupError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let active = Arc::new(AtomicUsize::new(0));
    let timeouts = Timeouts {
        hail: config.hail_wait,
        idle: config.idle_wait,
        read: config.read_wait,
    };
    let num_workers = config.workers.max(1);
    let per_worker = config.max_connections.div_ceil(num_workers).max(1);

    let mut threads = Vec::with_capacity(num_workers + listeners.len());
    let mut workers = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let (worker, handle) = Worker::new(
            worker_id,
            per_worker,
            timeouts,
            Arc::clone(&shutdown),
            Arc::clone(&active),
        )?;
        let thread = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = worker.run() {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;
        threads.push(thread);
        workers.push(handle);
    }

    let mut bound = Vec::with_capacity(listeners.len());
    for (idx, listener) in listeners.into_iter().enumerate() {
        let (addr, path) = match listener.socket.domain() {
            Some(SocketDomain::Unix(path)) => (None, Some(path.clone())),
            _ => (listener.socket.local_addr(), None),
        };
        let names = listener.dispatcher.names().iter().map(|s| s.to_string()).collect();
        bound.push(BoundListener {
            protocols: names,
            addr,
            path,
        });

        let acceptor = Acceptor {
            name: listener.name,
            socket: listener.socket,
            dispatcher: Arc::new(listener.dispatcher),
            workers: workers.clone(),
            shutdown: Arc::clone(&shutdown),
            active: Arc::clone(&active),
            max_connections: config.max_connections,
            accept_wait: config.accept_wait,
            sink: Arc::clone(&handles.errors),
        };
        let thread = thread::Builder::new()
            .name(format!("acceptor-{idx}"))
            .spawn(move || acceptor.run());
        match thread {
            Ok(thread) => threads.push(thread),
            Err(e) => {
                warn!(error = %e, "Failed to spawn acceptor");
                shutdown.store(true, Ordering::Release);
                for worker in &workers {
                    let _ = worker.wake();
                }
                return Err(e.into());
            }
        }
    }

    info!(
        workers = num_workers,
        listeners = bound.len(),
        max_connections = config.max_connections,
        "Server started"
    );

    Ok(ServerHandle {
        shutdown,
        workers,
        threads,
        listeners: bound,
        handles,
    })
}
