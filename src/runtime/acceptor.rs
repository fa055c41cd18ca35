//! Accept loop for one listening socket.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::worker::{Incoming, WorkerHandle};
use crate::net::{ErrorSink, NetSocket};
use crate::protocol::Dispatcher;
use crate::runtime::Link;

/// Pause after a failed accept, e.g. when out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Acceptor {
    pub name: String,
    pub socket: NetSocket,
    pub dispatcher: Arc<Dispatcher>,
    pub workers: Vec<WorkerHandle>,
    pub shutdown: Arc<AtomicBool>,
    pub active: Arc<AtomicUsize>,
    pub max_connections: usize,
    /// Longest single wait in `accept`; bounds shutdown latency.
    pub accept_wait: Duration,
    pub sink: Arc<dyn ErrorSink>,
}

impl Acceptor {
    pub fn run(mut self) {
        info!(listener = %self.name, protocols = ?self.dispatcher.names(), "Acceptor started");
        let mut next = 0;

        while !self.shutdown.load(Ordering::Acquire) {
            match self.socket.accept(Some(self.accept_wait)) {
                Ok(None) => {}
                Ok(Some(fd)) => {
                    self.admit(fd, next);
                    next = next.wrapping_add(1);
                }
                Err(e) => {
                    if self.shutdown.load(Ordering::Acquire) || !self.socket.is_open() {
                        break;
                    }
                    warn!(
                        listener = %self.name,
                        error = %e,
                        errno = self.socket.last_error(),
                        "Accept failed"
                    );
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }

        self.socket.close();
        info!(listener = %self.name, "Acceptor stopped");
    }

    /// Wrap an accepted descriptor and hand it to a worker, round robin.
    fn admit(&self, fd: OwnedFd, next: usize) {
        if self.active.load(Ordering::Acquire) >= self.max_connections {
            warn!(
                listener = %self.name,
                max_connections = self.max_connections,
                "Connection limit reached"
            );
            return;
        }

        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let link = match Link::from_fd(id, fd, Some(Arc::clone(&self.sink))) {
            Ok(link) => link,
            Err(e) => {
                debug!(listener = %self.name, error = %e, "Dropping accepted connection");
                return;
            }
        };
        debug!(listener = %self.name, link = id, peer = link.peer(), "Accepted connection");

        self.active.fetch_add(1, Ordering::AcqRel);
        let worker = &self.workers[next % self.workers.len()];
        let incoming = Incoming {
            link,
            dispatcher: Arc::clone(&self.dispatcher),
        };
        if let Err(e) = worker.send(incoming) {
            warn!(listener = %self.name, error = %e, "Worker unavailable");
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
