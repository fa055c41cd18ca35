//! mio event loop driving links.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! link performs non-blocking reads and writes. Each worker owns its poll
//! instance and its links, so every `process` call for a link happens on one
//! thread, in order.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

use super::connection::{LinkEntry, LinkRegistry, LinkState};
use crate::protocol::{Dispatcher, ProcessResult};
use crate::runtime::Link;

pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Bytes a link may send before some protocol must have claimed it.
pub const MAX_HAIL_BYTES: usize = 1024;

/// How often timeouts are checked and live counters synced.
const TICK: Duration = Duration::from_millis(100);

/// Longest a closing link may take to flush its last output.
const DRAIN_WAIT: Duration = Duration::from_secs(1);

/// An accepted link on its way to a worker.
pub(crate) struct Incoming {
    pub link: Link,
    pub dispatcher: Arc<Dispatcher>,
}

/// Sending side of a worker's queue.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    tx: Sender<Incoming>,
    waker: Arc<Waker>,
}

impl WorkerHandle {
    /// Queue a link and wake the worker. Fails only if the worker has exited,
    /// in which case the link is dropped.
    pub fn send(&self, incoming: Incoming) -> io::Result<()> {
        self.tx
            .send(incoming)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker stopped"))?;
        if let Err(e) = self.waker.wake() {
            // Queued anyway; the next wake or tick picks it up.
            debug!(error = %e, "Worker wake failed");
        }
        Ok(())
    }

    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

/// Per-link time limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeouts {
    pub hail: Duration,
    /// Zero disables the check.
    pub idle: Duration,
    /// Zero disables the check.
    pub read: Duration,
}

pub(crate) struct Worker {
    id: usize,
    poll: Poll,
    incoming: Receiver<Incoming>,
    links: LinkRegistry,
    timeouts: Timeouts,
    shutdown: Arc<AtomicBool>,
    /// Links alive across all workers; shared with the acceptors.
    active: Arc<AtomicUsize>,
    /// Links whose last read stopped at its budget.
    ready: Vec<usize>,
}

impl Worker {
    pub fn new(
        id: usize,
        max_links: usize,
        timeouts: Timeouts,
        shutdown: Arc<AtomicBool>,
        active: Arc<AtomicUsize>,
    ) -> io::Result<(Worker, WorkerHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, incoming) = std::sync::mpsc::channel();
        let worker = Worker {
            id,
            poll,
            incoming,
            links: LinkRegistry::new(max_links),
            timeouts,
            shutdown,
            active,
            ready: Vec::new(),
        };
        Ok((worker, WorkerHandle { tx, waker }))
    }

    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut last_tick = Instant::now();

        info!(worker = self.id, "Worker started");

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = if self.ready.is_empty() {
                TICK
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => self.admit(),
                    Token(key) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.on_readable(key);
                        }
                        if event.is_writable() {
                            self.on_writable(key);
                        }
                    }
                }
            }

            for key in std::mem::take(&mut self.ready) {
                self.on_readable(key);
            }

            if last_tick.elapsed() >= TICK {
                self.tick();
                last_tick = Instant::now();
            }
        }

        info!(worker = self.id, links = self.links.len(), "Worker stopping");
        for key in self.links.keys() {
            self.finish(key, Some("server shutdown"));
            self.close(key);
        }
        info!(worker = self.id, "Worker stopped");
        Ok(())
    }

    /// Register every queued link and give it a first hail attempt.
    fn admit(&mut self) {
        while let Ok(Incoming { link, dispatcher }) = self.incoming.try_recv() {
            let id = link.id();
            let entry = LinkEntry::new(link, dispatcher, Instant::now() + self.timeouts.hail);
            let key = match self.links.insert(entry) {
                Ok(key) => key,
                Err(_) => {
                    warn!(worker = self.id, link = id, "Worker link table full");
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }
            };

            let Some(entry) = self.links.get_mut(key) else {
                continue;
            };
            if let Err(e) = self.poll.registry().register(
                entry.link.stream_mut(),
                Token(key),
                Interest::READABLE,
            ) {
                warn!(worker = self.id, link = id, error = %e, "Failed to register link");
                self.close(key);
                continue;
            }
            debug!(worker = self.id, link = id, peer = entry.link.peer(), "Link admitted");
            self.on_readable(key);
        }
    }

    fn on_readable(&mut self, key: usize) {
        let Some(entry) = self.links.get_mut(key) else {
            return;
        };
        if matches!(entry.state, LinkState::Hailing { .. }) {
            self.hail(key);
        } else if entry.is_active() {
            self.process(key);
        }

        // No new edge arrives for bytes left behind; revisit next loop.
        if let Some(entry) = self.links.get_mut(key) {
            if entry.link.has_unread() && !self.ready.contains(&key) {
                self.ready.push(key);
            }
        }
    }

    /// Probe the dispatcher with the bytes received so far.
    fn hail(&mut self, key: usize) {
        let Some(entry) = self.links.get_mut(key) else {
            return;
        };
        let room = MAX_HAIL_BYTES.saturating_sub(entry.link.peek().len());
        if let Err(e) = entry.link.fill_limited(room) {
            debug!(link = entry.link.id(), error = %e, "Read failed while hailing");
            self.close(key);
            return;
        }

        match entry.dispatcher.dispatch(&entry.link) {
            Some((idx, handler)) => {
                debug!(
                    link = entry.link.id(),
                    protocol = handler.name(),
                    "Link claimed"
                );
                entry.activate(handler, idx);
                self.process(key);
            }
            None if entry.link.is_eof() || entry.link.peek().len() >= MAX_HAIL_BYTES => {
                debug!(
                    link = entry.link.id(),
                    peer = entry.link.peer(),
                    protocols = ?entry.dispatcher.names(),
                    "Unrecognized protocol"
                );
                self.close(key);
            }
            None => {}
        }
    }

    fn process(&mut self, key: usize) {
        let Some(entry) = self.links.get_mut(key) else {
            return;
        };
        let LinkEntry { link, state, .. } = entry;
        let LinkState::Active { handler, .. } = state else {
            return;
        };

        match handler.process(link) {
            ProcessResult::Continue => self.update_interest(key),
            ProcessResult::Close => {
                self.finish(key, None);
            }
            ProcessResult::Fatal(reason) => {
                debug!(link = link.id(), reason = %reason, "Protocol failure");
                self.finish(key, Some(&reason));
            }
        }
    }

    fn on_writable(&mut self, key: usize) {
        let Some(entry) = self.links.get_mut(key) else {
            return;
        };
        match entry.link.flush() {
            Ok(true) if matches!(entry.state, LinkState::Draining { .. }) => self.close(key),
            Ok(_) => self.update_interest(key),
            Err(e) => {
                debug!(link = entry.link.id(), error = %e, "Write failed");
                self.finish(key, Some("write error"));
            }
        }
    }

    /// Register WRITABLE interest exactly while output is queued.
    fn update_interest(&mut self, key: usize) {
        let Some(entry) = self.links.get_mut(key) else {
            return;
        };
        let want = entry.link.has_pending_output();
        if want == entry.writable {
            return;
        }
        let interest = if want {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self
            .poll
            .registry()
            .reregister(entry.link.stream_mut(), Token(key), interest)
        {
            Ok(()) => entry.writable = want,
            Err(e) => {
                debug!(link = entry.link.id(), error = %e, "Reregister failed");
                self.close(key);
            }
        }
    }

    /// End the link's session, recycling the handler exactly once, then close
    /// once queued output is flushed.
    fn finish(&mut self, key: usize, reason: Option<&str>) {
        let Some(entry) = self.links.get_mut(key) else {
            return;
        };
        if entry.is_active() {
            debug!(
                link = entry.link.id(),
                protocol = entry.protocol_name(),
                reason,
                "Session ended"
            );
        }
        if let Some(handler) = entry.deactivate(Instant::now() + DRAIN_WAIT) {
            let connected = entry.link.connected_for();
            handler.recycle(Some(&mut entry.link), connected, reason);
        }

        match entry.link.flush() {
            Ok(false) => self.update_interest(key),
            _ => self.close(key),
        }
    }

    /// Drop the link without further I/O.
    fn close(&mut self, key: usize) {
        let Some(mut entry) = self.links.remove(key) else {
            return;
        };
        if let Some(handler) = entry.deactivate(Instant::now()) {
            let connected = entry.link.connected_for();
            handler.recycle(Some(&mut entry.link), connected, Some("link closed"));
        }
        let _ = self.poll.registry().deregister(entry.link.stream_mut());
        self.active.fetch_sub(1, Ordering::AcqRel);
        debug!(
            worker = self.id,
            link = entry.link.id(),
            bytes_in = entry.link.bytes_in(),
            bytes_out = entry.link.bytes_out(),
            since = %entry.link.connected_since(),
            "Link closed"
        );
    }

    /// Enforce time limits and sync live statistics.
    fn tick(&mut self) {
        let now = Instant::now();
        let Timeouts { idle, read, .. } = self.timeouts;

        for key in self.links.keys() {
            let Some(entry) = self.links.get_mut(key) else {
                continue;
            };
            let link = &entry.link;
            match &entry.state {
                LinkState::Hailing { deadline } if now >= *deadline => {
                    debug!(link = link.id(), peer = link.peer(), "Hail timeout");
                    self.close(key);
                }
                LinkState::Draining { deadline } if now >= *deadline => self.close(key),
                LinkState::Active { .. } if !idle.is_zero() && link.idle_for() >= idle => {
                    self.finish(key, Some("idle timeout"));
                }
                LinkState::Active { .. }
                    if !read.is_zero() && !link.peek().is_empty() && link.idle_for() >= read =>
                {
                    self.finish(key, Some("read timeout"));
                }
                LinkState::Active { handler, .. } => {
                    handler.stats(None, true);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::PrefixProtocol;
    use crate::runtime::link::{drain, test_link};
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::thread;

    struct Harness {
        handle: WorkerHandle,
        shutdown: Arc<AtomicBool>,
        active: Arc<AtomicUsize>,
        thread: thread::JoinHandle<io::Result<()>>,
    }

    impl Harness {
        fn start(timeouts: Timeouts) -> Harness {
            let shutdown = Arc::new(AtomicBool::new(false));
            let active = Arc::new(AtomicUsize::new(0));
            let (worker, handle) =
                Worker::new(0, 16, timeouts, Arc::clone(&shutdown), Arc::clone(&active))
                    .unwrap();
            let thread = thread::spawn(move || worker.run());
            Harness {
                handle,
                shutdown,
                active,
                thread,
            }
        }

        fn connect(&self, id: u64, dispatcher: &Arc<Dispatcher>) -> UnixStream {
            let (link, client) = test_link(id);
            self.active.fetch_add(1, Ordering::AcqRel);
            self.handle
                .send(Incoming {
                    link,
                    dispatcher: Arc::clone(dispatcher),
                })
                .unwrap();
            client
        }

        fn stop(self) {
            self.shutdown.store(true, Ordering::Release);
            self.handle.wake().unwrap();
            self.thread.join().unwrap().unwrap();
        }
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            hail: Duration::from_secs(5),
            idle: Duration::ZERO,
            read: Duration::ZERO,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn dispatcher_of(protos: &[Arc<PrefixProtocol>]) -> Arc<Dispatcher> {
        let mut dispatcher = Dispatcher::new();
        for proto in protos {
            dispatcher.push(Arc::clone(proto) as Arc<dyn crate::protocol::Protocol>);
        }
        Arc::new(dispatcher)
    }

    #[test]
    fn test_claimed_link_recycled_once_on_close() {
        let proto = Arc::new(PrefixProtocol::new("p", b"HI", ProcessResult::Continue));
        let dispatcher = dispatcher_of(&[Arc::clone(&proto)]);
        let harness = Harness::start(timeouts());

        let mut client = harness.connect(1, &dispatcher);
        client.write_all(b"HI there").unwrap();
        assert!(wait_for(|| proto.calls.processed.load(Ordering::SeqCst) >= 1));

        drop(client);
        assert!(wait_for(|| !proto.calls.recycled.lock().unwrap().is_empty()));
        assert!(wait_for(|| harness.active.load(Ordering::SeqCst) == 0));

        harness.stop();
        let recycled = proto.calls.recycled.lock().unwrap();
        assert_eq!(recycled.as_slice(), &[(1, None)]);
    }

    #[test]
    fn test_fatal_recycles_with_reason() {
        let proto = Arc::new(PrefixProtocol::new(
            "p",
            b"HI",
            ProcessResult::Fatal("bad frame".to_string()),
        ));
        let dispatcher = dispatcher_of(&[Arc::clone(&proto)]);
        let harness = Harness::start(timeouts());

        let mut client = harness.connect(7, &dispatcher);
        client.write_all(b"HI").unwrap();
        assert!(wait_for(|| !proto.calls.recycled.lock().unwrap().is_empty()));
        harness.stop();

        let recycled = proto.calls.recycled.lock().unwrap();
        assert_eq!(recycled.as_slice(), &[(7, Some("bad frame".to_string()))]);
    }

    #[test]
    fn test_unrecognized_link_closed_without_recycle() {
        let proto = Arc::new(PrefixProtocol::new("p", b"HI", ProcessResult::Continue));
        let dispatcher = dispatcher_of(&[Arc::clone(&proto)]);
        let harness = Harness::start(timeouts());

        let mut client = harness.connect(1, &dispatcher);
        client.write_all(&[b'x'; MAX_HAIL_BYTES]).unwrap();
        assert!(wait_for(|| harness.active.load(Ordering::SeqCst) == 0));

        // Server side is gone.
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(std::io::Read::read(&mut client, &mut buf).unwrap(), 0);

        harness.stop();
        assert_eq!(proto.calls.processed.load(Ordering::SeqCst), 0);
        assert!(proto.calls.recycled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_hail_timeout() {
        let proto = Arc::new(PrefixProtocol::new("p", b"HI", ProcessResult::Continue));
        let dispatcher = dispatcher_of(&[Arc::clone(&proto)]);
        let harness = Harness::start(Timeouts {
            hail: Duration::from_millis(200),
            ..timeouts()
        });

        let mut client = harness.connect(1, &dispatcher);
        client.write_all(b"H").unwrap();
        assert!(wait_for(|| harness.active.load(Ordering::SeqCst) == 0));
        harness.stop();
        assert!(proto.calls.recycled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_idle_timeout_recycles() {
        let proto = Arc::new(PrefixProtocol::new("p", b"HI", ProcessResult::Continue));
        let dispatcher = dispatcher_of(&[Arc::clone(&proto)]);
        let harness = Harness::start(Timeouts {
            idle: Duration::from_millis(200),
            ..timeouts()
        });

        let mut client = harness.connect(3, &dispatcher);
        client.write_all(b"HI").unwrap();
        assert!(wait_for(|| !proto.calls.recycled.lock().unwrap().is_empty()));
        harness.stop();

        let recycled = proto.calls.recycled.lock().unwrap();
        assert_eq!(recycled.as_slice(), &[(3, Some("idle timeout".to_string()))]);
        drop(client);
    }

    #[test]
    fn test_read_timeout_recycles_partial_request() {
        let proto =
            Arc::new(PrefixProtocol::new("p", b"HI", ProcessResult::Continue).keeping_input());
        let dispatcher = dispatcher_of(&[Arc::clone(&proto)]);
        let harness = Harness::start(Timeouts {
            read: Duration::from_millis(200),
            ..timeouts()
        });

        let mut client = harness.connect(4, &dispatcher);
        client.write_all(b"HI partial").unwrap();
        assert!(wait_for(|| !proto.calls.recycled.lock().unwrap().is_empty()));
        harness.stop();

        let recycled = proto.calls.recycled.lock().unwrap();
        assert_eq!(recycled.as_slice(), &[(4, Some("read timeout".to_string()))]);
        drop(client);
    }

    #[test]
    fn test_large_burst_is_read_completely() {
        let proto = Arc::new(PrefixProtocol::new("p", b"HI", ProcessResult::Continue));
        let dispatcher = dispatcher_of(&[Arc::clone(&proto)]);
        let harness = Harness::start(timeouts());

        let mut data = b"HI".to_vec();
        data.resize(crate::runtime::link::READ_BUDGET * 4, b'x');
        let total = data.len();

        let mut client = harness.connect(2, &dispatcher);
        client.write_all(&data).unwrap();
        assert!(wait_for(|| proto.calls.consumed.load(Ordering::SeqCst) == total));

        harness.stop();
        drop(client);
    }

    #[test]
    fn test_reregister_failure_closes_link() {
        let active = Arc::new(AtomicUsize::new(1));
        let (mut worker, handle) = Worker::new(
            0,
            4,
            timeouts(),
            Arc::new(AtomicBool::new(false)),
            Arc::clone(&active),
        )
        .unwrap();
        let (link, _client) = test_link(9);
        handle
            .send(Incoming {
                link,
                dispatcher: Arc::new(Dispatcher::new()),
            })
            .unwrap();
        worker.admit();
        assert_eq!(worker.links.len(), 1);

        let key = worker.links.keys()[0];
        let entry = worker.links.get_mut(key).unwrap();
        worker
            .poll
            .registry()
            .deregister(entry.link.stream_mut())
            .unwrap();
        // The peer never reads, so most of this stays queued.
        entry.link.send(&vec![0u8; 4 << 20]).unwrap();
        assert!(entry.link.has_pending_output());

        worker.update_interest(key);
        assert_eq!(worker.links.len(), 0);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_recycles_active_links() {
        let proto = Arc::new(PrefixProtocol::new("p", b"HI", ProcessResult::Continue));
        let dispatcher = dispatcher_of(&[Arc::clone(&proto)]);
        let harness = Harness::start(timeouts());

        let mut client = harness.connect(5, &dispatcher);
        client.write_all(b"HI").unwrap();
        assert!(wait_for(|| proto.calls.processed.load(Ordering::SeqCst) >= 1));
        harness.stop();

        let recycled = proto.calls.recycled.lock().unwrap();
        assert_eq!(
            recycled.as_slice(),
            &[(5, Some("server shutdown".to_string()))]
        );
        drop(client);
    }

    #[test]
    fn test_reply_reaches_client() {
        struct Greeter;
        impl crate::protocol::Protocol for Greeter {
            fn name(&self) -> &str {
                "greeter"
            }
            fn match_link(&self, link: &Link) -> Option<Box<dyn crate::protocol::Protocol>> {
                link.peek().starts_with(b"HELLO").then(|| Box::new(Greeter) as _)
            }
            fn process(&mut self, link: &mut Link) -> ProcessResult {
                let n = link.peek().len();
                link.consume(n);
                match link.send(b"WELCOME\r\n") {
                    Ok(()) => ProcessResult::Close,
                    Err(e) => ProcessResult::Fatal(e.to_string()),
                }
            }
            fn recycle(
                self: Box<Self>,
                _link: Option<&mut Link>,
                _connected: Duration,
                _reason: Option<&str>,
            ) {
            }
            fn stats(&self, _buf: Option<&mut [u8]>, _sync: bool) -> usize {
                0
            }
        }

        let mut dispatcher = Dispatcher::new();
        dispatcher.push(Arc::new(Greeter));
        let dispatcher = Arc::new(dispatcher);
        let harness = Harness::start(timeouts());

        let mut client = harness.connect(1, &dispatcher);
        client.write_all(b"HELLO\r\n").unwrap();
        assert_eq!(drain(&mut client, 9), b"WELCOME\r\n");
        harness.stop();
    }
}
