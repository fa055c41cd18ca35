//! Ping protocol handler.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tracing::debug;

use super::parser::{self, Command, ParseResult};
use crate::protocol::{HandlerPool, LocalCounters, ProcessResult, Protocol, ProtocolStats};
use crate::protocols::POOL_SIZE;
use crate::runtime::Link;

struct Shared {
    stats: ProtocolStats,
    pool: HandlerPool<Session>,
}

/// Per-link state; pooled between links.
#[derive(Default)]
struct Session {
    local: LocalCounters,
    reply: BytesMut,
}

/// Ping prototype or bound session.
pub struct Ping {
    shared: Arc<Shared>,
    session: Session,
}

impl Ping {
    pub fn prototype(name: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                stats: ProtocolStats::new(name),
                pool: HandlerPool::new(POOL_SIZE),
            }),
            session: Session::default(),
        }
    }
}

impl Protocol for Ping {
    fn name(&self) -> &str {
        self.shared.stats.name()
    }

    fn match_link(&self, link: &Link) -> Option<Box<dyn Protocol>> {
        if !matches!(parser::parse(link.peek()), ParseResult::Complete(..)) {
            return None;
        }
        let session = self.shared.pool.acquire(Session::default);
        session.local.received(link.peek().len());
        self.shared.stats.bound();
        Some(Box::new(Ping {
            shared: Arc::clone(&self.shared),
            session,
        }))
    }

    fn process(&mut self, link: &mut Link) -> ProcessResult {
        match link.fill() {
            Ok(n) => self.session.local.received(n),
            Err(e) => return ProcessResult::Fatal(format!("read: {e}")),
        }

        let mut quit = false;
        let mut failed = false;
        self.session.reply.clear();
        loop {
            match parser::parse(link.peek()) {
                ParseResult::Complete(cmd, consumed) => {
                    self.session.local.request();
                    parser::write_response(&cmd, &mut self.session.reply);
                    quit = cmd == Command::Quit;
                    link.consume(consumed);
                    if quit {
                        break;
                    }
                }
                ParseResult::Incomplete => break,
                ParseResult::Error => {
                    self.session.reply.extend_from_slice(parser::response_error());
                    failed = true;
                    break;
                }
            }
        }

        if !self.session.reply.is_empty() {
            if let Err(e) = link.send(&self.session.reply) {
                return ProcessResult::Fatal(format!("write: {e}"));
            }
            self.session.local.sent(self.session.reply.len());
        }

        if failed {
            ProcessResult::Fatal("unknown command".to_string())
        } else if quit || link.is_eof() {
            ProcessResult::Close
        } else {
            ProcessResult::Continue
        }
    }

    fn recycle(self: Box<Self>, link: Option<&mut Link>, connected: Duration, reason: Option<&str>) {
        let Ping { shared, mut session } = *self;
        shared.stats.fold(&session.local);
        shared.stats.unbound(reason.is_some());
        debug!(
            protocol = shared.stats.name(),
            link = link.map(|l| l.id()),
            connected_ms = connected.as_millis() as u64,
            reason,
            "Session recycled"
        );
        session.reply.clear();
        shared.pool.release(session);
    }

    fn stats(&self, buf: Option<&mut [u8]>, sync: bool) -> usize {
        if sync {
            self.shared.stats.fold(&self.session.local);
        }
        self.shared.stats.write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::link::{drain, feed, test_link};

    #[test]
    fn test_claims_ping_only() {
        let proto = Ping::prototype("ping");

        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"5\r\nhello");
        assert!(proto.match_link(&link).is_none());

        let (mut link, mut client) = test_link(2);
        feed(&mut link, &mut client, b"PIN");
        assert!(proto.match_link(&link).is_none());
        feed(&mut link, &mut client, b"G\r\n");
        assert!(proto.match_link(&link).is_some());
    }

    #[test]
    fn test_serves_buffered_hail() {
        let proto = Ping::prototype("ping");
        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"PING\r\nPING hi\r\n");

        let mut session = proto.match_link(&link).unwrap();
        assert_eq!(session.process(&mut link), ProcessResult::Continue);
        assert_eq!(drain(&mut client, 15), b"PONG\r\nPONG hi\r\n");
        assert!(link.peek().is_empty());

        session.recycle(Some(&mut link), Duration::from_millis(5), None);
        let totals = proto.shared.stats.snapshot();
        assert_eq!(totals.requests, 2);
        assert_eq!(totals.bytes_in, 15);
        assert_eq!(totals.bytes_out, 15);
        assert_eq!(totals.active, 0);
        assert_eq!(proto.shared.pool.idle(), 1);
    }

    #[test]
    fn test_quit_closes() {
        let proto = Ping::prototype("ping");
        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"QUIT\r\n");

        let mut session = proto.match_link(&link).unwrap();
        assert_eq!(session.process(&mut link), ProcessResult::Close);
        assert_eq!(drain(&mut client, 4), b"OK\r\n");
    }

    #[test]
    fn test_garbage_after_claim_is_fatal() {
        let proto = Ping::prototype("ping");
        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"PING\r\nBOGUS\r\n");

        let mut session = proto.match_link(&link).unwrap();
        assert!(matches!(session.process(&mut link), ProcessResult::Fatal(_)));
        let reply = drain(&mut client, 6 + parser::response_error().len());
        assert!(reply.ends_with(parser::response_error()));

        session.recycle(Some(&mut link), Duration::ZERO, Some("unknown command"));
        assert_eq!(proto.shared.stats.snapshot().errors, 1);
    }

    #[test]
    fn test_stats_sync_folds_live_counts() {
        let proto = Ping::prototype("ping");
        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"PING\r\n");

        let mut session = proto.match_link(&link).unwrap();
        session.process(&mut link);
        assert_eq!(proto.shared.stats.snapshot().requests, 0);

        let len = session.stats(None, true);
        assert_eq!(proto.shared.stats.snapshot().requests, 1);
        let mut buf = vec![0u8; len + 1];
        let n = session.stats(Some(&mut buf), false);
        assert!(std::str::from_utf8(&buf[..n]).unwrap().contains("<req>1</req>"));
    }
}
