//! Echo protocol handler.

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
    max_payload: usize,
}

#[derive(Default)]
struct Session {
    local: LocalCounters,
    /// Payload length announced by a header already consumed.
    expect: Option<usize>,
    reply: BytesMut,
}

impl Session {
    fn reset(&mut self) {
        self.expect = None;
        self.reply.clear();
    }
}

/// Echo prototype or bound session.
pub struct Echo {
    shared: Arc<Shared>,
    session: Session,
}

enum Step {
    More,
    Quit,
    Reject(&'static str),
}

impl Echo {
    pub fn prototype(name: &str, max_payload: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                stats: ProtocolStats::new(name),
                pool: HandlerPool::new(POOL_SIZE),
                max_payload,
            }),
            session: Session::default(),
        }
    }

    /// Answer every complete request in the input buffer.
    fn drain_requests(&mut self, link: &mut Link) -> Step {
        loop {
            if let Some(length) = self.session.expect {
                if link.peek().len() < length {
                    return Step::More;
                }
                parser::write_response(&link.peek()[..length], &mut self.session.reply);
                link.consume(length);
                self.session.expect = None;
                self.session.local.request();
                continue;
            }

            match parser::parse(link.peek()) {
                ParseResult::Complete(Command::Echo { length, .. })
                    if length > self.shared.max_payload =>
                {
                    return Step::Reject("payload too large");
                }
                ParseResult::Complete(Command::Echo { length, header_len }) => {
                    link.consume(header_len);
                    self.session.expect = Some(length);
                }
                ParseResult::Complete(Command::Quit) => {
                    self.session.reply.extend_from_slice(b"OK\r\n");
                    return Step::Quit;
                }
                ParseResult::Incomplete => return Step::More,
                ParseResult::InvalidLength => return Step::Reject("invalid length"),
            }
        }
    }
}

impl Protocol for Echo {
    fn name(&self) -> &str {
        self.shared.stats.name()
    }

    fn match_link(&self, link: &Link) -> Option<Box<dyn Protocol>> {
        if !matches!(
            parser::parse(link.peek()),
            ParseResult::Complete(Command::Echo { .. })
        ) {
            return None;
        }
        let session = self.shared.pool.acquire(Session::default);
        session.local.received(link.peek().len());
        self.shared.stats.bound();
        Some(Box::new(Echo {
            shared: Arc::clone(&self.shared),
            session,
        }))
    }

    fn process(&mut self, link: &mut Link) -> ProcessResult {
        match link.fill() {
            Ok(n) => self.session.local.received(n),
            Err(e) => return ProcessResult::Fatal(format!("read: {e}")),
        }

        self.session.reply.clear();
        let step = self.drain_requests(link);
        if let Step::Reject(msg) = step {
            self.session.reply.extend_from_slice(&parser::response_error(msg));
        }

        if !self.session.reply.is_empty() {
            if let Err(e) = link.send(&self.session.reply) {
                return ProcessResult::Fatal(format!("write: {e}"));
            }
            self.session.local.sent(self.session.reply.len());
        }

        match step {
            Step::Reject(msg) => ProcessResult::Fatal(msg.to_string()),
            Step::Quit => ProcessResult::Close,
            Step::More if link.is_eof() && self.session.expect.is_some() => {
                ProcessResult::Fatal("unexpected EOF while reading payload".to_string())
            }
            Step::More if link.is_eof() => ProcessResult::Close,
            Step::More => ProcessResult::Continue,
        }
    }

    fn recycle(self: Box<Self>, link: Option<&mut Link>, connected: Duration, reason: Option<&str>) {
        let Echo { shared, mut session } = *self;
        shared.stats.fold(&session.local);
        shared.stats.unbound(reason.is_some());
        debug!(
            protocol = shared.stats.name(),
            link = link.map(|l| l.id()),
            connected_ms = connected.as_millis() as u64,
            reason,
            "Session recycled"
        );
        session.reset();
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
    fn test_claims_length_header_only() {
        let proto = Echo::prototype("echo", 64);
        for input in [&b"PING\r\n"[..], b"QUIT\r\n", b"12"] {
            let (mut link, mut client) = test_link(1);
            feed(&mut link, &mut client, input);
            assert!(proto.match_link(&link).is_none());
        }

        let (mut link, mut client) = test_link(2);
        feed(&mut link, &mut client, b"5\r\n");
        assert!(proto.match_link(&link).is_some());
    }

    #[test]
    fn test_payload_split_across_reads() {
        let proto = Echo::prototype("echo", 64);
        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"5\r\nhe");

        let mut session = proto.match_link(&link).unwrap();
        assert_eq!(session.process(&mut link), ProcessResult::Continue);

        feed(&mut link, &mut client, b"llo3\r\nabc");
        assert_eq!(session.process(&mut link), ProcessResult::Continue);
        assert_eq!(drain(&mut client, 14), b"5\r\nhello3\r\nabc");

        feed(&mut link, &mut client, b"QUIT\r\n");
        assert_eq!(session.process(&mut link), ProcessResult::Close);
        assert_eq!(drain(&mut client, 4), b"OK\r\n");

        session.recycle(Some(&mut link), Duration::ZERO, None);
        assert_eq!(proto.shared.stats.snapshot().requests, 2);
    }

    #[test]
    fn test_oversized_payload_is_fatal() {
        let proto = Echo::prototype("echo", 4);
        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"5\r\nhello");

        let mut session = proto.match_link(&link).unwrap();
        assert_eq!(
            session.process(&mut link),
            ProcessResult::Fatal("payload too large".to_string())
        );
        assert_eq!(drain(&mut client, 25), b"ERROR payload too large\r\n");
    }

    #[test]
    fn test_recycled_session_is_reset() {
        let proto = Echo::prototype("echo", 64);
        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"10\r\nabc");

        let mut session = proto.match_link(&link).unwrap();
        session.process(&mut link);
        session.recycle(Some(&mut link), Duration::ZERO, Some("idle timeout"));
        assert_eq!(proto.shared.pool.idle(), 1);

        let (mut link, mut client) = test_link(2);
        feed(&mut link, &mut client, b"2\r\nok");
        let mut session = proto.match_link(&link).unwrap();
        assert_eq!(proto.shared.pool.idle(), 0);
        assert_eq!(session.process(&mut link), ProcessResult::Continue);
        assert_eq!(drain(&mut client, 5), b"2\r\nok");
    }

    #[test]
    fn test_eof_mid_payload_is_fatal() {
        let proto = Echo::prototype("echo", 64);
        let (mut link, mut client) = test_link(1);
        feed(&mut link, &mut client, b"5\r\nhe");
        let mut session = proto.match_link(&link).unwrap();
        drop(client);

        assert!(matches!(session.process(&mut link), ProcessResult::Fatal(_)));
    }
}
