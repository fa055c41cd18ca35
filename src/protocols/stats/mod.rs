//! Statistics protocol.
//!
//! A client sends `STATS\r\n` and receives the statistics of every loaded
//! protocol followed by `\r\n`, after which the server closes the link.
//!
//! ```text
//! Request:  STATS\r\n
//! Response: <statistics tod="..." start="..."><stats id="ping">...</stats>...</statistics>\r\n
//! ```
//!
//! Parameters: `port=<n>` makes the protocol listen on its own port instead
//! of the configured one.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::debug;

use crate::protocol::registry::DEFAULT_PORT;
use crate::protocol::{
    HandlerPool, LocalCounters, ProcessResult, Protocol, ProtocolConfig, ProtocolStats,
    ServiceHandles, StatsRegistry,
};
use crate::protocols::{find_crlf, POOL_SIZE};
use crate::runtime::Link;

pub const NAME: &str = "stats";

const REQUEST: &[u8] = b"STATS\r\n";

/// Factory resolver. Accepts only the `port` parameter.
pub fn factory(
    name: &str,
    params: &str,
    _config: &ProtocolConfig,
    handles: &ServiceHandles,
) -> Option<Arc<dyn Protocol>> {
    parse_port(params)?;
    Some(Arc::new(Stats::prototype(name, &handles.stats)))
}

/// Port resolver: `port=<n>` wins over the configured port.
pub fn port(_name: &str, params: &str, config: &ProtocolConfig) -> i32 {
    match parse_port(params) {
        Some(Some(port)) => i32::from(port),
        Some(None) if config.port < 0 => i32::from(DEFAULT_PORT),
        Some(None) => config.port,
        None => -1,
    }
}

/// `None` for malformed parameters, `Some(None)` when no port is given.
fn parse_port(params: &str) -> Option<Option<u16>> {
    let mut port = None;
    for param in params.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match param.split_once('=') {
            Some(("port", value)) => port = Some(value.parse().ok()?),
            _ => return None,
        }
    }
    Some(port)
}

struct Shared {
    stats: ProtocolStats,
    pool: HandlerPool<LocalCounters>,
    /// Held weakly: the registry also holds this protocol.
    registry: Weak<StatsRegistry>,
}

/// Stats prototype or bound session.
pub struct Stats {
    shared: Arc<Shared>,
    local: LocalCounters,
}

impl Stats {
    pub fn prototype(name: &str, registry: &Arc<StatsRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                stats: ProtocolStats::new(name),
                pool: HandlerPool::new(POOL_SIZE),
                registry: Arc::downgrade(registry),
            }),
            local: LocalCounters::default(),
        }
    }
}

fn is_request(input: &[u8]) -> bool {
    find_crlf(input).is_some_and(|end| input[..end + 2].eq_ignore_ascii_case(REQUEST))
}

impl Protocol for Stats {
    fn name(&self) -> &str {
        self.shared.stats.name()
    }

    fn match_link(&self, link: &Link) -> Option<Box<dyn Protocol>> {
        if !is_request(link.peek()) {
            return None;
        }
        let local = self.shared.pool.acquire(LocalCounters::default);
        local.received(link.peek().len());
        self.shared.stats.bound();
        Some(Box::new(Stats {
            shared: Arc::clone(&self.shared),
            local,
        }))
    }

    fn process(&mut self, link: &mut Link) -> ProcessResult {
        match link.fill() {
            Ok(n) => self.local.received(n),
            Err(e) => return ProcessResult::Fatal(format!("read: {e}")),
        }
        if !is_request(link.peek()) {
            return ProcessResult::Fatal("unexpected request".to_string());
        }
        link.consume(REQUEST.len());
        self.local.request();

        let Some(registry) = self.shared.registry.upgrade() else {
            return ProcessResult::Fatal("statistics unavailable".to_string());
        };
        let mut report = registry.report();
        report.push_str("\r\n");
        if let Err(e) = link.send(report.as_bytes()) {
            return ProcessResult::Fatal(format!("write: {e}"));
        }
        self.local.sent(report.len());
        ProcessResult::Close
    }

    fn recycle(self: Box<Self>, link: Option<&mut Link>, connected: Duration, reason: Option<&str>) {
        let Stats { shared, local } = *self;
        shared.stats.fold(&local);
        shared.stats.unbound(reason.is_some());
        debug!(
            protocol = shared.stats.name(),
            link = link.map(|l| l.id()),
            connected_ms = connected.as_millis() as u64,
            reason,
            "Session recycled"
        );
        shared.pool.release(local);
    }

    fn stats(&self, buf: Option<&mut [u8]>, sync: bool) -> usize {
        if sync {
            self.shared.stats.fold(&self.local);
        }
        self.shared.stats.write(buf)
    }
}
