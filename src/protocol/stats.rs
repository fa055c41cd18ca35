//! Protocol statistics.
//!
//! Sessions count into their own `LocalCounters` without locking. The
//! counters are folded into the protocol-wide `ProtocolStats` when a session
//! is recycled or when the worker asks for a sync.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use super::Protocol;

/// Protocol-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    /// Links currently bound.
    pub active: u64,
    /// Links ever bound.
    pub connections: u64,
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Links torn down with a failure reason.
    pub errors: u64,
}

/// Per-session counters, updated without locking.
#[derive(Debug, Default)]
pub struct LocalCounters {
    requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl LocalCounters {
    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn sent(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn take(&self) -> (u64, u64, u64) {
        (
            self.requests.swap(0, Ordering::Relaxed),
            self.bytes_in.swap(0, Ordering::Relaxed),
            self.bytes_out.swap(0, Ordering::Relaxed),
        )
    }
}

/// Shared statistics for every instance of one protocol.
#[derive(Debug)]
pub struct ProtocolStats {
    name: String,
    totals: Mutex<Totals>,
}

impl ProtocolStats {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A link was claimed.
    pub fn bound(&self) {
        let mut totals = self.lock();
        totals.active += 1;
        totals.connections += 1;
    }

    /// A link ended; `failed` when it was torn down with a reason.
    pub fn unbound(&self, failed: bool) {
        let mut totals = self.lock();
        totals.active = totals.active.saturating_sub(1);
        if failed {
            totals.errors += 1;
        }
    }

    /// Move a session's local counts into the totals.
    pub fn fold(&self, local: &LocalCounters) {
        let (requests, bytes_in, bytes_out) = local.take();
        if requests == 0 && bytes_in == 0 && bytes_out == 0 {
            return;
        }
        let mut totals = self.lock();
        totals.requests += requests;
        totals.bytes_in += bytes_in;
        totals.bytes_out += bytes_out;
    }

    pub fn snapshot(&self) -> Totals {
        *self.lock()
    }

    /// Stats text; see [`Protocol::stats`] for the buffer contract.
    pub fn write(&self, buf: Option<&mut [u8]>) -> usize {
        match buf {
            None => self.render(&Totals::max()).len(),
            Some(buf) => write_text(Some(buf), &self.render(&self.snapshot())),
        }
    }

    fn render(&self, t: &Totals) -> String {
        format!(
            "<stats id=\"{}\"><num>{}</num><tot>{}</tot><req>{}</req>\
             <in>{}</in><out>{}</out><err>{}</err></stats>",
            self.name, t.active, t.connections, t.requests, t.bytes_in, t.bytes_out, t.errors
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Totals {
    fn max() -> Self {
        Self {
            active: u64::MAX,
            connections: u64::MAX,
            requests: u64::MAX,
            bytes_in: u64::MAX,
            bytes_out: u64::MAX,
            errors: u64::MAX,
        }
    }
}

/// Copy `text` into `buf` NUL-terminated, truncating to fit.
///
/// Without a buffer, returns the length `text` needs (excluding the NUL).
pub fn write_text(buf: Option<&mut [u8]>, text: &str) -> usize {
    let Some(buf) = buf else {
        return text.len();
    };
    if buf.is_empty() {
        return 0;
    }
    let n = text.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&text.as_bytes()[..n]);
    buf[n] = 0;
    n
}

/// Every loaded protocol, for service-wide reports.
pub struct StatsRegistry {
    started: DateTime<Utc>,
    protocols: RwLock<Vec<Arc<dyn Protocol>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            protocols: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, protocol: Arc<dyn Protocol>) {
        self.protocols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(protocol);
    }

    /// Statistics of every registered protocol, wrapped with the current and
    /// start times (Unix seconds).
    pub fn report(&self) -> String {
        let protocols = self.protocols.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = format!(
            "<statistics tod=\"{}\" start=\"{}\">",
            Utc::now().timestamp(),
            self.started.timestamp()
        );
        for protocol in protocols.iter() {
            let mut buf = vec![0u8; protocol.stats(None, false) + 1];
            let n = protocol.stats(Some(&mut buf), false);
            out.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        out.push_str("</statistics>");
        out
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_probe_bounds_output() {
        let stats = ProtocolStats::new("ping");
        stats.bound();
        let local = LocalCounters::default();
        local.request();
        local.received(6);
        local.sent(6);
        stats.fold(&local);

        let max = stats.write(None);
        let mut buf = vec![0xffu8; max + 1];
        let n = stats.write(Some(&mut buf));

        assert!(n <= max);
        assert_eq!(buf[n], 0);
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.contains("<num>1</num>"));
        assert!(text.contains("<req>1</req>"));
        assert!(text.contains("<in>6</in>"));
    }

    #[test]
    fn test_write_never_overflows() {
        let stats = ProtocolStats::new("echo");
        let mut buf = [0xffu8; 10];
        let n = stats.write(Some(&mut buf[..8]));
        assert_eq!(n, 7);
        assert_eq!(buf[7], 0);
        assert_eq!(&buf[8..], &[0xff, 0xff]);

        assert_eq!(write_text(Some(&mut []), "abc"), 0);
    }

    #[test]
    fn test_fold_moves_local_counts_once() {
        let stats = ProtocolStats::new("ping");
        let local = LocalCounters::default();
        local.request();
        local.request();

        stats.fold(&local);
        stats.fold(&local);
        assert_eq!(stats.snapshot().requests, 2);
    }

    #[test]
    fn test_unbound_tracks_errors() {
        let stats = ProtocolStats::new("ping");
        stats.bound();
        stats.bound();
        stats.unbound(false);
        stats.unbound(true);

        let totals = stats.snapshot();
        assert_eq!(totals.active, 0);
        assert_eq!(totals.connections, 2);
        assert_eq!(totals.errors, 1);
    }

    #[test]
    fn test_concurrent_folds_are_not_lost() {
        let stats = Arc::new(ProtocolStats::new("ping"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    let local = LocalCounters::default();
                    for _ in 0..1000 {
                        local.request();
                        stats.fold(&local);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().requests, 4000);
    }
}
