//! Protocol handler contract and the machinery around it.
//!
//! A protocol is registered by name in a [`ProtocolRegistry`]. At startup the
//! registry resolves each configured protocol to a prototype instance. The
//! prototype never serves a link itself: it probes new links through
//! [`Protocol::match_link`] and hands out a pooled session instance for each
//! link it recognizes.
//!
//! Session lifecycle:
//!
//! ```text
//! Unbound --match_link--> Active --process...--> Recycling --> Unbound (pooled)
//!                                                          \-> dropped
//! ```

pub mod config;
pub mod dispatch;
pub mod pool;
pub mod registry;
pub mod stats;

use std::time::Duration;

use crate::runtime::Link;

pub use config::{ProtocolConfig, ServiceHandles};
pub use dispatch::Dispatcher;
pub use pool::HandlerPool;
pub use registry::{PortChoice, ProtocolRegistry};
pub use stats::{LocalCounters, ProtocolStats, StatsRegistry};

/// Outcome of one [`Protocol::process`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// Keep the link; call again when more data arrives.
    Continue,
    /// Orderly end of the conversation.
    Close,
    /// Unrecoverable protocol failure; the link is torn down.
    Fatal(String),
}

/// A wire protocol that can claim and serve links.
///
/// None of these methods may panic or block for long; failures are reported
/// through return values only. Handlers never close a link themselves.
pub trait Protocol: Send + Sync {
    /// Name of the protocol (also the job name used in logs).
    fn name(&self) -> &str;

    /// Inspect the link's buffered initial bytes. Return a session bound to
    /// the link if this protocol recognizes the stream, `None` otherwise.
    ///
    /// The link is borrowed immutably: a probe cannot consume input.
    fn match_link(&self, link: &Link) -> Option<Box<dyn Protocol>>;

    /// Handle newly readable data on the bound link.
    fn process(&mut self, link: &mut Link) -> ProcessResult;

    /// Release the session once its link has ended. `reason` is `None` for an
    /// orderly close.
    fn recycle(self: Box<Self>, link: Option<&mut Link>, connected: Duration, reason: Option<&str>);

    /// Format statistics for all instances of this protocol.
    ///
    /// With `buf` the text is NUL-terminated, never exceeds `buf.len()`, and
    /// the number of bytes written before the NUL is returned. Without `buf`
    /// the maximum text length is returned. `sync` first folds this
    /// instance's local counters into the shared totals.
    fn stats(&self, buf: Option<&mut [u8]>, sync: bool) -> usize;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable protocol used by dispatcher and runtime tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct Calls {
        pub probes: AtomicUsize,
        pub processed: AtomicUsize,
        pub consumed: AtomicUsize,
        pub recycled: Mutex<Vec<(u64, Option<String>)>>,
    }

    /// Claims links whose input starts with `prefix`.
    pub struct PrefixProtocol {
        pub name: String,
        pub prefix: Vec<u8>,
        pub calls: Arc<Calls>,
        pub result: ProcessResult,
        /// Leave received bytes buffered instead of consuming them.
        pub keep_input: bool,
    }

    impl PrefixProtocol {
        pub fn new(name: &str, prefix: &[u8], result: ProcessResult) -> Self {
            Self {
                name: name.to_string(),
                prefix: prefix.to_vec(),
                calls: Arc::new(Calls::default()),
                result,
                keep_input: false,
            }
        }

        pub fn keeping_input(mut self) -> Self {
            self.keep_input = true;
            self
        }
    }

    impl Protocol for PrefixProtocol {
        fn name(&self) -> &str {
            &self.name
        }

        fn match_link(&self, link: &Link) -> Option<Box<dyn Protocol>> {
            self.calls.probes.fetch_add(1, Ordering::SeqCst);
            if !link.peek().starts_with(&self.prefix) {
                return None;
            }
            Some(Box::new(PrefixProtocol {
                name: self.name.clone(),
                prefix: self.prefix.clone(),
                calls: Arc::clone(&self.calls),
                result: self.result.clone(),
                keep_input: self.keep_input,
            }))
        }

        fn process(&mut self, link: &mut Link) -> ProcessResult {
            self.calls.processed.fetch_add(1, Ordering::SeqCst);
            if link.fill().is_err() {
                return ProcessResult::Fatal("read error".to_string());
            }
            if !self.keep_input {
                let n = link.peek().len();
                link.consume(n);
                self.calls.consumed.fetch_add(n, Ordering::SeqCst);
            }
            if link.is_eof() {
                return ProcessResult::Close;
            }
            self.result.clone()
        }

        fn recycle(
            self: Box<Self>,
            link: Option<&mut Link>,
            _connected: Duration,
            reason: Option<&str>,
        ) {
            let id = link.map(|l| l.id()).unwrap_or(0);
            self.calls
                .recycled
                .lock()
                .unwrap()
                .push((id, reason.map(str::to_string)));
        }

        fn stats(&self, buf: Option<&mut [u8]>, _sync: bool) -> usize {
            stats::write_text(buf, &format!("<stats id=\"{}\"></stats>", self.name))
        }
    }
}
