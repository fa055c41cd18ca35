//! Per-worker link table.
//!
//! Each entry tracks where its link is in the lifecycle (being hailed,
//! served by a protocol, or draining its last output) together with the
//! dispatcher of the listener that accepted it.

use std::sync::Arc;
use std::time::Instant;

use slab::Slab;

use crate::protocol::{Dispatcher, Protocol};
use crate::runtime::Link;

/// Current state of a link.
pub(crate) enum LinkState {
    /// Waiting for enough initial bytes for a protocol to claim the link.
    Hailing { deadline: Instant },
    /// Bound to a protocol session.
    Active {
        handler: Box<dyn Protocol>,
        /// Position of the protocol in the dispatcher.
        protocol: usize,
    },
    /// Session already recycled; flushing queued output before close.
    Draining { deadline: Instant },
}

impl std::fmt::Debug for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Hailing { deadline } => {
                f.debug_struct("Hailing").field("deadline", deadline).finish()
            }
            LinkState::Active { handler, protocol } => f
                .debug_struct("Active")
                .field("handler", &handler.name())
                .field("protocol", protocol)
                .finish(),
            LinkState::Draining { deadline } => {
                f.debug_struct("Draining").field("deadline", deadline).finish()
            }
        }
    }
}

/// A link owned by a worker.
pub(crate) struct LinkEntry {
    pub link: Link,
    pub dispatcher: Arc<Dispatcher>,
    pub state: LinkState,
    /// Whether WRITABLE interest is registered.
    pub writable: bool,
}

impl LinkEntry {
    /// A freshly accepted link, hailing until `deadline`.
    pub fn new(link: Link, dispatcher: Arc<Dispatcher>, deadline: Instant) -> Self {
        Self {
            link,
            dispatcher,
            state: LinkState::Hailing { deadline },
            writable: false,
        }
    }

    /// Bind the link to a claiming session.
    pub fn activate(&mut self, handler: Box<dyn Protocol>, protocol: usize) {
        self.state = LinkState::Active { handler, protocol };
    }

    /// Move out of the active state, returning the session if there was one.
    ///
    /// The entry is left draining until `deadline`.
    pub fn deactivate(&mut self, deadline: Instant) -> Option<Box<dyn Protocol>> {
        match std::mem::replace(&mut self.state, LinkState::Draining { deadline }) {
            LinkState::Active { handler, .. } => Some(handler),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, LinkState::Active { .. })
    }

    /// Name of the bound protocol, if any.
    pub fn protocol_name(&self) -> Option<&str> {
        match &self.state {
            LinkState::Active { protocol, .. } => {
                self.dispatcher.get(*protocol).map(|p| p.name())
            }
            _ => None,
        }
    }
}

/// Registry of links using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Slab keys double as
/// poll tokens.
pub(crate) struct LinkRegistry {
    links: Slab<LinkEntry>,
    max_links: usize,
}

impl LinkRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_links: usize) -> Self {
        Self {
            links: Slab::with_capacity(max_links.min(4096)),
            max_links,
        }
    }

    /// Insert a link; hands it back if the registry is at capacity.
    pub fn insert(&mut self, entry: LinkEntry) -> Result<usize, LinkEntry> {
        if self.links.len() >= self.max_links {
            return Err(entry);
        }
        Ok(self.links.insert(entry))
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut LinkEntry> {
        self.links.get_mut(key)
    }

    pub fn remove(&mut self, key: usize) -> Option<LinkEntry> {
        self.links.try_remove(key)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Snapshot of every key, for sweeps that remove entries.
    pub fn keys(&self) -> Vec<usize> {
        self.links.iter().map(|(key, _)| key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::PrefixProtocol;
    use crate::protocol::ProcessResult;
    use crate::runtime::link::test_link;
    use std::time::Duration;

    fn entry(id: u64) -> LinkEntry {
        let (link, _client) = test_link(id);
        LinkEntry::new(link, Arc::new(Dispatcher::new()), Instant::now())
    }

    #[test]
    fn test_link_state_transitions() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.push(Arc::new(PrefixProtocol::new("p", b"P", ProcessResult::Continue)));
        let (link, _client) = test_link(1);
        let mut entry = LinkEntry::new(link, Arc::new(dispatcher), Instant::now());

        assert!(matches!(entry.state, LinkState::Hailing { .. }));
        assert!(entry.deactivate(Instant::now()).is_none());

        let handler = Box::new(PrefixProtocol::new("p", b"P", ProcessResult::Continue));
        entry.activate(handler, 0);
        assert!(entry.is_active());
        assert_eq!(entry.protocol_name(), Some("p"));

        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(entry.deactivate(deadline).is_some());
        assert!(matches!(entry.state, LinkState::Draining { .. }));
        assert!(entry.deactivate(deadline).is_none());
    }

    #[test]
    fn test_link_registry() {
        let mut registry = LinkRegistry::new(2);

        let k1 = registry.insert(entry(10)).ok().unwrap();
        let k2 = registry.insert(entry(11)).ok().unwrap();

        // At capacity
        let rejected = registry.insert(entry(12)).err().unwrap();
        assert_eq!(rejected.link.id(), 12);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_mut(k1).unwrap().link.id(), 10);
        assert_eq!(registry.keys(), vec![k1, k2]);

        assert!(registry.remove(k1).is_some());
        assert!(registry.remove(k1).is_none());
        assert!(registry.get_mut(k1).is_none());
        assert_eq!(registry.len(), 1);
    }
}
