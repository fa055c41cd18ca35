//! Priority-ordered protocol probing.

use std::sync::Arc;

use super::Protocol;
use crate::runtime::Link;

/// The protocols served on one listener, in probe order.
///
/// Order is registration order, which follows the configuration file. When
/// two protocols could both claim a stream, the earlier one wins.
#[derive(Default)]
pub struct Dispatcher {
    protocols: Vec<Arc<dyn Protocol>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, protocol: Arc<dyn Protocol>) {
        self.protocols.push(protocol);
    }

    /// Offer the link to each protocol in order; the first claim wins.
    ///
    /// Returns the winning protocol's position and its bound session.
    pub fn dispatch(&self, link: &Link) -> Option<(usize, Box<dyn Protocol>)> {
        self.protocols
            .iter()
            .enumerate()
            .find_map(|(idx, protocol)| protocol.match_link(link).map(|session| (idx, session)))
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<dyn Protocol>> {
        self.protocols.get(idx)
    }

    pub fn names(&self) -> Vec<&str> {
        self.protocols.iter().map(|p| p.name()).collect()
    }
}
