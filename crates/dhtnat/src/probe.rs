//! Waiters for direct probe confirmations, keyed by nonce.

use dashmap::DashMap;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::debug;

/// Pending probe waiters
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    waiters: DashMap<u64, oneshot::Sender<SocketAddr>>,
}

impl ProbeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the first probe carrying `nonce`; replaces any earlier waiter
    pub fn register(&self, nonce: u64) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(nonce, tx);
        rx
    }

    /// Deliver the observed source address of a probe; false if nobody waits
    pub fn resolve(&self, nonce: u64, from: SocketAddr) -> bool {
        match self.waiters.remove(&nonce) {
            Some((_, tx)) => {
                debug!(nonce, %from, "Probe confirmed");
                tx.send(from).is_ok()
            }
            None => false,
        }
    }

    /// Drop a waiter
    pub fn cancel(&self, nonce: u64) {
        self.waiters.remove(&nonce);
    }

    /// Drop every waiter
    pub fn clear(&self) {
        self.waiters.clear();
    }

    /// Number of pending waiters
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// True if nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
