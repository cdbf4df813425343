//! Proximity oracles for rendezvous ranking.

use crate::contact::Contact;
use crate::ports::ProximityOracle;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Keeps the directory's order
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityOracle;

impl ProximityOracle for IdentityOracle {
    fn rank(&self, candidates: Vec<Contact>) -> Vec<Contact> {
        candidates
    }
}

/// Ranks by measured round-trip time, ascending
///
/// Candidates without a measurement go last, in their input order.
#[derive(Debug, Default)]
pub struct LatencyOracle {
    latencies: RwLock<HashMap<SocketAddr, (Duration, Instant)>>,
}

impl LatencyOracle {
    /// Create an oracle with no measurements
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a latency sample for an address
    pub fn update_latency(&self, addr: SocketAddr, latency: Duration) {
        self.latencies
            .write()
            .insert(addr, (latency, Instant::now()));
    }

    /// Get the last latency measured for an address
    #[must_use]
    pub fn get_latency(&self, addr: &SocketAddr) -> Option<Duration> {
        self.latencies.read().get(addr).map(|(latency, _)| *latency)
    }

    /// Forget an address
    pub fn remove(&self, addr: &SocketAddr) {
        self.latencies.write().remove(addr);
    }

    /// True if the address was never measured or the sample is older than `threshold`
    #[must_use]
    pub fn is_measurement_stale(&self, addr: &SocketAddr, threshold: Duration) -> bool {
        self.latencies
            .read()
            .get(addr)
            .is_none_or(|(_, at)| at.elapsed() > threshold)
    }
}

impl ProximityOracle for LatencyOracle {
    fn rank(&self, mut candidates: Vec<Contact>) -> Vec<Contact> {
        let latencies = self.latencies.read();
        // sort_by_key is stable, so equal and unmeasured entries keep input order
        candidates.sort_by_key(|c| match latencies.get(&c.addr()) {
            Some((latency, _)) => (0u8, *latency),
            None => (1u8, Duration::ZERO),
        });
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::NodeId;

    fn contact(port: u16) -> Contact {
        Contact::new(
            NodeId::random(),
            format!("10.0.0.{}:{port}", port % 200).parse().unwrap(),
        )
    }

    #[test]
    fn test_identity_keeps_order() {
        let input = vec![contact(1), contact(2), contact(3)];
        assert_eq!(IdentityOracle.rank(input.clone()), input);
    }

    #[tokio::test]
    async fn test_latency_ranking() {
        let oracle = LatencyOracle::new();
        let (a, b, c, d) = (contact(1), contact(2), contact(3), contact(4));
        oracle.update_latency(a.addr(), Duration::from_millis(80));
        oracle.update_latency(c.addr(), Duration::from_millis(20));

        let ranked = oracle.rank(vec![a.clone(), b.clone(), c.clone(), d.clone()]);
        assert_eq!(ranked, vec![c, a, b, d]);
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let oracle = LatencyOracle::new();
        let addr: SocketAddr = "10.1.1.1:1".parse().unwrap();
        assert!(oracle.is_measurement_stale(&addr, Duration::from_secs(60)));

        oracle.update_latency(addr, Duration::from_millis(5));
        assert_eq!(oracle.get_latency(&addr), Some(Duration::from_millis(5)));
        assert!(!oracle.is_measurement_stale(&addr, Duration::from_secs(60)));

        oracle.remove(&addr);
        assert_eq!(oracle.get_latency(&addr), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measurement_goes_stale() {
        let oracle = LatencyOracle::new();
        let addr: SocketAddr = "10.1.1.1:2".parse().unwrap();
        oracle.update_latency(addr, Duration::from_millis(5));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(oracle.is_measurement_stale(&addr, Duration::from_secs(60)));
    }
}
