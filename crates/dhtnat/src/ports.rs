//! Collaborator interfaces supplied by the embedding DHT.
//!
//! The puncher never owns a socket or a routing table. It reaches the
//! network through a [`ContactDirectory`], ranks rendezvous candidates with a
//! [`ProximityOracle`], asks a [`PuncherAdapter`] for application data on the
//! target side, and receives inbound payloads as an [`InboundHandler`].

use crate::contact::{Contact, NodeId};
use crate::error::TransportError;
use crate::wire::ClientData;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

/// Contact lookup and opaque message delivery
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Our own contact, at the address peers should use
    fn local_contact(&self) -> Contact;

    /// Refresh a contact by ID
    async fn resolve(&self, id: &NodeId) -> Option<Contact>;

    /// Known peers able to act as a rendezvous
    fn rendezvous_candidates(&self) -> Vec<Contact>;

    /// Send a request and wait for the reply payload
    ///
    /// Implementations give up with `TransportError::Timeout` once `timeout`
    /// elapses and must release any per-request state if the future is
    /// dropped early.
    async fn send_request(
        &self,
        to: &Contact,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Fire-and-forget datagram to a raw address
    async fn send_datagram(&self, to: SocketAddr, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Ranks candidates nearest-first
///
/// Returning the input unchanged is valid and degrades to arbitrary order.
pub trait ProximityOracle: Send + Sync {
    /// Order candidates by estimated distance
    fn rank(&self, candidates: Vec<Contact>) -> Vec<Contact>;
}

/// Target-side hook for application data
pub trait PuncherAdapter: Send + Sync {
    /// Reply data for an originator whose connect or relayed message arrived
    fn client_data(&self, originator: SocketAddr, data: &ClientData) -> ClientData;
}

/// Receives every inbound payload from the transport
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle a payload; `Some` is sent back to `from` as the reply
    async fn handle_inbound(&self, from: SocketAddr, payload: &[u8]) -> Option<Vec<u8>>;
}
