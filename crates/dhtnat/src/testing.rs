//! In-process network simulation for tests.
//!
//! [`SimNetwork`] routes payloads between punchers without sockets. A node
//! behind NAT only accepts traffic from addresses it has already sent to,
//! which is enough to exercise self-tests, bindings and punch sessions under
//! the paused tokio clock.

use crate::config::PuncherConfig;
use crate::contact::{Contact, NodeId};
use crate::error::TransportError;
use crate::listener::{PuncherEvent, PuncherListener};
use crate::ports::{ContactDirectory, InboundHandler};
use crate::puncher::{NatPuncher, NatPuncherBuilder};
use crate::wire::WireMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// One payload handed to the simulated network
#[derive(Debug, Clone)]
pub struct SentRecord {
    /// Sender
    pub from: SocketAddr,
    /// Destination
    pub to: SocketAddr,
    /// Message type tag, or `"malformed"`
    pub kind: &'static str,
    /// Message nonce, zero if undecodable
    pub nonce: u64,
    /// Send time
    pub at: Instant,
}

struct SimNode {
    contact: Contact,
    nat: bool,
    silent: bool,
    handler: Option<Weak<dyn InboundHandler>>,
    contacted: HashSet<SocketAddr>,
    candidates: Vec<Contact>,
}

#[derive(Default)]
struct SimInner {
    nodes: Mutex<HashMap<SocketAddr, SimNode>>,
    dropped: Mutex<HashSet<(SocketAddr, SocketAddr)>>,
    log: Mutex<Vec<SentRecord>>,
    latency: Mutex<Duration>,
    next_host: Mutex<u16>,
}

impl SimInner {
    fn record(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) {
        let (kind, nonce) = match WireMessage::from_bytes(payload) {
            Ok(msg) => (msg.message_type(), msg.nonce()),
            Err(_) => ("malformed", 0),
        };
        self.log.lock().push(SentRecord {
            from,
            to,
            kind,
            nonce,
            at: Instant::now(),
        });
        if let Some(node) = self.nodes.lock().get_mut(&from) {
            node.contacted.insert(to);
        }
    }

    /// Handler at `to` if a payload from `from` would get through
    fn route(&self, from: SocketAddr, to: SocketAddr) -> Option<Arc<dyn InboundHandler>> {
        if self.dropped.lock().contains(&(from, to)) {
            return None;
        }
        let nodes = self.nodes.lock();
        let node = nodes.get(&to)?;
        if node.silent {
            return None;
        }
        let admitted = if from == to {
            !node.nat
        } else {
            !node.nat || node.contacted.contains(&from)
        };
        if !admitted {
            return None;
        }
        node.handler.as_ref()?.upgrade()
    }

    fn latency(&self) -> Duration {
        *self.latency.lock()
    }
}

/// Simulated datagram network
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<SimInner>,
}

impl SimNetwork {
    /// Empty network with zero latency
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_addr(&self) -> SocketAddr {
        let mut host = self.inner.next_host.lock();
        *host += 1;
        let [hi, lo] = host.to_be_bytes();
        SocketAddr::from(([10, 1, hi, lo], 4000))
    }

    /// Register a node without a handler and return its directory
    pub fn directory(&self, addr: SocketAddr, nat: bool) -> Arc<SimDirectory> {
        let contact = Contact::from_addr(addr);
        self.inner.nodes.lock().insert(
            addr,
            SimNode {
                contact: contact.clone(),
                nat,
                silent: false,
                handler: None,
                contacted: HashSet::new(),
                candidates: Vec::new(),
            },
        );
        Arc::new(SimDirectory {
            net: self.inner.clone(),
            local: contact,
        })
    }

    /// Route inbound payloads for `addr` to `handler`
    pub fn attach(&self, addr: SocketAddr, handler: &Arc<dyn InboundHandler>) {
        if let Some(node) = self.inner.nodes.lock().get_mut(&addr) {
            node.handler = Some(Arc::downgrade(handler));
        }
    }

    /// Build a puncher on a fresh address
    pub fn spawn_puncher(&self, config: PuncherConfig, nat: bool) -> Arc<NatPuncher> {
        self.spawn_puncher_with(nat, |builder| builder.config(config))
    }

    /// Build a puncher on a fresh address, customising the builder
    pub fn spawn_puncher_with(
        &self,
        nat: bool,
        customise: impl FnOnce(NatPuncherBuilder) -> NatPuncherBuilder,
    ) -> Arc<NatPuncher> {
        let addr = self.next_addr();
        let directory = self.directory(addr, nat);
        let puncher = customise(NatPuncher::builder(directory))
            .build()
            .expect("valid puncher config");
        let handler: Arc<dyn InboundHandler> = puncher.clone();
        self.attach(addr, &handler);
        puncher
    }

    /// A silent node drops everything it receives
    pub fn set_silent(&self, addr: SocketAddr, silent: bool) {
        if let Some(node) = self.inner.nodes.lock().get_mut(&addr) {
            node.silent = silent;
        }
    }

    /// Put a node behind NAT, or take it out
    pub fn set_nat(&self, addr: SocketAddr, nat: bool) {
        if let Some(node) = self.inner.nodes.lock().get_mut(&addr) {
            node.nat = nat;
        }
    }

    /// Rendezvous candidates the node's directory offers
    pub fn set_candidates(&self, addr: SocketAddr, candidates: Vec<Contact>) {
        if let Some(node) = self.inner.nodes.lock().get_mut(&addr) {
            node.candidates = candidates;
        }
    }

    /// Drop everything sent from `from` to `to`
    pub fn drop_link(&self, from: SocketAddr, to: SocketAddr) {
        self.inner.dropped.lock().insert((from, to));
    }

    /// Restore a dropped link
    pub fn restore_link(&self, from: SocketAddr, to: SocketAddr) {
        self.inner.dropped.lock().remove(&(from, to));
    }

    /// One-way delay applied to every delivery
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Hand a message straight to the node at `to`, bypassing NAT rules
    pub async fn inject(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        msg: &WireMessage,
    ) -> Option<WireMessage> {
        let handler = {
            let nodes = self.inner.nodes.lock();
            nodes.get(&to)?.handler.as_ref()?.upgrade()?
        };
        let payload = msg.to_bytes().ok()?;
        let reply = handler.handle_inbound(from, &payload).await?;
        WireMessage::from_bytes(&reply).ok()
    }

    /// Everything sent so far
    #[must_use]
    pub fn sent(&self) -> Vec<SentRecord> {
        self.inner.log.lock().clone()
    }

    /// Number of sends of one message type
    #[must_use]
    pub fn count_sent(&self, kind: &str) -> usize {
        self.inner.log.lock().iter().filter(|r| r.kind == kind).count()
    }

    /// Destinations of one message type, in send order
    #[must_use]
    pub fn sends_to(&self, kind: &str) -> Vec<SocketAddr> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.to)
            .collect()
    }

    /// Forget the send log
    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }
}

/// A node's view of the simulated network
pub struct SimDirectory {
    net: Arc<SimInner>,
    local: Contact,
}

impl SimDirectory {
    fn deliver_datagram(net: Arc<SimInner>, from: SocketAddr, to: SocketAddr, payload: Vec<u8>) {
        tokio::spawn(async move {
            let Some(handler) = net.route(from, to) else {
                return;
            };
            tokio::time::sleep(net.latency()).await;
            let Some(reply) = handler.handle_inbound(from, &payload).await else {
                return;
            };
            net.record(to, from, &reply);
            let Some(origin) = net.route(to, from) else {
                return;
            };
            tokio::time::sleep(net.latency()).await;
            // replies to replies go nowhere
            let _ = origin.handle_inbound(to, &reply).await;
        });
    }
}

#[async_trait]
impl ContactDirectory for SimDirectory {
    fn local_contact(&self) -> Contact {
        self.local.clone()
    }

    async fn resolve(&self, id: &NodeId) -> Option<Contact> {
        self.net
            .nodes
            .lock()
            .values()
            .find(|node| node.contact.id() == id)
            .map(|node| node.contact.clone())
    }

    fn rendezvous_candidates(&self) -> Vec<Contact> {
        self.net
            .nodes
            .lock()
            .get(&self.local.addr())
            .map(|node| node.candidates.clone())
            .unwrap_or_default()
    }

    async fn send_request(
        &self,
        to: &Contact,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let from = self.local.addr();
        self.net.record(from, to.addr(), &payload);
        let Some(handler) = self.net.route(from, to.addr()) else {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout);
        };
        tokio::time::sleep(self.net.latency()).await;
        let Some(reply) = handler.handle_inbound(from, &payload).await else {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout);
        };
        self.net.record(to.addr(), from, &reply);
        tokio::time::sleep(self.net.latency()).await;
        Ok(reply)
    }

    async fn send_datagram(&self, to: SocketAddr, payload: Vec<u8>) -> Result<(), TransportError> {
        let from = self.local.addr();
        self.net.record(from, to, &payload);
        Self::deliver_datagram(self.net.clone(), from, to, payload);
        Ok(())
    }
}

/// Listener that keeps every event
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<PuncherEvent>>,
}

impl RecordingListener {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Events so far
    #[must_use]
    pub fn events(&self) -> Vec<PuncherEvent> {
        self.events.lock().clone()
    }

    fn count(&self, pred: impl Fn(&PuncherEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Number of `BindingEstablished` events
    #[must_use]
    pub fn bindings_established(&self) -> usize {
        self.count(|e| matches!(e, PuncherEvent::BindingEstablished(_)))
    }

    /// Number of `BindingLost` events
    #[must_use]
    pub fn bindings_lost(&self) -> usize {
        self.count(|e| matches!(e, PuncherEvent::BindingLost(_)))
    }

    /// Number of `SessionSucceeded` events
    #[must_use]
    pub fn successes(&self) -> usize {
        self.count(|e| matches!(e, PuncherEvent::SessionSucceeded { .. }))
    }

    /// Number of `SessionFailed` events
    #[must_use]
    pub fn failures(&self) -> usize {
        self.count(|e| matches!(e, PuncherEvent::SessionFailed { .. }))
    }
}

impl PuncherListener for RecordingListener {
    fn on_event(&self, event: &PuncherEvent) {
        self.events.lock().push(event.clone());
    }
}
