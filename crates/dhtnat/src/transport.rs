//! UDP-backed [`ContactDirectory`] for standalone deployments.
//!
//! Every datagram carries a bincode [`Envelope`]. Requests are matched to
//! responses by a per-socket counter; plain datagrams carry probes and their
//! acknowledgements.

use crate::contact::{Contact, NodeId};
use crate::error::TransportError;
use crate::ports::{ContactDirectory, InboundHandler};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const MAX_DATAGRAM: usize = 65536;

/// An outstanding request, answerable only by the address it went to
struct PendingRequest {
    to: SocketAddr,
    waiter: oneshot::Sender<Vec<u8>>,
}

/// Clears a pending entry however the request ends, including cancellation
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingRequest>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Framing around puncher payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Expects a `Response` with the same id
    Request {
        /// Correlation id
        id: u64,
        /// Encoded dictionary
        payload: Vec<u8>,
    },
    /// Answer to a `Request`
    Response {
        /// Correlation id
        id: u64,
        /// Encoded dictionary
        payload: Vec<u8>,
    },
    /// Fire and forget
    Datagram {
        /// Encoded dictionary
        payload: Vec<u8>,
    },
}

impl Envelope {
    /// Serialize to bytes
    ///
    /// # Errors
    ///
    /// `Io` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serialize(self).map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Deserialize from bytes
    ///
    /// # Errors
    ///
    /// `Io` if the bytes are not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        bincode::deserialize(bytes).map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Contact directory over a single UDP socket
pub struct UdpDirectory {
    socket: Arc<UdpSocket>,
    local: Contact,
    contacts: DashMap<NodeId, Contact>,
    rendezvous: RwLock<Vec<Contact>>,
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpDirectory {
    /// Bind a socket at `addr`
    ///
    /// The local contact uses `id` if given, otherwise an ID derived from the
    /// bound address.
    ///
    /// # Errors
    ///
    /// `Io` if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr, id: Option<NodeId>) -> Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let local = match id {
            Some(id) => Contact::new(id, local_addr),
            None => Contact::from_addr(local_addr),
        };
        debug!(local = %local, "UDP directory bound");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local,
            contacts: DashMap::new(),
            rendezvous: RwLock::new(Vec::new()),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            receiver: Mutex::new(None),
        }))
    }

    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local.addr()
    }

    /// Remember a peer for `resolve`
    pub fn add_contact(&self, contact: Contact) {
        self.contacts.insert(*contact.id(), contact);
    }

    /// Offer a peer as a rendezvous candidate
    pub fn add_rendezvous(&self, contact: Contact) {
        self.add_contact(contact.clone());
        let mut rendezvous = self.rendezvous.write();
        if !rendezvous.contains(&contact) {
            rendezvous.push(contact);
        }
    }

    /// Start delivering inbound payloads to `handler`
    ///
    /// Replaces any previous receiver task.
    pub fn spawn_receiver(self: &Arc<Self>, handler: Weak<dyn InboundHandler>) {
        let socket = self.socket.clone();
        let this = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP errors surface here on some platforms
                        trace!(error = %e, "recv_from failed");
                        continue;
                    }
                };
                let Some(this) = this.upgrade() else {
                    break;
                };
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                this.dispatch(from, &buf[..len], handler);
            }
            debug!("UDP receiver stopped");
        });

        if let Some(previous) = self.receiver.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop the receiver and fail pending requests
    pub fn shutdown(&self) {
        if let Some(task) = self.receiver.lock().take() {
            task.abort();
        }
        self.pending.clear();
    }

    fn dispatch(&self, from: SocketAddr, bytes: &[u8], handler: Arc<dyn InboundHandler>) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%from, error = %e, "Dropping undecodable datagram");
                return;
            }
        };

        match envelope {
            Envelope::Response { id, payload } => {
                match self.pending.remove_if(&id, |_, request| request.to == from) {
                    Some((_, request)) => {
                        let _ = request.waiter.send(payload);
                    }
                    None if self.pending.contains_key(&id) => {
                        warn!(%from, id, "Dropping response from unexpected address");
                    }
                    None => trace!(%from, id, "Late response"),
                }
            }
            Envelope::Request { id, payload } => {
                let socket = self.socket.clone();
                tokio::spawn(async move {
                    if let Some(reply) = handler.handle_inbound(from, &payload).await {
                        send_envelope(&socket, from, &Envelope::Response { id, payload: reply })
                            .await;
                    }
                });
            }
            Envelope::Datagram { payload } => {
                let socket = self.socket.clone();
                tokio::spawn(async move {
                    if let Some(reply) = handler.handle_inbound(from, &payload).await {
                        send_envelope(&socket, from, &Envelope::Datagram { payload: reply }).await;
                    }
                });
            }
        }
    }
}

async fn send_envelope(socket: &UdpSocket, to: SocketAddr, envelope: &Envelope) {
    let result = match envelope.to_bytes() {
        Ok(bytes) => socket.send_to(&bytes, to).await.map(|_| ()).map_err(Into::into),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        debug!(%to, error = %e, "Reply send failed");
    }
}

impl Drop for UdpDirectory {
    fn drop(&mut self) {
        if let Some(task) = self.receiver.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ContactDirectory for UdpDirectory {
    fn local_contact(&self) -> Contact {
        self.local.clone()
    }

    async fn resolve(&self, id: &NodeId) -> Option<Contact> {
        self.contacts.get(id).map(|c| c.value().clone())
    }

    fn rendezvous_candidates(&self) -> Vec<Contact> {
        self.rendezvous.read().clone()
    }

    async fn send_request(
        &self,
        to: &Contact,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                to: to.addr(),
                waiter: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let bytes = Envelope::Request { id, payload }.to_bytes()?;
        self.socket.send_to(&bytes, to.addr()).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send_datagram(&self, to: SocketAddr, payload: Vec<u8>) -> Result<(), TransportError> {
        let bytes = Envelope::Datagram { payload }.to_bytes()?;
        self.socket.send_to(&bytes, to).await?;
        Ok(())
    }
}
