//! Rendezvous role: serving bindings for NATed clients.
//!
//! A reachable puncher accepts `bind_req` from up to `max_served_bindings`
//! clients, keeps them alive on `hb`, and coordinates punches and relayed
//! messages toward them by forwarding `connect_req`.

use crate::config::{PuncherConfig, PuncherRole};
use crate::contact::Contact;
use crate::messenger::Messenger;
use crate::stats::ServedSummary;
use crate::wire::{self, ClientData, WireMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// A client bound to us
#[derive(Debug, Clone)]
struct ServedBinding {
    contact: Contact,
    bound_at: Instant,
    last_seen: Instant,
    ok_count: u32,
    consec_fails: u32,
    last_connect: Option<Instant>,
}

impl ServedBinding {
    fn new(contact: Contact) -> Self {
        let now = Instant::now();
        Self {
            contact,
            bound_at: now,
            last_seen: now,
            ok_count: 0,
            consec_fails: 0,
            last_connect: None,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }

    /// Refused after `limit` consecutive failures until `backoff` passes
    fn is_ok_to_connect(&self, limit: u32, backoff: Duration) -> bool {
        self.consec_fails < limit
            || self
                .last_connect
                .is_none_or(|at| at.elapsed() >= backoff)
    }
}

/// Outcome of forwarding a connect to a served client
struct Forwarded {
    ok: bool,
    target: SocketAddr,
    rtt: Duration,
    client_data: Option<ClientData>,
    err: Option<&'static str>,
}

/// Served bindings and the forwarding logic
pub struct RendezvousServer {
    config: PuncherConfig,
    role: &'static str,
    messenger: Messenger,
    bindings: Mutex<HashMap<SocketAddr, ServedBinding>>,
}

impl RendezvousServer {
    /// Create a server with no clients
    #[must_use]
    pub fn new(config: PuncherConfig, role: &'static str, messenger: Messenger) -> Self {
        Self {
            config,
            role,
            messenger,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    fn expire(&self, bindings: &mut HashMap<SocketAddr, ServedBinding>) {
        let timeout = self.config.served_binding_timeout;
        bindings.retain(|addr, b| {
            let alive = b.is_alive(timeout);
            if !alive {
                debug!(role = self.role, client = %addr, "Served binding expired");
            }
            alive
        });
    }

    /// Answer a `bind_req`
    pub fn handle_bind(&self, from: SocketAddr, nonce: u64) -> WireMessage {
        let ext_addr = wire::encode_addr(from);
        if self.config.role == PuncherRole::Secondary {
            return WireMessage::BindAck {
                nonce,
                ext_addr,
                ok: false,
            };
        }

        let mut bindings = self.bindings.lock();
        self.expire(&mut bindings);
        let served = bindings.len();
        let ok = match bindings.get_mut(&from) {
            Some(existing) => {
                let ok = existing.is_ok_to_connect(
                    self.config.served_fail_limit,
                    self.config.served_fail_backoff,
                );
                if ok {
                    existing.touch();
                }
                ok
            }
            None if served < self.config.max_served_bindings => {
                bindings.insert(from, ServedBinding::new(Contact::from_addr(from)));
                info!(role = self.role, client = %from, "Accepted rendezvous client");
                true
            }
            None => false,
        };
        if !ok {
            debug!(role = self.role, client = %from, "Refused bind");
        }
        WireMessage::BindAck {
            nonce,
            ext_addr,
            ok,
        }
    }

    /// Answer an `hb`; unknown clients get nothing
    pub fn handle_heartbeat(&self, from: SocketAddr, nonce: u64) -> Option<WireMessage> {
        let mut bindings = self.bindings.lock();
        self.expire(&mut bindings);
        bindings.get_mut(&from).map(|b| {
            b.touch();
            WireMessage::HbAck { nonce }
        })
    }

    /// True if `addr` is currently bound to us
    #[must_use]
    pub fn is_serving(&self, addr: SocketAddr) -> bool {
        let mut bindings = self.bindings.lock();
        self.expire(&mut bindings);
        bindings.contains_key(&addr)
    }

    /// Coordinate a punch from `from` toward a bound target
    pub async fn handle_punch(
        &self,
        from: SocketAddr,
        nonce: u64,
        reason: String,
        target_addr: &[u8],
        client_data: Option<ClientData>,
    ) -> WireMessage {
        let forwarded = self
            .forward(from, nonce, reason, target_addr, true, client_data)
            .await;
        self.messenger.stats().record_punch_served(forwarded.ok);
        WireMessage::PunchResp {
            nonce,
            ok: forwarded.ok,
            ext_addr: if forwarded.ok {
                wire::encode_addr(forwarded.target)
            } else {
                Vec::new()
            },
            rtt_ms: u32::try_from(forwarded.rtt.as_millis()).unwrap_or(u32::MAX),
            err: forwarded.err.map(str::to_string),
            client_data: forwarded.client_data,
        }
    }

    /// Relay an application dictionary to a bound target
    pub async fn handle_relay(
        &self,
        from: SocketAddr,
        nonce: u64,
        target_addr: &[u8],
        payload: ClientData,
    ) -> WireMessage {
        let forwarded = self
            .forward(from, nonce, String::new(), target_addr, false, Some(payload))
            .await;
        WireMessage::RelayResp {
            nonce,
            ok: forwarded.ok,
            payload: forwarded.client_data,
            err: forwarded.err.map(str::to_string),
        }
    }

    async fn forward(
        &self,
        from: SocketAddr,
        nonce: u64,
        reason: String,
        target_addr: &[u8],
        tunnel: bool,
        client_data: Option<ClientData>,
    ) -> Forwarded {
        let fail = |target, err| Forwarded {
            ok: false,
            target,
            rtt: Duration::ZERO,
            client_data: None,
            err: Some(err),
        };

        let target = match wire::decode_addr(target_addr) {
            Ok(addr) => addr,
            Err(_) => return fail(from, "invalid target address"),
        };

        let contact = {
            let mut bindings = self.bindings.lock();
            self.expire(&mut bindings);
            match bindings.get(&target) {
                None => return fail(target, "invalid rendezvous"),
                Some(b)
                    if !b.is_ok_to_connect(
                        self.config.served_fail_limit,
                        self.config.served_fail_backoff,
                    ) =>
                {
                    return fail(target, "ignored due to consecutive failures");
                }
                Some(b) => b.contact.clone(),
            }
        };

        let request = WireMessage::ConnectReq {
            nonce,
            reason,
            origin_addr: wire::encode_addr(from),
            tunnel,
            client_data,
        };
        let started = Instant::now();
        let reply = self
            .messenger
            .request(&contact, &request, self.config.candidate_timeout / 2)
            .await;
        let rtt = started.elapsed();

        let (ok, client_data) = match reply {
            Ok(WireMessage::ConnectResp {
                nonce: n,
                ok,
                client_data,
            }) if n == nonce => (ok, client_data),
            Ok(other) => {
                debug!(role = self.role, kind = other.message_type(), "Unexpected connect reply");
                (false, None)
            }
            Err(e) => {
                debug!(role = self.role, target = %target, error = %e, "Connect forward failed");
                (false, None)
            }
        };

        if let Some(b) = self.bindings.lock().get_mut(&target) {
            b.last_connect = Some(Instant::now());
            if ok {
                b.ok_count += 1;
                b.consec_fails = 0;
            } else {
                b.consec_fails += 1;
            }
        }

        if ok {
            debug!(role = self.role, origin = %from, target = %target, ?rtt, "Forwarded connect");
            Forwarded {
                ok,
                target,
                rtt,
                client_data,
                err: None,
            }
        } else {
            fail(target, "target did not respond")
        }
    }

    /// Answer a `query_req` with the requester's observed address
    #[must_use]
    pub fn handle_query(from: SocketAddr, nonce: u64) -> WireMessage {
        WireMessage::QueryResp {
            nonce,
            ext_addr: wire::encode_addr(from),
        }
    }

    /// Forget a client
    pub fn remove(&self, addr: &SocketAddr) -> bool {
        self.bindings.lock().remove(addr).is_some()
    }

    /// Number of clients served
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    /// True if nobody is bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.lock().is_empty()
    }

    /// Tell every client we are going away; best effort, never waits
    pub fn close_all(&self) {
        let clients: Vec<Contact> = self
            .bindings
            .lock()
            .drain()
            .map(|(_, b)| b.contact)
            .collect();
        if clients.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(role = self.role, "No runtime, skipping close_req");
            return;
        };
        let timeout = self.config.bind_timeout;
        for contact in clients {
            let messenger = self.messenger.clone();
            handle.spawn(async move {
                let msg = WireMessage::CloseReq {
                    nonce: wire::new_nonce(),
                };
                if let Err(e) = messenger.request(&contact, &msg, timeout).await {
                    debug!(client = %contact, error = %e, "close_req not acknowledged");
                }
            });
        }
    }

    /// Per-client rows for the diagnostic string
    #[must_use]
    pub fn summary(&self) -> Vec<ServedSummary> {
        let mut bindings = self.bindings.lock();
        self.expire(&mut bindings);
        let mut rows: Vec<ServedSummary> = bindings
            .iter()
            .map(|(addr, b)| ServedSummary {
                addr: *addr,
                ok: b.ok_count,
                bad: b.consec_fails,
                age: b.bound_at.elapsed(),
            })
            .collect();
        rows.sort_by_key(|r| r.addr);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::PuncherStats;
    use crate::testing::SimNetwork;
    use std::sync::Arc;

    fn server(net: &SimNetwork, config: PuncherConfig) -> RendezvousServer {
        let directory = net.directory("10.0.0.1:7000".parse().unwrap(), false);
        RendezvousServer::new(
            config,
            "primary",
            Messenger::new(directory, Arc::new(PuncherStats::new())),
        )
    }

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.0.1:{port}").parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_capacity() {
        let net = SimNetwork::new();
        let server = server(
            &net,
            PuncherConfig {
                max_served_bindings: 2,
                ..Default::default()
            },
        );
        let ok = |msg: WireMessage| matches!(msg, WireMessage::BindAck { ok: true, .. });
        assert!(ok(server.handle_bind(addr(1), 1)));
        assert!(ok(server.handle_bind(addr(2), 2)));
        assert!(!ok(server.handle_bind(addr(3), 3)));
        // re-bind refreshes
        assert!(ok(server.handle_bind(addr(1), 4)));
        assert!(!ok(server.handle_bind(addr(3), 5)));
        assert_eq!(server.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_ack_carries_observed_addr() {
        let net = SimNetwork::new();
        let server = server(&net, PuncherConfig::default());
        match server.handle_bind(addr(9), 5) {
            WireMessage::BindAck { ext_addr, nonce, .. } => {
                assert_eq!(nonce, 5);
                assert_eq!(wire::decode_addr(&ext_addr).unwrap(), addr(9));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_refuses() {
        let net = SimNetwork::new();
        let server = server(&net, PuncherConfig::default().secondary());
        assert!(matches!(
            server.handle_bind(addr(1), 1),
            WireMessage::BindAck { ok: false, .. }
        ));
        assert!(server.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_expiry() {
        let net = SimNetwork::new();
        let server = server(
            &net,
            PuncherConfig {
                served_binding_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        );
        assert!(server.handle_heartbeat(addr(1), 1).is_none());

        server.handle_bind(addr(1), 1);
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(
            server.handle_heartbeat(addr(1), 2),
            Some(WireMessage::HbAck { nonce: 2 })
        );
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(server.is_serving(addr(1)));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!server.is_serving(addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_punch_to_unknown_target() {
        let net = SimNetwork::new();
        let server = server(&net, PuncherConfig::default());
        let resp = server
            .handle_punch(addr(1), 77, "test".into(), &wire::encode_addr(addr(2)), None)
            .await;
        match resp {
            WireMessage::PunchResp { nonce, ok, err, .. } => {
                assert_eq!(nonce, 77);
                assert!(!ok);
                assert_eq!(err.as_deref(), Some("invalid rendezvous"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_refuse_connects() {
        let net = SimNetwork::new();
        let server = server(
            &net,
            PuncherConfig {
                served_fail_limit: 2,
                served_fail_backoff: Duration::from_secs(30),
                candidate_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        );
        // Bound client that never answers connect_req
        let target = addr(5);
        net.directory(target, true);
        net.set_silent(target, true);
        server.handle_bind(target, 1);

        let target_bytes = wire::encode_addr(target);
        for _ in 0..2 {
            let resp = server
                .handle_punch(addr(1), 1, "r".into(), &target_bytes, None)
                .await;
            assert!(matches!(resp, WireMessage::PunchResp { ok: false, .. }));
        }
        match server
            .handle_punch(addr(1), 1, "r".into(), &target_bytes, None)
            .await
        {
            WireMessage::PunchResp { err, .. } => {
                assert_eq!(err.as_deref(), Some("ignored due to consecutive failures"));
            }
            other => panic!("unexpected {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        server.handle_heartbeat(target, 2);
        match server
            .handle_punch(addr(1), 1, "r".into(), &target_bytes, None)
            .await
        {
            WireMessage::PunchResp { err, .. } => {
                assert_eq!(err.as_deref(), Some("target did not respond"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_query_reflects_address() {
        match RendezvousServer::handle_query(addr(3), 8) {
            WireMessage::QueryResp { nonce, ext_addr } => {
                assert_eq!(nonce, 8);
                assert_eq!(wire::decode_addr(&ext_addr).unwrap(), addr(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
