//! The NAT puncher: lifecycle, public operations and inbound dispatch.

use crate::binding::BindingManager;
use crate::chain::{FallbackChain, Puncher};
use crate::config::{PuncherConfig, PuncherRole};
use crate::contact::Contact;
use crate::engine::{PunchEngine, spawn_probes};
use crate::error::{PuncherError, Result};
use crate::listener::{ListenerSet, PuncherEvent, PuncherListener};
use crate::messenger::Messenger;
use crate::oracle::IdentityOracle;
use crate::ports::{ContactDirectory, InboundHandler, ProximityOracle, PuncherAdapter};
use crate::probe::ProbeRegistry;
use crate::server::RendezvousServer;
use crate::session::{AddressPunch, PunchResult};
use crate::stats::{PuncherStats, StatsSnapshot};
use crate::wire::{self, ClientData, WireMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Process-wide lifecycle of a puncher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuncherState {
    /// Built, not started
    Created,
    /// Binding cycle running
    Running,
    /// Heartbeats and seeking paused
    Suspended,
    /// Terminal
    Destroyed,
}

/// Builder for [`NatPuncher`]
pub struct NatPuncherBuilder {
    directory: Arc<dyn ContactDirectory>,
    oracle: Arc<dyn ProximityOracle>,
    adapter: Option<Arc<dyn PuncherAdapter>>,
    config: PuncherConfig,
    secondary: Option<Arc<dyn Puncher>>,
}

impl NatPuncherBuilder {
    /// Rank rendezvous candidates with `oracle` (default: directory order)
    #[must_use]
    pub fn oracle(mut self, oracle: Arc<dyn ProximityOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Supply target-side client data
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn PuncherAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Use `config` instead of the defaults
    #[must_use]
    pub fn config(mut self, config: PuncherConfig) -> Self {
        self.config = config;
        self
    }

    /// Fall back to `secondary` after the primary exhausts its candidates
    #[must_use]
    pub fn secondary(mut self, secondary: Arc<dyn Puncher>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Validate the configuration and assemble the puncher
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration does not validate.
    pub fn build(self) -> Result<Arc<NatPuncher>> {
        self.config.validate()?;
        let role = match self.config.role {
            PuncherRole::Primary => "primary",
            PuncherRole::Secondary => "secondary",
        };
        let stats = Arc::new(PuncherStats::new());
        let messenger = Messenger::new(self.directory, stats);
        let listeners = Arc::new(ListenerSet::new());
        let probes = Arc::new(ProbeRegistry::new());
        let binding = Arc::new(BindingManager::new(
            self.config.clone(),
            role,
            messenger.clone(),
            self.oracle.clone(),
            listeners.clone(),
            probes.clone(),
        ));
        let server = RendezvousServer::new(self.config.clone(), role, messenger.clone());
        let engine = Arc::new(PunchEngine::new(
            self.config.clone(),
            role,
            messenger.clone(),
            self.oracle,
            listeners.clone(),
            probes.clone(),
            binding.clone(),
            FallbackChain::new(self.secondary),
        ));

        Ok(Arc::new(NatPuncher {
            config: self.config,
            role,
            messenger,
            adapter: self.adapter,
            listeners,
            probes,
            binding,
            server,
            engine,
            state: Mutex::new(PuncherState::Created),
        }))
    }
}

/// NAT traversal for one DHT node
pub struct NatPuncher {
    config: PuncherConfig,
    role: &'static str,
    messenger: Messenger,
    adapter: Option<Arc<dyn PuncherAdapter>>,
    listeners: Arc<ListenerSet>,
    probes: Arc<ProbeRegistry>,
    binding: Arc<BindingManager>,
    server: RendezvousServer,
    engine: Arc<PunchEngine>,
    state: Mutex<PuncherState>,
}

impl NatPuncher {
    /// Start building a puncher over `directory`
    #[must_use]
    pub fn builder(directory: Arc<dyn ContactDirectory>) -> NatPuncherBuilder {
        NatPuncherBuilder {
            directory,
            oracle: Arc::new(IdentityOracle),
            adapter: None,
            config: PuncherConfig::default(),
            secondary: None,
        }
    }

    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        if *self.state.lock() == PuncherState::Destroyed {
            error!(role = self.role, operation, "Operation on destroyed puncher");
            return Err(PuncherError::invalid_state("puncher destroyed"));
        }
        Ok(())
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> PuncherState {
        *self.state.lock()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &PuncherConfig {
        &self.config
    }

    /// Start the reachability self-test and binding cycle; idempotent
    ///
    /// # Errors
    ///
    /// `InvalidState` after `destroy()`.
    pub fn start(&self) -> Result<()> {
        self.ensure_live("start")?;
        let mut state = self.state.lock();
        if *state == PuncherState::Created {
            *state = PuncherState::Running;
            drop(state);
            info!(role = self.role, local = %self.get_local_contact(), "Puncher started");
            self.binding.start();
        }
        Ok(())
    }

    /// Pause or resume heartbeats and rendezvous seeking
    ///
    /// In-flight punch sessions are not affected.
    ///
    /// # Errors
    ///
    /// `InvalidState` after `destroy()`.
    pub fn set_suspended(&self, suspended: bool) -> Result<()> {
        self.ensure_live("set_suspended")?;
        {
            let mut state = self.state.lock();
            *state = match (*state, suspended) {
                (PuncherState::Running, true) => PuncherState::Suspended,
                (PuncherState::Suspended, false) => PuncherState::Running,
                (current, _) => current,
            };
        }
        debug!(role = self.role, suspended, "Suspension changed");
        self.binding.set_suspended(suspended);
        Ok(())
    }

    /// True while pursuing or holding a rendezvous binding
    #[must_use]
    pub fn active(&self) -> bool {
        self.binding.active()
    }

    /// Pursue a rendezvous even if the self-test passes
    ///
    /// # Errors
    ///
    /// `InvalidState` after `destroy()`.
    pub fn force_active(&self, force: bool) -> Result<()> {
        self.ensure_live("force_active")?;
        self.binding.force_active(force);
        Ok(())
    }

    /// True while our binding is acknowledged and within its TTL
    #[must_use]
    pub fn operational(&self) -> bool {
        self.binding.operational()
    }

    /// Bound rendezvous
    #[must_use]
    pub fn get_rendezvous(&self) -> Option<Contact> {
        self.binding.rendezvous()
    }

    /// Our own contact
    #[must_use]
    pub fn get_local_contact(&self) -> Contact {
        self.messenger.directory().local_contact()
    }

    /// Alias for [`get_local_contact`](Self::get_local_contact)
    #[must_use]
    pub fn local_contact(&self) -> Contact {
        self.get_local_contact()
    }

    /// Punch toward `target`
    ///
    /// Concurrent calls for the same (target, reason) share one session. A
    /// failed traversal is an `Ok` result with a failure reason.
    ///
    /// # Errors
    ///
    /// `InvalidState` after `destroy()`.
    pub async fn punch(
        &self,
        reason: &str,
        target: &Contact,
        rendezvous: Option<Contact>,
        client_data: Option<ClientData>,
    ) -> Result<PunchResult> {
        self.ensure_live("punch")?;
        Ok(self
            .engine
            .punch(reason, target, rendezvous, client_data)
            .await)
    }

    /// Punch a peer known only by address
    ///
    /// # Errors
    ///
    /// `InvalidState` after `destroy()`.
    pub async fn punch_addr(
        &self,
        reason: &str,
        addr: SocketAddr,
        client_data: Option<ClientData>,
    ) -> Result<AddressPunch> {
        self.ensure_live("punch_addr")?;
        Ok(self.engine.punch_addr(reason, addr, client_data).await)
    }

    /// Pin `rendezvous` for future sessions toward `target`
    ///
    /// Pinning for our own contact re-seeks our binding through `rendezvous`.
    ///
    /// # Errors
    ///
    /// `InvalidState` after `destroy()`.
    pub fn set_rendezvous(&self, target: &Contact, rendezvous: Contact) -> Result<()> {
        self.ensure_live("set_rendezvous")?;
        let local = self.get_local_contact();
        if *target == local || target.addr() == local.addr() {
            info!(role = self.role, rendezvous = %rendezvous, "Pinned own rendezvous");
            self.binding.pin_local(rendezvous);
        } else {
            self.engine.set_rendezvous(target, rendezvous);
        }
        Ok(())
    }

    /// Relay an application dictionary to `target` through `rendezvous`
    ///
    /// # Errors
    ///
    /// `InvalidState` after `destroy()`, `RendezvousUnavailable` without a
    /// path to `rendezvous`, otherwise relay and transport failures.
    pub async fn send_message(
        &self,
        rendezvous: &Contact,
        target: &Contact,
        message: ClientData,
    ) -> Result<ClientData> {
        self.ensure_live("send_message")?;
        self.engine.send_message(rendezvous, target, message).await
    }

    /// The chained fallback puncher
    #[must_use]
    pub fn get_secondary_puncher(&self) -> Option<Arc<dyn Puncher>> {
        self.engine.chain().secondary().cloned()
    }

    /// Register a listener; a new listener learns of a live binding at once
    ///
    /// # Errors
    ///
    /// `InvalidState` after `destroy()`.
    pub fn add_listener(&self, listener: Arc<dyn PuncherListener>) -> Result<bool> {
        self.ensure_live("add_listener")?;
        if !self.listeners.add(listener.clone()) {
            return Ok(false);
        }
        if let Some(rendezvous) = self.binding.rendezvous().filter(|_| self.operational()) {
            ListenerSet::notify_one(&listener, &PuncherEvent::BindingEstablished(rendezvous));
        }
        Ok(true)
    }

    /// Unregister a listener
    pub fn remove_listener(&self, listener: &Arc<dyn PuncherListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Counters, binding and served-client state
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let mut snapshot = self.messenger.stats().snapshot();
        self.binding.fill_stats(&mut snapshot);
        snapshot.sessions = self.engine.session_count();
        snapshot.served = self.server.summary();
        snapshot
    }

    /// Shared counters
    #[must_use]
    pub fn stats(&self) -> &Arc<PuncherStats> {
        self.messenger.stats()
    }

    /// Diagnostic string
    #[must_use]
    pub fn get_stats(&self) -> String {
        self.stats_snapshot().to_string()
    }

    /// True if a session for (target, reason) is in flight
    #[must_use]
    pub fn has_session(&self, target: &Contact, reason: &str) -> bool {
        self.engine.has_session(target, reason)
    }

    /// Tear everything down
    ///
    /// Live sessions resolve as cancelled, heartbeats stop, served clients are
    /// told we are closing, and the secondary is destroyed too. Terminal.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if *state == PuncherState::Destroyed {
                return;
            }
            *state = PuncherState::Destroyed;
        }
        info!(role = self.role, "Destroying puncher");
        self.binding.stop();
        self.engine.destroy();
        self.server.close_all();
        self.probes.clear();
    }

    fn handle_connect(
        &self,
        from: SocketAddr,
        nonce: u64,
        origin_addr: &[u8],
        tunnel: bool,
        client_data: Option<ClientData>,
    ) -> WireMessage {
        let refuse = WireMessage::ConnectResp {
            nonce,
            ok: false,
            client_data: None,
        };
        if !self.binding.is_current_rendezvous(from) {
            debug!(role = self.role, %from, "connect_req from a peer that is not our rendezvous");
            return refuse;
        }
        let origin = match wire::decode_addr(origin_addr) {
            Ok(origin) => origin,
            Err(e) => {
                warn!(role = self.role, %from, error = %e, "Bad origin address in connect_req");
                self.messenger.stats().record_protocol_error();
                return refuse;
            }
        };

        if tunnel {
            debug!(role = self.role, %origin, nonce, "Probing originator");
            spawn_probes(
                self.messenger.clone(),
                origin,
                nonce,
                self.config.probe_count,
                self.config.probe_interval,
            );
        }
        let reply = self
            .adapter
            .as_ref()
            .map(|adapter| adapter.client_data(origin, &client_data.unwrap_or_default()));
        WireMessage::ConnectResp {
            nonce,
            ok: true,
            client_data: reply,
        }
    }
}

impl std::fmt::Debug for NatPuncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatPuncher")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("local", &self.get_local_contact())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl InboundHandler for NatPuncher {
    async fn handle_inbound(&self, from: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
        if self.state() == PuncherState::Destroyed {
            return None;
        }
        let msg = self.messenger.decode(from, payload)?;
        debug!(role = self.role, %from, kind = msg.message_type(), nonce = msg.nonce(), "Inbound");

        let reply = match msg {
            WireMessage::BindReq { nonce, .. } => Some(self.server.handle_bind(from, nonce)),
            WireMessage::Hb { nonce } => self.server.handle_heartbeat(from, nonce),
            WireMessage::PunchReq {
                reason,
                target_addr,
                nonce,
                client_data,
                ..
            } => Some(
                self.server
                    .handle_punch(from, nonce, reason, &target_addr, client_data)
                    .await,
            ),
            WireMessage::RelayReq {
                nonce,
                target_addr,
                payload,
            } => Some(
                self.server
                    .handle_relay(from, nonce, &target_addr, payload)
                    .await,
            ),
            WireMessage::QueryReq { nonce } => Some(RendezvousServer::handle_query(from, nonce)),
            WireMessage::ConnectReq {
                nonce,
                origin_addr,
                tunnel,
                client_data,
                ..
            } => Some(self.handle_connect(from, nonce, &origin_addr, tunnel, client_data)),
            WireMessage::Probe { nonce } => {
                self.probes.resolve(nonce, from);
                Some(WireMessage::ProbeAck { nonce })
            }
            WireMessage::ProbeAck { nonce } => {
                self.probes.resolve(nonce, from);
                None
            }
            WireMessage::CloseReq { nonce } => {
                if self.binding.handle_close(from) {
                    info!(role = self.role, %from, "Rendezvous closed our binding");
                }
                Some(WireMessage::CloseAck { nonce })
            }
            other => {
                debug!(role = self.role, %from, kind = other.message_type(), "Ignoring unsolicited reply");
                None
            }
        }?;

        self.messenger.stats().record_out(reply.kind_index());
        match reply.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(role = self.role, error = %e, "Failed to encode reply");
                None
            }
        }
    }
}

#[async_trait]
impl Puncher for NatPuncher {
    async fn punch(
        &self,
        reason: &str,
        target: &Contact,
        rendezvous: Option<Contact>,
        client_data: Option<ClientData>,
    ) -> Result<PunchResult> {
        NatPuncher::punch(self, reason, target, rendezvous, client_data).await
    }

    fn active(&self) -> bool {
        NatPuncher::active(self)
    }

    fn operational(&self) -> bool {
        NatPuncher::operational(self)
    }

    fn destroy(&self) {
        NatPuncher::destroy(self);
    }

    fn get_stats(&self) -> String {
        NatPuncher::get_stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::testing::{RecordingListener, SimNetwork};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle() {
        let net = SimNetwork::new();
        let puncher = net.spawn_puncher(PuncherConfig::default(), false);
        assert_eq!(puncher.state(), PuncherState::Created);

        puncher.start().unwrap();
        puncher.start().unwrap();
        assert_eq!(puncher.state(), PuncherState::Running);

        puncher.set_suspended(true).unwrap();
        assert_eq!(puncher.state(), PuncherState::Suspended);
        puncher.set_suspended(false).unwrap();
        assert_eq!(puncher.state(), PuncherState::Running);

        puncher.destroy();
        puncher.destroy();
        assert_eq!(puncher.state(), PuncherState::Destroyed);
        assert!(matches!(puncher.start(), Err(PuncherError::InvalidState(_))));
        // diagnostics stay available
        assert!(puncher.get_stats().contains("sessions=0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_punch_after_destroy_is_contract_violation() {
        let net = SimNetwork::new();
        let puncher = net.spawn_puncher(PuncherConfig::default(), true);
        let target = Contact::from_addr("10.9.0.1:1".parse().unwrap());
        puncher.destroy();

        let before = net.sent().len();
        let err = puncher.punch("x", &target, None, None).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(puncher.punch_addr("x", target.addr(), None).await.is_err());
        assert_eq!(net.sent().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let net = SimNetwork::new();
        let directory = net.directory("10.0.0.1:1".parse().unwrap(), false);
        let err = NatPuncher::builder(directory)
            .config(PuncherConfig {
                tries_per_candidate: 0,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, PuncherError::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidates_is_rendezvous_unavailable() {
        let net = SimNetwork::new();
        let puncher = net.spawn_puncher(PuncherConfig::default(), true);
        let target = Contact::from_addr("10.9.0.1:1".parse().unwrap());
        let result = puncher.punch("x", &target, None, None).await.unwrap();
        assert_eq!(
            result.failure_reason(),
            Some(FailureReason::RendezvousUnavailable)
        );
        assert!(result.rendezvous_used.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_inbound_is_dropped() {
        let net = SimNetwork::new();
        let puncher = net.spawn_puncher(PuncherConfig::default(), false);
        let from: SocketAddr = "10.9.0.9:9".parse().unwrap();

        assert!(puncher.handle_inbound(from, b"{not json").await.is_none());
        assert!(puncher.handle_inbound(from, br#"{"t":"nope"}"#).await.is_none());
        assert_eq!(puncher.stats_snapshot().protocol_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_and_query_replies() {
        let net = SimNetwork::new();
        let puncher = net.spawn_puncher(PuncherConfig::default(), false);
        let from: SocketAddr = "10.9.0.9:9".parse().unwrap();

        let reply = puncher
            .handle_inbound(from, &WireMessage::Probe { nonce: 5 }.to_bytes().unwrap())
            .await
            .unwrap();
        assert_eq!(
            WireMessage::from_bytes(&reply).unwrap(),
            WireMessage::ProbeAck { nonce: 5 }
        );

        let reply = puncher
            .handle_inbound(from, &WireMessage::QueryReq { nonce: 6 }.to_bytes().unwrap())
            .await
            .unwrap();
        match WireMessage::from_bytes(&reply).unwrap() {
            WireMessage::QueryResp { ext_addr, .. } => {
                assert_eq!(wire::decode_addr(&ext_addr).unwrap(), from);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_from_stranger_refused() {
        let net = SimNetwork::new();
        let puncher = net.spawn_puncher(PuncherConfig::default(), true);
        let msg = WireMessage::ConnectReq {
            nonce: 1,
            reason: "x".into(),
            origin_addr: wire::encode_addr("10.9.0.2:2".parse().unwrap()),
            tunnel: true,
            client_data: None,
        };
        let reply = puncher
            .handle_inbound("10.9.0.3:3".parse().unwrap(), &msg.to_bytes().unwrap())
            .await
            .unwrap();
        assert!(matches!(
            WireMessage::from_bytes(&reply).unwrap(),
            WireMessage::ConnectResp { ok: false, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_listener_sees_binding() {
        let net = SimNetwork::new();
        let r1 = net.spawn_puncher(PuncherConfig::default(), false);
        let client = net.spawn_puncher(PuncherConfig::default(), true);
        net.set_candidates(client.local_contact().addr(), vec![r1.local_contact()]);
        client.start().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(client.operational());

        let listener = RecordingListener::new();
        assert!(client.add_listener(listener.clone()).unwrap());
        assert!(!client.add_listener(listener.clone()).unwrap());
        assert_eq!(listener.bindings_established(), 1);
    }
}
