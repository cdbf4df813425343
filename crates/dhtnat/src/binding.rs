//! Rendezvous binding manager.
//!
//! Keeps the local node reachable through a rendezvous when a self-test shows
//! it cannot accept unsolicited datagrams. One background task drives the
//! cycle: self-test, seek (bind to the best-ranked candidate not in
//! cool-down), then heartbeat every `binding_ttl / heartbeat_divisor`.
//! `missed_heartbeat_limit` consecutive misses, a stale binding, or a
//! `close_req` from the rendezvous invalidate the binding and restart seeking.
//!
//! The state lock is never held across an await.

use crate::config::PuncherConfig;
use crate::contact::Contact;
use crate::error::{PuncherError, Result};
use crate::listener::{ListenerSet, PuncherEvent};
use crate::messenger::Messenger;
use crate::ports::ProximityOracle;
use crate::probe::ProbeRegistry;
use crate::stats::StatsSnapshot;
use crate::wire::{self, WireMessage};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The local node's relationship with its rendezvous
#[derive(Debug, Clone)]
pub struct RendezvousBinding {
    /// Rendezvous relaying for us
    pub rendezvous: Contact,
    /// When the bind was acknowledged
    pub established_at: Instant,
    /// Last bind or heartbeat acknowledgement
    pub last_ack: Instant,
    /// Staleness threshold
    pub ttl: Duration,
    /// Our address as observed by the rendezvous
    pub external_addr: Option<SocketAddr>,
}

impl RendezvousBinding {
    /// True once `ttl` has passed since the last acknowledgement
    #[must_use]
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_ack) > self.ttl
    }
}

#[derive(Debug, Default)]
struct BindingState {
    force_active: bool,
    active: bool,
    suspended: bool,
    recheck: bool,
    binding: Option<RendezvousBinding>,
    missed: u32,
    fail_count: u32,
    last_ok: Option<Instant>,
    last_fail: Option<Instant>,
    failed: HashMap<SocketAddr, Instant>,
    pinned_local: Option<Contact>,
    reported_active: bool,
    reported_operational: bool,
}

enum Step {
    Suspended,
    Unbound,
    Heartbeat(Contact),
    Stale(Contact),
    Recheck(Contact),
}

/// Client side of a rendezvous binding
pub struct BindingManager {
    config: PuncherConfig,
    role: &'static str,
    messenger: Messenger,
    oracle: Arc<dyn ProximityOracle>,
    listeners: Arc<ListenerSet>,
    probes: Arc<ProbeRegistry>,
    state: Mutex<BindingState>,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BindingManager {
    /// Create a stopped manager
    #[must_use]
    pub fn new(
        config: PuncherConfig,
        role: &'static str,
        messenger: Messenger,
        oracle: Arc<dyn ProximityOracle>,
        listeners: Arc<ListenerSet>,
        probes: Arc<ProbeRegistry>,
    ) -> Self {
        Self {
            config,
            role,
            messenger,
            oracle,
            listeners,
            probes,
            state: Mutex::new(BindingState::default()),
            wake: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the binding cycle; no-op if already running
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            loop {
                let Some(this) = weak.upgrade() else { break };
                let delay = this.tick().await;
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = this.wake.notified() => {}
                }
            }
        }));
    }

    /// Abort the cycle; the binding record is dropped without events
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let mut state = self.state.lock();
        state.binding = None;
        state.active = false;
    }

    /// True while seeking or bound
    #[must_use]
    pub fn active(&self) -> bool {
        self.state.lock().active
    }

    /// True while a binding exists and its last ack is within the TTL
    #[must_use]
    pub fn operational(&self) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .binding
            .as_ref()
            .is_some_and(|b| !b.is_stale(now))
    }

    /// Bound rendezvous, if any
    #[must_use]
    pub fn rendezvous(&self) -> Option<Contact> {
        self.state
            .lock()
            .binding
            .as_ref()
            .map(|b| b.rendezvous.clone())
    }

    /// Copy of the binding record
    #[must_use]
    pub fn binding(&self) -> Option<RendezvousBinding> {
        self.state.lock().binding.clone()
    }

    /// True if `addr` is our bound rendezvous
    #[must_use]
    pub fn is_current_rendezvous(&self, addr: SocketAddr) -> bool {
        self.state
            .lock()
            .binding
            .as_ref()
            .is_some_and(|b| b.rendezvous.addr() == addr)
    }

    /// Pursue a binding regardless of the self-test
    pub fn force_active(&self, force: bool) {
        {
            let mut state = self.state.lock();
            state.force_active = force;
            if !force {
                state.recheck = true;
            }
        }
        self.wake.notify_one();
    }

    /// Pause or resume heartbeats and seeking
    pub fn set_suspended(&self, suspended: bool) {
        self.state.lock().suspended = suspended;
        if !suspended {
            self.wake.notify_one();
        }
    }

    /// Prefer `rendezvous` for our own binding and re-seek now
    pub fn pin_local(&self, rendezvous: Contact) {
        let current = {
            let mut state = self.state.lock();
            state.pinned_local = Some(rendezvous.clone());
            state.failed.remove(&rendezvous.addr());
            state.binding.as_ref().map(|b| b.rendezvous.clone())
        };
        if let Some(current) = current {
            if current.addr() != rendezvous.addr() {
                self.lose_binding(&current, false, "re-pinned");
            }
        }
        self.wake.notify_one();
    }

    /// A rendezvous told us it is closing; true if it was ours
    pub fn handle_close(&self, from: SocketAddr) -> bool {
        let current = self
            .state
            .lock()
            .binding
            .as_ref()
            .filter(|b| b.rendezvous.addr() == from)
            .map(|b| b.rendezvous.clone());
        match current {
            Some(rendezvous) => {
                self.lose_binding(&rendezvous, true, "closed by rendezvous");
                self.wake.notify_one();
                true
            }
            None => false,
        }
    }

    /// Fill the binding fields of a stats snapshot
    pub fn fill_stats(&self, snapshot: &mut StatsSnapshot) {
        let now = Instant::now();
        let state = self.state.lock();
        snapshot.rendezvous = state.binding.as_ref().map(|b| b.rendezvous.addr());
        snapshot.last_ok_age = state.last_ok.map(|t| now.saturating_duration_since(t));
        snapshot.last_fail_age = state.last_fail.map(|t| now.saturating_duration_since(t));
        snapshot.binding_fail_count = state.fail_count;
    }

    /// One pass of the cycle; returns the delay before the next one
    async fn tick(&self) -> Duration {
        let now = Instant::now();
        let step = {
            let state = self.state.lock();
            match &state.binding {
                _ if state.suspended => Step::Suspended,
                Some(b) if b.is_stale(now) => Step::Stale(b.rendezvous.clone()),
                Some(b) if state.recheck && !state.force_active => {
                    Step::Recheck(b.rendezvous.clone())
                }
                Some(b) => Step::Heartbeat(b.rendezvous.clone()),
                None => Step::Unbound,
            }
        };

        let delay = match step {
            Step::Suspended => self.config.binding_ttl,
            Step::Heartbeat(rendezvous) => self.heartbeat(&rendezvous).await,
            Step::Stale(rendezvous) => {
                self.lose_binding(&rendezvous, false, "binding TTL expired");
                Duration::ZERO
            }
            Step::Recheck(rendezvous) => {
                self.state.lock().recheck = false;
                if self.self_test().await {
                    self.lose_binding(&rendezvous, false, "direct reachability restored");
                    self.state.lock().active = false;
                    self.config.binding_ttl
                } else {
                    Duration::ZERO
                }
            }
            Step::Unbound => self.unbound().await,
        };
        self.report_flags();
        delay
    }

    async fn unbound(&self) -> Duration {
        let force = {
            let mut state = self.state.lock();
            state.recheck = false;
            state.force_active
        };
        if !force && self.self_test().await {
            debug!(role = self.role, "Self-test passed, no rendezvous needed");
            self.state.lock().active = false;
            return self.config.binding_ttl;
        }

        self.state.lock().active = true;
        self.report_flags();
        if self.seek().await {
            self.config.heartbeat_interval()
        } else {
            self.config.seek_retry_interval
        }
    }

    /// Send a probe to our own address and wait for it to come back
    async fn self_test(&self) -> bool {
        let local = self.messenger.directory().local_contact();
        let nonce = wire::new_nonce();
        let rx = self.probes.register(nonce);
        if let Err(e) = self
            .messenger
            .datagram(local.addr(), &WireMessage::Probe { nonce })
            .await
        {
            debug!(role = self.role, error = %e, "Self-test probe not sent");
            self.probes.cancel(nonce);
            return false;
        }
        let reachable = matches!(
            tokio::time::timeout(self.config.self_test_timeout, rx).await,
            Ok(Ok(_))
        );
        self.probes.cancel(nonce);
        debug!(role = self.role, reachable, "Reachability self-test");
        reachable
    }

    async fn heartbeat(&self, rendezvous: &Contact) -> Duration {
        let started = Instant::now();
        let interval = self.config.heartbeat_interval();
        let nonce = wire::new_nonce();
        let timeout = self.config.bind_timeout.min(interval);

        let acked = match self
            .messenger
            .request(rendezvous, &WireMessage::Hb { nonce }, timeout)
            .await
        {
            Ok(WireMessage::HbAck { nonce: n }) if n == nonce => true,
            Ok(other) => {
                debug!(role = self.role, kind = other.message_type(), "Unexpected heartbeat reply");
                false
            }
            Err(e) => {
                debug!(role = self.role, rendezvous = %rendezvous, error = %e, "Heartbeat failed");
                false
            }
        };

        let now = Instant::now();
        let exhausted = {
            let mut state = self.state.lock();
            let Some(binding) = state.binding.as_mut() else {
                return Duration::ZERO;
            };
            if binding.rendezvous.addr() != rendezvous.addr() {
                return Duration::ZERO;
            }
            if acked {
                binding.last_ack = now;
                state.missed = 0;
                state.fail_count = 0;
                state.last_ok = Some(now);
                false
            } else {
                state.missed += 1;
                state.fail_count += 1;
                state.last_fail = Some(now);
                state.missed >= self.config.missed_heartbeat_limit
            }
        };

        if exhausted {
            self.lose_binding(rendezvous, true, "missed heartbeats");
            return Duration::ZERO;
        }
        interval.saturating_sub(now.saturating_duration_since(started))
    }

    /// Try candidates in rank order until one acknowledges a bind
    async fn seek(&self) -> bool {
        let local = self.messenger.directory().local_contact();
        let now = Instant::now();
        let (pinned, failed) = {
            let mut state = self.state.lock();
            let cooldown = self.config.failed_rendezvous_cooldown;
            state
                .failed
                .retain(|_, at| now.saturating_duration_since(*at) < cooldown);
            (
                state.pinned_local.clone(),
                state.failed.keys().copied().collect::<HashSet<_>>(),
            )
        };

        let eligible: Vec<Contact> = self
            .messenger
            .directory()
            .rendezvous_candidates()
            .into_iter()
            .filter(|c| {
                c != &local && c.addr() != local.addr() && !failed.contains(&c.addr())
            })
            .collect();
        let mut candidates: Vec<Contact> = pinned.into_iter().collect();
        for contact in self.oracle.rank(eligible) {
            if !candidates.contains(&contact) {
                candidates.push(contact);
            }
        }

        if candidates.is_empty() {
            let mut state = self.state.lock();
            state.fail_count += 1;
            state.last_fail = Some(now);
            debug!(role = self.role, "No rendezvous candidates");
            return false;
        }

        for candidate in candidates {
            if self.state.lock().suspended {
                return false;
            }
            match self.bind(&candidate, &local).await {
                Ok(external_addr) => {
                    self.establish(candidate, external_addr);
                    return true;
                }
                Err(e) => {
                    warn!(role = self.role, rendezvous = %candidate, error = %e, "Bind failed");
                    let mut state = self.state.lock();
                    state.fail_count += 1;
                    state.last_fail = Some(Instant::now());
                    self.mark_failed(&mut state, candidate.addr());
                }
            }
        }
        false
    }

    async fn bind(&self, candidate: &Contact, local: &Contact) -> Result<Option<SocketAddr>> {
        let nonce = wire::new_nonce();
        let request = WireMessage::BindReq {
            nonce,
            ext_addr: wire::encode_addr(local.addr()),
        };
        match self
            .messenger
            .request(candidate, &request, self.config.bind_timeout)
            .await?
        {
            WireMessage::BindAck {
                nonce: n,
                ext_addr,
                ok: true,
            } if n == nonce => Ok(wire::decode_opt_addr(&ext_addr)?),
            WireMessage::BindAck { ok: false, .. } => {
                Err(PuncherError::rendezvous_unavailable("bind refused"))
            }
            _ => Err(PuncherError::protocol("unexpected reply to bind_req")),
        }
    }

    fn establish(&self, rendezvous: Contact, external_addr: Option<SocketAddr>) {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.binding = Some(RendezvousBinding {
                rendezvous: rendezvous.clone(),
                established_at: now,
                last_ack: now,
                ttl: self.config.binding_ttl,
                external_addr,
            });
            state.missed = 0;
            state.fail_count = 0;
            state.last_ok = Some(now);
            state.recheck = false;
        }
        info!(
            role = self.role,
            rendezvous = %rendezvous,
            external = ?external_addr,
            "Rendezvous binding established"
        );
        self.listeners
            .notify(&PuncherEvent::BindingEstablished(rendezvous));
        self.report_flags();
    }

    /// Drop the binding if it is still with `rendezvous`; emits `BindingLost` once
    fn lose_binding(&self, rendezvous: &Contact, cooldown: bool, why: &'static str) -> bool {
        let lost = {
            let mut state = self.state.lock();
            let current = state
                .binding
                .as_ref()
                .is_some_and(|b| b.rendezvous.addr() == rendezvous.addr());
            if !current {
                return false;
            }
            state.missed = 0;
            if cooldown {
                self.mark_failed(&mut state, rendezvous.addr());
            }
            state.binding.take()
        };
        if let Some(binding) = lost {
            info!(role = self.role, rendezvous = %binding.rendezvous, reason = why, "Rendezvous binding lost");
            self.listeners
                .notify(&PuncherEvent::BindingLost(binding.rendezvous));
            self.report_flags();
        }
        true
    }

    fn mark_failed(&self, state: &mut BindingState, addr: SocketAddr) {
        state.failed.insert(addr, Instant::now());
        while state.failed.len() > self.config.failed_rendezvous_history {
            let oldest = state
                .failed
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(addr, _)| *addr);
            match oldest {
                Some(addr) => {
                    state.failed.remove(&addr);
                }
                None => break,
            }
        }
    }

    /// Emit `ActiveChanged` / `OperationalChanged` for any flip since last report
    pub(crate) fn report_flags(&self) {
        let now = Instant::now();
        let (active, operational) = {
            let mut state = self.state.lock();
            let active = state.active;
            let operational = state.binding.as_ref().is_some_and(|b| !b.is_stale(now));
            let active_changed = active != state.reported_active;
            let operational_changed = operational != state.reported_operational;
            state.reported_active = active;
            state.reported_operational = operational;
            (
                active_changed.then_some(active),
                operational_changed.then_some(operational),
            )
        };
        if let Some(active) = active {
            self.listeners.notify(&PuncherEvent::ActiveChanged(active));
        }
        if let Some(operational) = operational {
            self.listeners
                .notify(&PuncherEvent::OperationalChanged(operational));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::IdentityOracle;
    use crate::stats::PuncherStats;
    use crate::testing::{RecordingListener, SimNetwork};

    fn config() -> PuncherConfig {
        PuncherConfig {
            binding_ttl: Duration::from_secs(30),
            bind_timeout: Duration::from_secs(2),
            self_test_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nated_node_binds_to_rendezvous() {
        let net = SimNetwork::new();
        let r1 = net.spawn_puncher(config(), false);
        let client = net.spawn_puncher(config(), true);
        net.set_candidates(client.local_contact().addr(), vec![r1.local_contact()]);
        let listener = RecordingListener::new();
        client.add_listener(listener.clone()).unwrap();

        client.start().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(client.active());
        assert!(client.operational());
        assert_eq!(client.get_rendezvous(), Some(r1.local_contact()));
        assert_eq!(listener.bindings_established(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reachable_node_stays_inactive() {
        let net = SimNetwork::new();
        let r1 = net.spawn_puncher(config(), false);
        let node = net.spawn_puncher(config(), false);
        net.set_candidates(node.local_contact().addr(), vec![r1.local_contact()]);

        node.start().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!node.active());
        assert!(!node.operational());
        assert_eq!(net.count_sent("bind_req"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_active_binds_reachable_node() {
        let net = SimNetwork::new();
        let r1 = net.spawn_puncher(config(), false);
        let node = net.spawn_puncher(config(), false);
        net.set_candidates(node.local_contact().addr(), vec![r1.local_contact()]);

        node.force_active(true).unwrap();
        node.start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(node.operational());

        node.force_active(false).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!node.operational());
        assert!(!node.active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_rendezvous_is_skipped() {
        let net = SimNetwork::new();
        let secondary = net.spawn_puncher(config().secondary(), false);
        let r2 = net.spawn_puncher(config(), false);
        let client = net.spawn_puncher(config(), true);
        net.set_candidates(
            client.local_contact().addr(),
            vec![secondary.local_contact(), r2.local_contact()],
        );

        client.start().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.get_rendezvous(), Some(r2.local_contact()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_req_invalidates_binding() {
        let net = SimNetwork::new();
        let r1 = net.spawn_puncher(config(), false);
        let r2 = net.spawn_puncher(config(), false);
        let client = net.spawn_puncher(config(), true);
        net.set_candidates(
            client.local_contact().addr(),
            vec![r1.local_contact(), r2.local_contact()],
        );
        let listener = RecordingListener::new();
        client.add_listener(listener.clone()).unwrap();

        client.start().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.get_rendezvous(), Some(r1.local_contact()));

        r1.destroy();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(listener.bindings_lost(), 1);
        // r1 is in cool-down, so the client moves on
        assert_eq!(client.get_rendezvous(), Some(r2.local_contact()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_is_stale_after_ttl() {
        let now = Instant::now();
        let binding = RendezvousBinding {
            rendezvous: Contact::from_addr("10.0.0.1:1".parse().unwrap()),
            established_at: now,
            last_ack: now,
            ttl: Duration::from_secs(10),
            external_addr: None,
        };
        assert!(!binding.is_stale(now + Duration::from_secs(10)));
        assert!(binding.is_stale(now + Duration::from_secs(11)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_history_is_bounded() {
        let net = SimNetwork::new();
        let directory = net.directory("10.9.9.9:1".parse().unwrap(), true);
        let cfg = PuncherConfig {
            failed_rendezvous_history: 2,
            ..config()
        };
        let manager = BindingManager::new(
            cfg,
            "primary",
            Messenger::new(directory, Arc::new(PuncherStats::new())),
            Arc::new(IdentityOracle),
            Arc::new(ListenerSet::new()),
            Arc::new(ProbeRegistry::new()),
        );
        let mut state = BindingState::default();
        for port in 1..=5 {
            manager.mark_failed(&mut state, format!("10.0.0.1:{port}").parse().unwrap());
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(state.failed.len(), 2);
        assert!(state.failed.contains_key(&"10.0.0.1:5".parse().unwrap()));
    }
}
