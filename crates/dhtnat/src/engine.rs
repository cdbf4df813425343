//! Punch session engine.
//!
//! For a (target, reason) pair the engine ranks rendezvous candidates, then
//! tries them strictly in order: each attempt sends `punch_req` to the
//! candidate while a burst of `probe` datagrams goes toward the target, and
//! waits up to `candidate_timeout` for a probe from the target (success) or
//! a rejection from the candidate. Candidates never overlap. On exhaustion
//! the session is handed to the secondary puncher, if any.

use crate::binding::BindingManager;
use crate::chain::FallbackChain;
use crate::config::PuncherConfig;
use crate::contact::{Contact, NodeId};
use crate::error::{FailureReason, PuncherError, Result};
use crate::listener::{ListenerSet, PuncherEvent};
use crate::messenger::Messenger;
use crate::ports::ProximityOracle;
use crate::probe::ProbeRegistry;
use crate::session::{
    AddressPunch, PunchOutcome, PunchResult, PunchSession, SessionHandle, SessionKey,
    SessionTable,
};
use crate::wire::{self, ClientData, WireMessage};
use dashmap::DashMap;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A rendezvous pinned for one target
#[derive(Debug, Clone)]
pub struct PinnedRendezvous {
    /// Rendezvous to try first
    pub contact: Contact,
    /// Failed attempts through it since the last success
    pub consecutive_failures: u32,
}

/// Confirmed addresses, by target ID and by the address that was punched
#[derive(Debug)]
pub struct ReachabilityCache {
    ttl: Duration,
    by_id: DashMap<NodeId, (SocketAddr, Instant)>,
    by_addr: DashMap<SocketAddr, (SocketAddr, Instant)>,
}

impl ReachabilityCache {
    /// Cache whose entries live for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            by_id: DashMap::new(),
            by_addr: DashMap::new(),
        }
    }

    /// Record a confirmed address for `target`
    pub fn insert(&self, target: &Contact, confirmed: SocketAddr) {
        let now = Instant::now();
        self.by_id.insert(*target.id(), (confirmed, now));
        self.by_addr.insert(target.addr(), (confirmed, now));
    }

    /// Fresh confirmed address for `target`, by ID first, then by address
    #[must_use]
    pub fn lookup(&self, target: &Contact) -> Option<SocketAddr> {
        let ttl = self.ttl;
        self.by_id
            .remove_if(target.id(), |_, (_, at)| at.elapsed() >= ttl);
        self.by_addr
            .remove_if(&target.addr(), |_, (_, at)| at.elapsed() >= ttl);
        self.by_id
            .get(target.id())
            .map(|e| e.0)
            .or_else(|| self.by_addr.get(&target.addr()).map(|e| e.0))
    }

    /// Drop everything
    pub fn clear(&self) {
        self.by_id.clear();
        self.by_addr.clear();
    }
}

enum Attempt {
    Confirmed {
        addr: SocketAddr,
        client_data: Option<ClientData>,
    },
    Rejected(String),
    TimedOut,
    Transport(PuncherError),
    Closed,
}

/// Sends `count` probes to `to`, `interval` apart
pub(crate) fn spawn_probes(
    messenger: Messenger,
    to: SocketAddr,
    nonce: u64,
    count: u32,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for i in 0..count {
            if i > 0 {
                tokio::time::sleep(interval).await;
            }
            if let Err(e) = messenger.datagram(to, &WireMessage::Probe { nonce }).await {
                debug!(%to, error = %e, "Probe not sent");
            }
        }
    })
}

/// Probe burst that stops when the attempt ends
struct ProbeBurst(JoinHandle<()>);

impl Drop for ProbeBurst {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Session driver for one puncher
pub struct PunchEngine {
    config: PuncherConfig,
    role: &'static str,
    messenger: Messenger,
    oracle: Arc<dyn ProximityOracle>,
    listeners: Arc<ListenerSet>,
    probes: Arc<ProbeRegistry>,
    binding: Arc<BindingManager>,
    sessions: SessionTable,
    reachable: ReachabilityCache,
    pins: DashMap<NodeId, PinnedRendezvous>,
    chain: FallbackChain,
}

impl PunchEngine {
    /// Create an engine
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PuncherConfig,
        role: &'static str,
        messenger: Messenger,
        oracle: Arc<dyn ProximityOracle>,
        listeners: Arc<ListenerSet>,
        probes: Arc<ProbeRegistry>,
        binding: Arc<BindingManager>,
        chain: FallbackChain,
    ) -> Self {
        Self {
            reachable: ReachabilityCache::new(config.reachable_ttl),
            config,
            role,
            messenger,
            oracle,
            listeners,
            probes,
            binding,
            sessions: SessionTable::new(),
            pins: DashMap::new(),
            chain,
        }
    }

    /// Puncher chain behind this engine
    #[must_use]
    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    /// Live session count
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// True if a session for (target, reason) is in flight
    #[must_use]
    pub fn has_session(&self, target: &Contact, reason: &str) -> bool {
        self.sessions.contains(&SessionKey::new(target, reason))
    }

    /// Cached confirmed address for a target
    #[must_use]
    pub fn reachable_addr(&self, target: &Contact) -> Option<SocketAddr> {
        self.reachable.lookup(target)
    }

    /// Pinned rendezvous for a target
    #[must_use]
    pub fn pinned(&self, target: &NodeId) -> Option<PinnedRendezvous> {
        self.pins.get(target).map(|p| p.clone())
    }

    /// Punch toward `target`, joining an in-flight session for the same reason
    pub async fn punch(
        self: &Arc<Self>,
        reason: &str,
        target: &Contact,
        rendezvous: Option<Contact>,
        client_data: Option<ClientData>,
    ) -> PunchResult {
        if let Some(addr) = self.reachable.lookup(target) {
            self.messenger.stats().record_short_circuit();
            debug!(role = self.role, target = %target, %addr, "Target already reachable");
            return PunchResult {
                outcome: PunchOutcome::Succeeded {
                    addr,
                    rtt: Duration::ZERO,
                },
                short_circuit: true,
                ..PunchResult::failed(target.clone(), reason, FailureReason::Unreachable)
            };
        }

        let key = SessionKey::new(target, reason);
        let session = PunchSession::new(
            target.clone(),
            reason,
            client_data,
            self.config.session_deadline,
        );
        let (handle, created) = self
            .sessions
            .join_or_create(key.clone(), target, session.nonce);
        let mut rx = handle.subscribe();

        if created {
            debug!(role = self.role, target = %target, reason, nonce = session.nonce, "Starting punch session");
            let engine = Arc::clone(self);
            let driver_key = key.clone();
            let driver_handle = Arc::clone(&handle);
            let task = tokio::spawn(async move {
                let result = engine.run_session(session, rendezvous).await;
                engine.finish(&driver_key, &driver_handle, result);
            });
            handle.set_task(task.abort_handle());
        } else {
            self.messenger.stats().record_coalesced();
            debug!(role = self.role, target = %target, reason, "Joined in-flight session");
        }

        let wait = self.config.session_deadline + self.config.candidate_timeout;
        let result = match tokio::time::timeout(wait, rx.wait_for(Option::is_some)).await {
            Ok(Ok(slot)) => slot.clone(),
            _ => None,
        };
        match result {
            Some(result) => result,
            None => {
                warn!(role = self.role, target = %target, reason, "Session overran its deadline");
                handle.abort();
                let result = PunchResult::failed(target.clone(), reason, FailureReason::Timeout);
                self.finish(&key, &handle, result.clone());
                let current = handle.subscribe().borrow().clone();
                current.unwrap_or(result)
            }
        }
    }

    /// Punch a peer known only by address
    pub async fn punch_addr(
        self: &Arc<Self>,
        reason: &str,
        addr: SocketAddr,
        client_data: Option<ClientData>,
    ) -> AddressPunch {
        let target = Contact::from_addr(addr);
        let result = self.punch(reason, &target, None, client_data).await;
        AddressPunch::from_result(addr, result)
    }

    /// Try `rendezvous` first in future sessions toward `target`
    pub fn set_rendezvous(&self, target: &Contact, rendezvous: Contact) {
        info!(role = self.role, target = %target, rendezvous = %rendezvous, "Pinned rendezvous");
        self.pins.insert(
            *target.id(),
            PinnedRendezvous {
                contact: rendezvous,
                consecutive_failures: 0,
            },
        );
    }

    /// Relay an application dictionary to `target` through `rendezvous`
    ///
    /// # Errors
    ///
    /// `RendezvousUnavailable` if we have no path to `rendezvous`,
    /// `Unreachable` if the rendezvous could not reach the target, and the
    /// usual transport, timeout and protocol errors.
    pub async fn send_message(
        &self,
        rendezvous: &Contact,
        target: &Contact,
        message: ClientData,
    ) -> Result<ClientData> {
        let known = self.binding.is_current_rendezvous(rendezvous.addr())
            || self
                .messenger
                .directory()
                .rendezvous_candidates()
                .iter()
                .any(|c| c == rendezvous || c.addr() == rendezvous.addr());
        if !known {
            return Err(PuncherError::rendezvous_unavailable(
                "no relay path to rendezvous",
            ));
        }

        let nonce = wire::new_nonce();
        let request = WireMessage::RelayReq {
            nonce,
            target_addr: wire::encode_addr(target.addr()),
            payload: message,
        };
        match self
            .messenger
            .request(rendezvous, &request, self.config.candidate_timeout * 2)
            .await?
        {
            WireMessage::RelayResp {
                nonce: n,
                ok: true,
                payload,
                ..
            } if n == nonce => Ok(payload.unwrap_or_default()),
            WireMessage::RelayResp {
                nonce: n,
                ok: false,
                err,
                ..
            } if n == nonce => Err(PuncherError::Unreachable(Cow::Owned(
                err.unwrap_or_else(|| "relay failed".to_string()),
            ))),
            _ => Err(PuncherError::protocol("unexpected reply to relay_req")),
        }
    }

    /// Resolve every live session as cancelled and stop its driver
    pub fn cancel_all(&self) {
        for (key, handle) in self.sessions.drain() {
            handle.abort();
            let target = handle.target().clone();
            let result = PunchResult::failed(target.clone(), &key.reason, FailureReason::Cancelled);
            if handle.resolve(result) {
                self.listeners.notify(&PuncherEvent::SessionFailed {
                    target,
                    reason: FailureReason::Cancelled,
                });
            }
        }
        self.probes.clear();
    }

    /// Cancel sessions, forget caches and pins
    pub fn destroy(&self) {
        self.cancel_all();
        self.reachable.clear();
        self.pins.clear();
        self.chain.destroy();
    }

    /// Candidate order: caller hint, pin, then oracle ranking
    fn rank_candidates(&self, target: &Contact, hint: Option<Contact>) -> Vec<Contact> {
        let directory = self.messenger.directory();
        let local = directory.local_contact();
        let pinned = self.pins.get(target.id()).map(|p| p.contact.clone());
        let ranked = self.oracle.rank(directory.rendezvous_candidates());

        let mut out: Vec<Contact> = Vec::new();
        for candidate in hint.into_iter().chain(pinned).chain(ranked) {
            let excluded = candidate == *target
                || candidate == local
                || candidate.addr() == target.addr()
                || candidate.addr() == local.addr();
            if !excluded && !out.contains(&candidate) {
                out.push(candidate);
            }
        }
        out.truncate(self.config.max_candidates);
        out
    }

    async fn run_session(&self, mut session: PunchSession, hint: Option<Contact>) -> PunchResult {
        if let Some(fresh) = self.messenger.directory().resolve(session.target.id()).await {
            if fresh.addr() != session.target.addr() {
                debug!(role = self.role, target = %fresh, "Target address refreshed");
            }
            session.target = fresh;
        }

        let candidates = self.rank_candidates(&session.target, hint);
        if candidates.is_empty() {
            debug!(role = self.role, target = %session.target, "No rendezvous candidates");
            if let Some(result) = self.delegate(&session).await {
                return result;
            }
            return PunchResult::failed(
                session.target,
                &session.reason,
                FailureReason::RendezvousUnavailable,
            );
        }

        let started = Instant::now();
        let mut confirm = self.probes.register(session.nonce);
        'candidates: for candidate in candidates {
            for _ in 0..self.config.tries_per_candidate {
                let remaining = session.remaining();
                if remaining.is_zero() {
                    break 'candidates;
                }
                session.note_candidate(&candidate);
                session.attempt_count += 1;
                let budget = self.config.candidate_timeout.min(remaining);
                debug!(
                    role = self.role,
                    target = %session.target,
                    rendezvous = %candidate,
                    attempt = session.attempt_count,
                    "Punch attempt"
                );

                match self.attempt(&session, &candidate, budget, &mut confirm).await {
                    Attempt::Confirmed { addr, client_data } => {
                        self.probes.cancel(session.nonce);
                        self.pin_succeeded(&session.target, &candidate);
                        return PunchResult {
                            target: session.target,
                            reason: session.reason,
                            outcome: PunchOutcome::Succeeded {
                                addr,
                                rtt: started.elapsed(),
                            },
                            rendezvous_used: session.candidates_tried,
                            client_data,
                            via_secondary: false,
                            short_circuit: false,
                        };
                    }
                    Attempt::Rejected(err) => {
                        debug!(role = self.role, rendezvous = %candidate, err, "Punch rejected");
                        self.pin_failed(&session.target, &candidate);
                        continue 'candidates;
                    }
                    Attempt::TimedOut => {
                        debug!(role = self.role, rendezvous = %candidate, "Punch attempt timed out");
                        self.pin_failed(&session.target, &candidate);
                    }
                    Attempt::Transport(e) => {
                        debug!(role = self.role, rendezvous = %candidate, error = %e, "Punch attempt failed");
                        self.pin_failed(&session.target, &candidate);
                    }
                    Attempt::Closed => {
                        confirm = self.probes.register(session.nonce);
                    }
                }
            }
        }
        self.probes.cancel(session.nonce);

        let failure = if session.remaining().is_zero() {
            FailureReason::Timeout
        } else {
            FailureReason::Unreachable
        };
        if let Some(result) = self.delegate(&session).await {
            return result;
        }
        PunchResult {
            rendezvous_used: session.candidates_tried,
            ..PunchResult::failed(session.target, &session.reason, failure)
        }
    }

    async fn attempt(
        &self,
        session: &PunchSession,
        candidate: &Contact,
        budget: Duration,
        confirm: &mut oneshot::Receiver<SocketAddr>,
    ) -> Attempt {
        let nonce = session.nonce;
        let target = &session.target;
        let request = WireMessage::PunchReq {
            reason: session.reason.clone(),
            target_addr: wire::encode_addr(target.addr()),
            nonce,
            ts_ms: wire::now_ms(),
            client_data: session.client_data.clone(),
        };

        let _probes = ProbeBurst(spawn_probes(
            self.messenger.clone(),
            target.addr(),
            nonce,
            self.config.probe_count,
            self.config.probe_interval,
        ));
        let mut _remapped: Option<ProbeBurst> = None;
        let mut client_data = None;

        let expiry = tokio::time::sleep(budget);
        tokio::pin!(expiry);
        let reply = self.messenger.request(candidate, &request, budget);
        tokio::pin!(reply);
        let mut replied = false;

        loop {
            tokio::select! {
                confirmed = &mut *confirm => {
                    let Ok(addr) = confirmed else {
                        return Attempt::Closed;
                    };
                    if !replied {
                        // the rendezvous reply usually trails the first probe closely
                        if let Ok(Ok(WireMessage::PunchResp { nonce: n, ok: true, client_data: data, .. })) =
                            tokio::time::timeout(self.config.probe_interval, &mut reply).await
                        {
                            if n == nonce {
                                client_data = data;
                            }
                        }
                    }
                    return Attempt::Confirmed { addr, client_data };
                }
                response = &mut reply, if !replied => {
                    replied = true;
                    match response {
                        Ok(WireMessage::PunchResp { nonce: n, ok: true, ext_addr, client_data: data, .. })
                            if n == nonce =>
                        {
                            client_data = data;
                            // The rendezvous saw the target elsewhere; probe there too
                            if let Ok(Some(ext)) = wire::decode_opt_addr(&ext_addr) {
                                if ext != target.addr() {
                                    _remapped = Some(ProbeBurst(spawn_probes(
                                        self.messenger.clone(),
                                        ext,
                                        nonce,
                                        self.config.probe_count,
                                        self.config.probe_interval,
                                    )));
                                }
                            }
                        }
                        Ok(WireMessage::PunchResp { nonce: n, ok: false, err, .. }) if n == nonce => {
                            return Attempt::Rejected(err.unwrap_or_default());
                        }
                        Ok(other) => {
                            warn!(
                                role = self.role,
                                rendezvous = %candidate,
                                kind = other.message_type(),
                                "Ignoring unexpected reply to punch_req"
                            );
                        }
                        // Already logged and counted by the messenger
                        Err(PuncherError::Protocol(_)) => {}
                        Err(PuncherError::Timeout(_)) => return Attempt::TimedOut,
                        Err(e) => return Attempt::Transport(e),
                    }
                }
                () = &mut expiry => return Attempt::TimedOut,
            }
        }
    }

    async fn delegate(&self, session: &PunchSession) -> Option<PunchResult> {
        self.chain.secondary()?;
        let remaining = session.remaining();
        if remaining.is_zero() {
            return None;
        }
        let delegated = self.chain.delegate(
            &session.reason,
            &session.target,
            session.client_data.clone(),
            &session.candidates_tried,
        );
        let mut result = tokio::time::timeout(remaining, delegated).await.ok()??;
        result.target = session.target.clone();
        result.reason = session.reason.clone();
        Some(result)
    }

    fn pin_succeeded(&self, target: &Contact, candidate: &Contact) {
        if let Some(mut pin) = self.pins.get_mut(target.id()) {
            if pin.contact == *candidate {
                pin.consecutive_failures = 0;
            }
        }
    }

    fn pin_failed(&self, target: &Contact, candidate: &Contact) {
        let Some(threshold) = self.config.pin_eviction_threshold else {
            return;
        };
        let evict = match self.pins.get_mut(target.id()) {
            Some(mut pin) if pin.contact == *candidate => {
                pin.consecutive_failures += 1;
                pin.consecutive_failures >= threshold
            }
            _ => false,
        };
        if evict
            && self
                .pins
                .remove_if(target.id(), |_, pin| pin.contact == *candidate)
                .is_some()
        {
            info!(role = self.role, target = %target, rendezvous = %candidate, "Evicted pinned rendezvous");
        }
    }

    fn finish(&self, key: &SessionKey, handle: &Arc<SessionHandle>, result: PunchResult) {
        let event = match &result.outcome {
            PunchOutcome::Succeeded { addr, rtt } => {
                self.reachable.insert(handle.target(), *addr);
                if result.target.addr() != handle.target().addr() {
                    self.reachable.insert(&result.target, *addr);
                }
                info!(
                    role = self.role,
                    target = %result.target,
                    %addr,
                    ?rtt,
                    tried = result.rendezvous_used.len(),
                    via_secondary = result.via_secondary,
                    "Punch succeeded"
                );
                PuncherEvent::SessionSucceeded {
                    target: result.target.clone(),
                    addr: *addr,
                }
            }
            PunchOutcome::Failed(reason) => {
                info!(
                    role = self.role,
                    target = %result.target,
                    reason = reason.as_str(),
                    tried = result.rendezvous_used.len(),
                    "Punch failed"
                );
                PuncherEvent::SessionFailed {
                    target: result.target.clone(),
                    reason: *reason,
                }
            }
        };
        let success = result.is_success();
        self.sessions.remove(key, handle);
        if handle.resolve(result) {
            self.messenger.stats().record_punch_sent(success);
            self.listeners.notify(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reachability_cache_expires() {
        let cache = ReachabilityCache::new(Duration::from_secs(60));
        let target = Contact::from_addr("10.0.0.1:1".parse().unwrap());
        let confirmed: SocketAddr = "10.0.0.1:2".parse().unwrap();
        cache.insert(&target, confirmed);
        assert_eq!(cache.lookup(&target), Some(confirmed));

        let same_addr_other_id = Contact::new(NodeId::random(), target.addr());
        assert_eq!(cache.lookup(&same_addr_other_id), Some(confirmed));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.lookup(&target), None);
    }
}
