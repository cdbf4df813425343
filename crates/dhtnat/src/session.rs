//! Punch sessions and the active-session table.
//!
//! At most one session is live per (target, reason). Callers asking for a
//! pair that is already in flight attach to its [`SessionHandle`] and receive
//! the same [`PunchResult`].

use crate::contact::{Contact, NodeId};
use crate::error::FailureReason;
use crate::wire::ClientData;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Identity of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Target node
    pub target: NodeId,
    /// Caller supplied reason
    pub reason: String,
}

impl SessionKey {
    /// Key for a target and reason
    #[must_use]
    pub fn new(target: &Contact, reason: &str) -> Self {
        Self {
            target: *target.id(),
            reason: reason.to_string(),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PunchOutcome {
    /// A hole is open at `addr`
    Succeeded {
        /// Confirmed reachable address
        addr: SocketAddr,
        /// Time from session start to confirmation
        rtt: Duration,
    },
    /// No hole
    Failed(FailureReason),
}

/// Result handed to every caller of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunchResult {
    /// Target peer
    pub target: Contact,
    /// Reason the punch was requested
    pub reason: String,
    /// Terminal outcome
    pub outcome: PunchOutcome,
    /// Rendezvous candidates actually tried, in order
    pub rendezvous_used: Vec<Contact>,
    /// Data the target returned through the rendezvous
    pub client_data: Option<ClientData>,
    /// The outcome came from the secondary puncher
    pub via_secondary: bool,
    /// Answered from the reachability cache without network activity
    pub short_circuit: bool,
}

impl PunchResult {
    /// Failed result with nothing tried
    #[must_use]
    pub fn failed(target: Contact, reason: &str, failure: FailureReason) -> Self {
        Self {
            target,
            reason: reason.to_string(),
            outcome: PunchOutcome::Failed(failure),
            rendezvous_used: Vec::new(),
            client_data: None,
            via_secondary: false,
            short_circuit: false,
        }
    }

    /// True if a hole was confirmed
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PunchOutcome::Succeeded { .. })
    }

    /// Failure code, if the session failed
    #[must_use]
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self.outcome {
            PunchOutcome::Failed(reason) => Some(reason),
            PunchOutcome::Succeeded { .. } => None,
        }
    }

    /// Confirmed address, if the session succeeded
    #[must_use]
    pub fn reachable_addr(&self) -> Option<SocketAddr> {
        match self.outcome {
            PunchOutcome::Succeeded { addr, .. } => Some(addr),
            PunchOutcome::Failed(_) => None,
        }
    }
}

/// Result of punching a peer known only by address
///
/// Carries the (possibly updated) address alongside the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPunch {
    /// Reachable at `addr`, which may differ from the address asked for
    Reachable {
        /// Confirmed address
        addr: SocketAddr,
        /// Full session result
        result: PunchResult,
    },
    /// Not reachable; `addr` is the address that was tried
    Unreachable {
        /// Address tried
        addr: SocketAddr,
        /// Full session result
        result: PunchResult,
    },
}

impl AddressPunch {
    /// Build from a session result and the address originally asked for
    #[must_use]
    pub fn from_result(requested: SocketAddr, result: PunchResult) -> Self {
        match result.reachable_addr() {
            Some(addr) => AddressPunch::Reachable { addr, result },
            None => AddressPunch::Unreachable {
                addr: requested,
                result,
            },
        }
    }

    /// Address to use from now on
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        match self {
            AddressPunch::Reachable { addr, .. } | AddressPunch::Unreachable { addr, .. } => *addr,
        }
    }

    /// Underlying session result
    #[must_use]
    pub fn result(&self) -> &PunchResult {
        match self {
            AddressPunch::Reachable { result, .. } | AddressPunch::Unreachable { result, .. } => {
                result
            }
        }
    }

    /// True for `Reachable`
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        matches!(self, AddressPunch::Reachable { .. })
    }
}

/// Bookkeeping for one in-flight session
#[derive(Debug, Clone)]
pub struct PunchSession {
    /// Target peer
    pub target: Contact,
    /// Reason
    pub reason: String,
    /// Nonce carried by every message of this session
    pub nonce: u64,
    /// Candidates tried so far, in order
    pub candidates_tried: Vec<Contact>,
    /// Attempts made
    pub attempt_count: usize,
    /// Hard deadline
    pub deadline: Instant,
    /// Advisory data from the first caller
    pub client_data: Option<ClientData>,
}

impl PunchSession {
    /// Start a session now
    #[must_use]
    pub fn new(
        target: Contact,
        reason: &str,
        client_data: Option<ClientData>,
        deadline: Duration,
    ) -> Self {
        Self {
            target,
            reason: reason.to_string(),
            nonce: crate::wire::new_nonce(),
            candidates_tried: Vec::new(),
            attempt_count: 0,
            deadline: Instant::now() + deadline,
            client_data,
        }
    }

    /// Time left before the deadline
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Record that `candidate` is about to be tried
    pub fn note_candidate(&mut self, candidate: &Contact) {
        if !self.candidates_tried.contains(candidate) {
            self.candidates_tried.push(candidate.clone());
        }
    }
}

/// Shared completion slot of a session
pub struct SessionHandle {
    tx: watch::Sender<Option<PunchResult>>,
    task: Mutex<Option<AbortHandle>>,
    target: Contact,
    nonce: u64,
}

impl SessionHandle {
    fn new(target: Contact, nonce: u64) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            task: Mutex::new(None),
            target,
            nonce,
        }
    }

    /// Session nonce
    #[must_use]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Target of the session
    #[must_use]
    pub fn target(&self) -> &Contact {
        &self.target
    }

    /// Wait for the result
    pub fn subscribe(&self) -> watch::Receiver<Option<PunchResult>> {
        self.tx.subscribe()
    }

    /// Store the result; only the first resolution counts
    pub fn resolve(&self, result: PunchResult) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    /// True once resolved
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Remember the driver task so it can be aborted
    pub fn set_task(&self, task: AbortHandle) {
        *self.task.lock() = Some(task);
    }

    /// Abort the driver task
    pub fn abort(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Active sessions, keyed by (target, reason)
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<SessionKey, Arc<SessionHandle>>,
}

impl SessionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the live session for `key`, or create one
    ///
    /// Returns the handle and `true` if the caller created it and must drive it.
    pub fn join_or_create(
        &self,
        key: SessionKey,
        target: &Contact,
        nonce: u64,
    ) -> (Arc<SessionHandle>, bool) {
        match self.sessions.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let handle = Arc::new(SessionHandle::new(target.clone(), nonce));
                entry.insert(handle.clone());
                (handle, true)
            }
        }
    }

    /// Remove `key` if it still maps to `handle`
    pub fn remove(&self, key: &SessionKey, handle: &Arc<SessionHandle>) {
        self.sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, handle));
    }

    /// Look up a live session
    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionHandle>> {
        self.sessions.get(key).map(|h| h.clone())
    }

    /// Remove and return every session
    pub fn drain(&self) -> Vec<(SessionKey, Arc<SessionHandle>)> {
        let keys: Vec<SessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|k| self.sessions.remove(&k))
            .collect()
    }

    /// Live session count
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// True if a session for `key` is live
    #[must_use]
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Contact {
        Contact::from_addr("10.0.0.5:5000".parse().unwrap())
    }

    #[test]
    fn test_join_or_create_coalesces() {
        let table = SessionTable::new();
        let key = SessionKey::new(&target(), "store");
        let (first, created) = table.join_or_create(key.clone(), &target(), 1);
        assert!(created);
        let (second, created) = table.join_or_create(key.clone(), &target(), 2);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.nonce(), 1);

        let other = SessionKey::new(&target(), "lookup");
        let (_, created) = table.join_or_create(other, &target(), 3);
        assert!(created);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_only_matching_handle() {
        let table = SessionTable::new();
        let key = SessionKey::new(&target(), "store");
        let (old, _) = table.join_or_create(key.clone(), &target(), 1);
        table.remove(&key, &old);
        let (new, created) = table.join_or_create(key.clone(), &target(), 2);
        assert!(created);

        table.remove(&key, &old);
        assert!(table.contains(&key));
        table.remove(&key, &new);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let table = SessionTable::new();
        let (handle, _) = table.join_or_create(SessionKey::new(&target(), "x"), &target(), 1);
        let mut rx = handle.subscribe();

        assert!(handle.resolve(PunchResult::failed(target(), "x", FailureReason::Cancelled)));
        assert!(!handle.resolve(PunchResult::failed(target(), "x", FailureReason::Unreachable)));

        let result = rx.wait_for(Option::is_some).await.unwrap().clone().unwrap();
        assert_eq!(result.failure_reason(), Some(FailureReason::Cancelled));
        assert!(handle.is_resolved());
    }

    #[test]
    fn test_address_punch_carries_updated_addr() {
        let requested: SocketAddr = "10.0.0.5:5000".parse().unwrap();
        let remapped: SocketAddr = "10.0.0.5:6123".parse().unwrap();
        let mut result = PunchResult::failed(target(), "x", FailureReason::Unreachable);
        let miss = AddressPunch::from_result(requested, result.clone());
        assert!(!miss.is_reachable());
        assert_eq!(miss.addr(), requested);

        result.outcome = PunchOutcome::Succeeded {
            addr: remapped,
            rtt: Duration::from_millis(40),
        };
        let hit = AddressPunch::from_result(requested, result);
        assert!(hit.is_reachable());
        assert_eq!(hit.addr(), remapped);
        assert!(hit.result().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_bookkeeping() {
        let mut session = PunchSession::new(target(), "x", None, Duration::from_secs(20));
        let r1 = Contact::from_addr("10.0.0.1:1".parse().unwrap());
        session.note_candidate(&r1);
        session.note_candidate(&r1);
        assert_eq!(session.candidates_tried.len(), 1);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(session.remaining(), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(session.remaining(), Duration::ZERO);
    }
}
