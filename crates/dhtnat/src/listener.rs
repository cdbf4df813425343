//! Listener fan-out.
//!
//! Observers register a [`PuncherListener`]; the set is de-duplicated by
//! identity and every notification iterates a snapshot, so listeners added
//! or removed from inside a callback never see a torn view. A panicking
//! listener is logged and skipped.

use crate::contact::Contact;
use crate::error::FailureReason;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// State transitions and terminal session outcomes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PuncherEvent {
    /// A rendezvous acknowledged our bind request
    BindingEstablished(Contact),
    /// The binding went stale, was closed, or was released
    BindingLost(Contact),
    /// The puncher started or stopped pursuing a rendezvous
    ActiveChanged(bool),
    /// `operational()` changed
    OperationalChanged(bool),
    /// A punch session confirmed a hole
    SessionSucceeded {
        /// Target peer
        target: Contact,
        /// Confirmed address
        addr: SocketAddr,
    },
    /// A punch session ended without a hole
    SessionFailed {
        /// Target peer
        target: Contact,
        /// Failure code
        reason: FailureReason,
    },
}

/// Observer of puncher events
pub trait PuncherListener: Send + Sync {
    /// Called once per event; must not block
    fn on_event(&self, event: &PuncherEvent);
}

/// Registered listeners
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn PuncherListener>>>,
}

fn same_listener(a: &Arc<dyn PuncherListener>, b: &Arc<dyn PuncherListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

impl ListenerSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; returns false if it was already registered
    pub fn add(&self, listener: Arc<dyn PuncherListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Remove a listener; returns false if it was not registered
    pub fn remove(&self, listener: &Arc<dyn PuncherListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Number of registered listeners
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// True if no listener is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver an event to a snapshot of the set
    pub fn notify(&self, event: &PuncherEvent) {
        let snapshot: Vec<_> = self.listeners.read().clone();
        for listener in snapshot {
            deliver(&listener, event);
        }
    }

    /// Deliver an event to one listener with the same isolation
    pub fn notify_one(listener: &Arc<dyn PuncherListener>, event: &PuncherEvent) {
        deliver(listener, event);
    }
}

fn deliver(listener: &Arc<dyn PuncherListener>, event: &PuncherEvent) {
    if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
        warn!(?event, "Listener panicked during notification");
    }
}

/// Forwards events into an unbounded channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<PuncherEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PuncherEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl PuncherListener for ChannelListener {
    fn on_event(&self, event: &PuncherEvent) {
        // Receiver gone just means nobody is watching anymore
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Counting(Mutex<Vec<PuncherEvent>>);

    impl PuncherListener for Counting {
        fn on_event(&self, event: &PuncherEvent) {
            self.0.lock().push(event.clone());
        }
    }

    struct Panicking;

    impl PuncherListener for Panicking {
        fn on_event(&self, _event: &PuncherEvent) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_dedupe_by_identity() {
        let set = ListenerSet::new();
        let a: Arc<dyn PuncherListener> = Arc::new(Counting::default());
        let b: Arc<dyn PuncherListener> = Arc::new(Counting::default());
        assert!(set.add(a.clone()));
        assert!(!set.add(a.clone()));
        assert!(set.add(b.clone()));
        assert_eq!(set.len(), 2);

        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let set = ListenerSet::new();
        let counting = Arc::new(Counting::default());
        set.add(Arc::new(Panicking));
        set.add(counting.clone());

        set.notify(&PuncherEvent::ActiveChanged(true));
        assert_eq!(counting.0.lock().as_slice(), &[PuncherEvent::ActiveChanged(true)]);
    }

    #[test]
    fn test_mutation_during_notify() {
        struct Adder {
            set: Arc<ListenerSet>,
            added: Arc<Counting>,
        }
        impl PuncherListener for Adder {
            fn on_event(&self, _event: &PuncherEvent) {
                self.set.add(self.added.clone());
            }
        }

        let set = Arc::new(ListenerSet::new());
        let added = Arc::new(Counting::default());
        set.add(Arc::new(Adder {
            set: set.clone(),
            added: added.clone(),
        }));

        set.notify(&PuncherEvent::OperationalChanged(true));
        // Added mid-notification, so it only sees the next event
        assert!(added.0.lock().is_empty());
        set.notify(&PuncherEvent::OperationalChanged(false));
        assert_eq!(added.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let (listener, mut rx) = ChannelListener::new();
        let set = ListenerSet::new();
        set.add(listener);
        set.notify(&PuncherEvent::ActiveChanged(false));
        assert_eq!(rx.recv().await, Some(PuncherEvent::ActiveChanged(false)));
    }
}
