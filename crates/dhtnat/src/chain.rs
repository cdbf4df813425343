//! Puncher chaining.
//!
//! A primary engine may hold a secondary puncher: an independent instance
//! of the same interface with its own sessions and binding. The secondary is
//! consulted only after the primary exhausts its candidates, and its result
//! is merged into the primary's.

use crate::contact::Contact;
use crate::error::Result;
use crate::session::PunchResult;
use crate::wire::ClientData;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Anything that can punch toward a contact
#[async_trait]
pub trait Puncher: Send + Sync {
    /// Punch toward `target`, optionally starting with `rendezvous`
    async fn punch(
        &self,
        reason: &str,
        target: &Contact,
        rendezvous: Option<Contact>,
        client_data: Option<ClientData>,
    ) -> Result<PunchResult>;

    /// True while pursuing or holding its own rendezvous binding
    fn active(&self) -> bool;

    /// True while its own binding is live
    fn operational(&self) -> bool;

    /// Tear down; terminal
    fn destroy(&self);

    /// Diagnostic string
    fn get_stats(&self) -> String;
}

/// Optional fallback behind a primary engine
#[derive(Clone, Default)]
pub struct FallbackChain {
    secondary: Option<Arc<dyn Puncher>>,
}

impl FallbackChain {
    /// Chain with an optional secondary
    #[must_use]
    pub fn new(secondary: Option<Arc<dyn Puncher>>) -> Self {
        Self { secondary }
    }

    /// The secondary, if configured
    #[must_use]
    pub fn secondary(&self) -> Option<&Arc<dyn Puncher>> {
        self.secondary.as_ref()
    }

    /// Hand an exhausted session to the secondary and merge its result
    ///
    /// Returns `None` when no secondary is configured.
    pub async fn delegate(
        &self,
        reason: &str,
        target: &Contact,
        client_data: Option<ClientData>,
        primary_tried: &[Contact],
    ) -> Option<PunchResult> {
        let secondary = self.secondary.as_ref()?;
        debug!(target = %target, reason, "Delegating to secondary puncher");
        let result = match secondary.punch(reason, target, None, client_data).await {
            Ok(result) => result,
            Err(e) => {
                debug!(target = %target, error = %e, "Secondary puncher failed");
                return None;
            }
        };
        Some(Self::merge(primary_tried, result))
    }

    /// Prefix the primary's tried candidates and mark the result as chained
    #[must_use]
    pub fn merge(primary_tried: &[Contact], mut secondary: PunchResult) -> PunchResult {
        let mut used = primary_tried.to_vec();
        for contact in secondary.rendezvous_used.drain(..) {
            if !used.contains(&contact) {
                used.push(contact);
            }
        }
        secondary.rendezvous_used = used;
        secondary.via_secondary = true;
        secondary
    }

    /// Destroy the secondary
    pub fn destroy(&self) {
        if let Some(secondary) = &self.secondary {
            secondary.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::session::PunchOutcome;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Fixed {
        result: PunchResult,
        calls: Mutex<usize>,
        destroyed: Mutex<bool>,
    }

    #[async_trait]
    impl Puncher for Fixed {
        async fn punch(
            &self,
            _reason: &str,
            _target: &Contact,
            _rendezvous: Option<Contact>,
            _client_data: Option<ClientData>,
        ) -> Result<PunchResult> {
            *self.calls.lock() += 1;
            Ok(self.result.clone())
        }

        fn active(&self) -> bool {
            false
        }

        fn operational(&self) -> bool {
            false
        }

        fn destroy(&self) {
            *self.destroyed.lock() = true;
        }

        fn get_stats(&self) -> String {
            String::new()
        }
    }

    fn contact(port: u16) -> Contact {
        Contact::from_addr(format!("10.0.0.1:{port}").parse().unwrap())
    }

    #[tokio::test]
    async fn test_no_secondary() {
        let chain = FallbackChain::default();
        assert!(chain.delegate("r", &contact(1), None, &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_delegate_merges() {
        let mut result = PunchResult::failed(contact(9), "r", FailureReason::Unreachable);
        result.outcome = PunchOutcome::Succeeded {
            addr: contact(9).addr(),
            rtt: Duration::from_millis(10),
        };
        result.rendezvous_used = vec![contact(2), contact(3)];
        let secondary = Arc::new(Fixed {
            result,
            calls: Mutex::new(0),
            destroyed: Mutex::new(false),
        });
        let chain = FallbackChain::new(Some(secondary.clone()));

        let merged = chain
            .delegate("r", &contact(9), None, &[contact(1), contact(2)])
            .await
            .unwrap();
        assert!(merged.is_success());
        assert!(merged.via_secondary);
        assert_eq!(merged.rendezvous_used, vec![contact(1), contact(2), contact(3)]);
        assert_eq!(*secondary.calls.lock(), 1);

        chain.destroy();
        assert!(*secondary.destroyed.lock());
    }
}
