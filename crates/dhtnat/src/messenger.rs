//! Typed send helpers over the contact directory.

use crate::contact::Contact;
use crate::error::{PuncherError, Result, TransportError};
use crate::ports::ContactDirectory;
use crate::stats::PuncherStats;
use crate::wire::{MALFORMED_KIND, UNKNOWN_KIND, WireMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Encodes, sends and decodes wire dictionaries, counting every message
#[derive(Clone)]
pub struct Messenger {
    directory: Arc<dyn ContactDirectory>,
    stats: Arc<PuncherStats>,
}

impl Messenger {
    /// Wrap a directory
    #[must_use]
    pub fn new(directory: Arc<dyn ContactDirectory>, stats: Arc<PuncherStats>) -> Self {
        Self { directory, stats }
    }

    /// Underlying directory
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn ContactDirectory> {
        &self.directory
    }

    /// Shared counters
    #[must_use]
    pub fn stats(&self) -> &Arc<PuncherStats> {
        &self.stats
    }

    /// Send a request and decode the reply
    ///
    /// # Errors
    ///
    /// `Timeout` if no reply arrives within `timeout`, `Transport` on a
    /// delivery failure, `Protocol` if the reply is malformed.
    pub async fn request(
        &self,
        to: &Contact,
        msg: &WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage> {
        let payload = msg.to_bytes()?;
        self.stats.record_out(msg.kind_index());
        debug!(to = %to, kind = msg.message_type(), nonce = msg.nonce(), "Sending request");

        let reply = self
            .directory
            .send_request(to, payload, timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout => PuncherError::timeout("request"),
                other => PuncherError::from(other),
            })?;

        self.decode(to.addr(), &reply)
            .ok_or_else(|| PuncherError::protocol("malformed reply"))
    }

    /// Send a datagram without waiting for anything
    pub async fn datagram(&self, to: SocketAddr, msg: &WireMessage) -> Result<()> {
        let payload = msg.to_bytes()?;
        self.stats.record_out(msg.kind_index());
        self.directory.send_datagram(to, payload).await?;
        Ok(())
    }

    /// Decode an inbound payload; malformed input is logged, counted and dropped
    pub fn decode(&self, from: SocketAddr, payload: &[u8]) -> Option<WireMessage> {
        match WireMessage::from_bytes(payload) {
            Ok(msg) => {
                self.stats.record_in(msg.kind_index());
                Some(msg)
            }
            Err(e) => {
                let kind = if serde_json::from_slice::<serde_json::Value>(payload).is_ok() {
                    UNKNOWN_KIND
                } else {
                    MALFORMED_KIND
                };
                self.stats.record_in(kind);
                self.stats.record_protocol_error();
                warn!(%from, error = %e, "Dropping malformed dictionary");
                None
            }
        }
    }
}
