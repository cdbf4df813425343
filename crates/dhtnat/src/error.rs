//! Error types for the NAT puncher
//!
//! Errors are split the same way callers need to react to them:
//!
//! - **Transient**: a single step failed and the session may still succeed
//!   (`Timeout`, `Transport`, `Protocol`). These are retried inside a punch
//!   session and normally never reach the caller.
//! - **Permanent**: the operation cannot succeed without intervention
//!   (`InvalidState`, `InvalidConfig`).
//!
//! Terminal punch outcomes are not errors: a failed `punch` returns a
//! [`PunchResult`](crate::PunchResult) carrying a [`FailureReason`].

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur in puncher operations
#[derive(Debug, Error, Clone)]
pub enum PuncherError {
    /// No candidate produced a confirmed hole within the attempt budget
    #[error("Target unreachable: {0}")]
    Unreachable(Cow<'static, str>),

    /// No rendezvous-capable contact known or reachable
    #[error("Rendezvous unavailable: {0}")]
    RendezvousUnavailable(Cow<'static, str>),

    /// A handshake step exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Session aborted by the caller or by `destroy()`
    #[error("Cancelled: {0}")]
    Cancelled(Cow<'static, str>),

    /// Malformed wire dictionary from a peer
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    /// Contact directory failed to deliver
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Contract violation, such as any operation after `destroy()`
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl PuncherError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PuncherError::Timeout(_) | PuncherError::Transport(_) | PuncherError::Protocol(_)
        )
    }

    /// Returns true if this error will not succeed without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PuncherError::InvalidState(_) | PuncherError::InvalidConfig(_)
        )
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        PuncherError::Timeout(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        PuncherError::Protocol(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        PuncherError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a rendezvous-unavailable error with static context (zero allocation)
    #[must_use]
    pub const fn rendezvous_unavailable(context: &'static str) -> Self {
        PuncherError::RendezvousUnavailable(Cow::Borrowed(context))
    }

    /// Create a cancellation error with static context (zero allocation)
    #[must_use]
    pub const fn cancelled(context: &'static str) -> Self {
        PuncherError::Cancelled(Cow::Borrowed(context))
    }

    /// Create an invalid config error
    #[must_use]
    pub fn invalid_config(context: impl Into<Cow<'static, str>>) -> Self {
        PuncherError::InvalidConfig(context.into())
    }
}

impl From<serde_json::Error> for PuncherError {
    fn from(err: serde_json::Error) -> Self {
        PuncherError::Protocol(Cow::Owned(err.to_string()))
    }
}

/// Errors returned by the contact directory's send primitives
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No reply before the caller's timeout
    #[error("request timed out")]
    Timeout,

    /// Destination refused or cannot be routed to
    #[error("destination {0} unreachable")]
    Unreachable(SocketAddr),

    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Transport has shut down
    #[error("transport closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Terminal failure codes reported in a punch result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every candidate tried, no hole confirmed
    Unreachable,
    /// No rendezvous candidate known
    RendezvousUnavailable,
    /// Session deadline passed first
    Timeout,
    /// Caller or `destroy()` aborted the session
    Cancelled,
}

impl FailureReason {
    /// Stable reason string
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureReason::Unreachable => "unreachable",
            FailureReason::RendezvousUnavailable => "rendezvous_unavailable",
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FailureReason> for PuncherError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Unreachable => PuncherError::Unreachable(Cow::Borrowed("punch failed")),
            FailureReason::RendezvousUnavailable => {
                PuncherError::rendezvous_unavailable("no rendezvous candidates")
            }
            FailureReason::Timeout => PuncherError::timeout("session deadline"),
            FailureReason::Cancelled => PuncherError::cancelled("session cancelled"),
        }
    }
}

/// Result type for puncher operations
pub type Result<T> = std::result::Result<T, PuncherError>;
