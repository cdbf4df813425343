//! Puncher configuration

use crate::error::{PuncherError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Position of a puncher in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PuncherRole {
    /// Chain head; serves as a rendezvous for others
    #[default]
    Primary,
    /// Fallback instance; never accepts bindings
    Secondary,
}

/// Timers, budgets and limits for one puncher instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PuncherConfig {
    /// Binding goes stale this long after the last heartbeat ack
    #[serde(with = "duration_ms")]
    pub binding_ttl: Duration,

    /// Heartbeat interval is `binding_ttl / heartbeat_divisor`
    pub heartbeat_divisor: u32,

    /// Consecutive missed heartbeat acks that invalidate a binding
    pub missed_heartbeat_limit: u32,

    /// Wait for a bind acknowledgement
    #[serde(with = "duration_ms")]
    pub bind_timeout: Duration,

    /// Wait for our own probe to come back during the reachability self-test
    #[serde(with = "duration_ms")]
    pub self_test_timeout: Duration,

    /// Pause between rendezvous-seek cycles when nothing could be bound
    #[serde(with = "duration_ms")]
    pub seek_retry_interval: Duration,

    /// How long a failed rendezvous is skipped when seeking
    #[serde(with = "duration_ms")]
    pub failed_rendezvous_cooldown: Duration,

    /// Failed rendezvous entries remembered
    pub failed_rendezvous_history: usize,

    /// Overall deadline for one punch session
    #[serde(with = "duration_ms")]
    pub session_deadline: Duration,

    /// Rendezvous candidates tried per session
    pub max_candidates: usize,

    /// Attempts per candidate
    pub tries_per_candidate: usize,

    /// Wait per attempt
    #[serde(with = "duration_ms")]
    pub candidate_timeout: Duration,

    /// Probe datagrams sent per punch attempt
    pub probe_count: u32,

    /// Gap between probe datagrams
    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,

    /// How long a confirmed address short-circuits new punches
    #[serde(with = "duration_ms")]
    pub reachable_ttl: Duration,

    /// Evict a pinned rendezvous after this many consecutive failures
    /// (`None` keeps pins until replaced)
    pub pin_eviction_threshold: Option<u32>,

    /// Clients served concurrently as a rendezvous
    pub max_served_bindings: usize,

    /// Served binding expires after this much silence
    #[serde(with = "duration_ms")]
    pub served_binding_timeout: Duration,

    /// Consecutive failed forwards before a served client is refused
    pub served_fail_limit: u32,

    /// Refusal period after `served_fail_limit` is hit
    #[serde(with = "duration_ms")]
    pub served_fail_backoff: Duration,

    /// Primary or secondary
    pub role: PuncherRole,
}

impl Default for PuncherConfig {
    fn default() -> Self {
        Self {
            binding_ttl: Duration::from_secs(150),
            heartbeat_divisor: 3,
            missed_heartbeat_limit: 3,
            bind_timeout: Duration::from_secs(10),
            self_test_timeout: Duration::from_secs(5),
            seek_retry_interval: Duration::from_secs(30),
            failed_rendezvous_cooldown: Duration::from_secs(300),
            failed_rendezvous_history: 16,
            session_deadline: Duration::from_secs(20),
            max_candidates: 3,
            tries_per_candidate: 2,
            candidate_timeout: Duration::from_secs(4),
            probe_count: 3,
            probe_interval: Duration::from_millis(250),
            reachable_ttl: Duration::from_secs(120),
            pin_eviction_threshold: Some(3),
            max_served_bindings: 8,
            served_binding_timeout: Duration::from_secs(300),
            served_fail_limit: 8,
            served_fail_backoff: Duration::from_secs(30),
            role: PuncherRole::Primary,
        }
    }
}

impl PuncherConfig {
    /// Same settings, secondary role
    #[must_use]
    pub fn secondary(&self) -> Self {
        Self {
            role: PuncherRole::Secondary,
            ..self.clone()
        }
    }

    /// Keep-alive period for the rendezvous binding
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.binding_ttl / self.heartbeat_divisor.max(1)
    }

    /// Total attempts a session may make (candidates x tries)
    #[must_use]
    pub fn attempt_budget(&self) -> usize {
        self.max_candidates * self.tries_per_candidate
    }

    /// Check invariants between fields
    pub fn validate(&self) -> Result<()> {
        if self.binding_ttl.is_zero() {
            return Err(PuncherError::invalid_config("binding_ttl must be non-zero"));
        }
        if self.heartbeat_divisor == 0 {
            return Err(PuncherError::invalid_config(
                "heartbeat_divisor must be non-zero",
            ));
        }
        if self.missed_heartbeat_limit == 0 {
            return Err(PuncherError::invalid_config(
                "missed_heartbeat_limit must be non-zero",
            ));
        }
        if self.session_deadline.is_zero() || self.candidate_timeout.is_zero() {
            return Err(PuncherError::invalid_config(
                "session_deadline and candidate_timeout must be non-zero",
            ));
        }
        if self.bind_timeout.is_zero() || self.self_test_timeout.is_zero() {
            return Err(PuncherError::invalid_config(
                "bind_timeout and self_test_timeout must be non-zero",
            ));
        }
        if self.max_candidates == 0 || self.tries_per_candidate == 0 || self.probe_count == 0 {
            return Err(PuncherError::invalid_config(
                "attempt budget and probe_count must be non-zero",
            ));
        }
        if self.candidate_timeout > self.session_deadline {
            return Err(PuncherError::invalid_config(format!(
                "candidate_timeout ({:?}) exceeds session_deadline ({:?})",
                self.candidate_timeout, self.session_deadline
            )));
        }
        if self.pin_eviction_threshold == Some(0) {
            return Err(PuncherError::invalid_config(
                "pin_eviction_threshold must be non-zero (use None to disable)",
            ));
        }
        Ok(())
    }
}

/// Serialise a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialise as milliseconds
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialise from milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PuncherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(50));
        assert_eq!(config.attempt_budget(), 6);
        assert_eq!(config.role, PuncherRole::Primary);
    }

    #[test]
    fn test_secondary_copy() {
        let config = PuncherConfig {
            max_candidates: 5,
            ..Default::default()
        };
        let secondary = config.secondary();
        assert_eq!(secondary.role, PuncherRole::Secondary);
        assert_eq!(secondary.max_candidates, 5);
    }

    #[test]
    fn test_validate_rejects() {
        let bad = [
            PuncherConfig {
                binding_ttl: Duration::ZERO,
                ..Default::default()
            },
            PuncherConfig {
                heartbeat_divisor: 0,
                ..Default::default()
            },
            PuncherConfig {
                tries_per_candidate: 0,
                ..Default::default()
            },
            PuncherConfig {
                candidate_timeout: Duration::from_secs(30),
                ..Default::default()
            },
            PuncherConfig {
                pin_eviction_threshold: Some(0),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(PuncherError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_durations_as_millis() {
        let json = serde_json::to_value(PuncherConfig::default()).unwrap();
        assert_eq!(json["binding_ttl"], 150_000);
        assert_eq!(json["probe_interval"], 250);
        assert_eq!(json["role"], "primary");

        let parsed: PuncherConfig =
            serde_json::from_str(r#"{"candidate_timeout": 1500, "role": "secondary"}"#).unwrap();
        assert_eq!(parsed.candidate_timeout, Duration::from_millis(1500));
        assert_eq!(parsed.role, PuncherRole::Secondary);
        assert_eq!(parsed.session_deadline, Duration::from_secs(20));
    }
}
