//! Puncher counters and the diagnostic string.

use crate::wire::{MESSAGE_KINDS, MESSAGE_TYPES};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counters shared by every component of one puncher
#[derive(Debug, Default)]
pub struct PuncherStats {
    punch_send_ok: AtomicU64,
    punch_send_fail: AtomicU64,
    punch_recv_ok: AtomicU64,
    punch_recv_fail: AtomicU64,
    coalesced: AtomicU64,
    short_circuits: AtomicU64,
    protocol_errors: AtomicU64,
    messages_in: [AtomicU64; MESSAGE_KINDS],
    messages_out: [AtomicU64; MESSAGE_KINDS],
}

impl PuncherStats {
    /// Fresh counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome of a session we originated
    pub fn record_punch_sent(&self, ok: bool) {
        let counter = if ok {
            &self.punch_send_ok
        } else {
            &self.punch_send_fail
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Outcome of a punch we coordinated as a rendezvous
    pub fn record_punch_served(&self, ok: bool) {
        let counter = if ok {
            &self.punch_recv_ok
        } else {
            &self.punch_recv_fail
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller joined an in-flight session
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// A punch was answered from the reachability cache
    pub fn record_short_circuit(&self) {
        self.short_circuits.fetch_add(1, Ordering::Relaxed);
    }

    /// A peer sent something we could not decode
    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Inbound message of the given kind
    pub fn record_in(&self, kind: usize) {
        if let Some(counter) = self.messages_in.get(kind) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Outbound message of the given kind
    pub fn record_out(&self, kind: usize) {
        if let Some(counter) = self.messages_out.get(kind) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Inbound count for a message type tag
    #[must_use]
    pub fn messages_in(&self, message_type: &str) -> u64 {
        Self::count_for(&self.messages_in, message_type)
    }

    /// Outbound count for a message type tag
    #[must_use]
    pub fn messages_out(&self, message_type: &str) -> u64 {
        Self::count_for(&self.messages_out, message_type)
    }

    fn count_for(counters: &[AtomicU64; MESSAGE_KINDS], message_type: &str) -> u64 {
        MESSAGE_TYPES
            .iter()
            .position(|t| *t == message_type)
            .map_or(0, |i| counters[i].load(Ordering::Relaxed))
    }

    /// Copy the counters into a snapshot; binding and session fields are left empty
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let messages = MESSAGE_TYPES
            .iter()
            .zip(self.messages_in.iter().zip(self.messages_out.iter()))
            .filter_map(|(t, (i, o))| {
                let (i, o) = (load(i), load(o));
                (i > 0 || o > 0).then_some((*t, i, o))
            })
            .collect();
        StatsSnapshot {
            punch_send_ok: load(&self.punch_send_ok),
            punch_send_fail: load(&self.punch_send_fail),
            punch_recv_ok: load(&self.punch_recv_ok),
            punch_recv_fail: load(&self.punch_recv_fail),
            coalesced: load(&self.coalesced),
            short_circuits: load(&self.short_circuits),
            protocol_errors: load(&self.protocol_errors),
            messages,
            ..StatsSnapshot::default()
        }
    }
}

/// Point-in-time view rendered by `get_stats()`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Originated sessions that succeeded
    pub punch_send_ok: u64,
    /// Originated sessions that failed
    pub punch_send_fail: u64,
    /// Coordinated punches that succeeded
    pub punch_recv_ok: u64,
    /// Coordinated punches that failed
    pub punch_recv_fail: u64,
    /// Callers coalesced onto in-flight sessions
    pub coalesced: u64,
    /// Punches answered from the reachability cache
    pub short_circuits: u64,
    /// Malformed dictionaries dropped
    pub protocol_errors: u64,
    /// `(type, in, out)` for every message type seen
    pub messages: Vec<(&'static str, u64, u64)>,
    /// Bound rendezvous
    pub rendezvous: Option<SocketAddr>,
    /// Time since the last successful bind or heartbeat
    pub last_ok_age: Option<Duration>,
    /// Time since the last failed bind or heartbeat
    pub last_fail_age: Option<Duration>,
    /// Consecutive binding failures
    pub binding_fail_count: u32,
    /// Live punch sessions
    pub sessions: usize,
    /// Clients we serve as a rendezvous
    pub served: Vec<ServedSummary>,
}

/// One served client in the diagnostic string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedSummary {
    /// Client's observed address
    pub addr: SocketAddr,
    /// Successful forwards
    pub ok: u32,
    /// Consecutive failed forwards
    pub bad: u32,
    /// Time since bind
    pub age: Duration,
}

fn age(d: Option<Duration>) -> String {
    d.map_or_else(|| "-1".to_string(), |d| d.as_secs().to_string())
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ok={},fail={},fc={},punch:send={}/{}:recv={}/{},rendezvous={},sessions={},coalesced={},short={},bindings=",
            age(self.last_ok_age),
            age(self.last_fail_age),
            self.binding_fail_count,
            self.punch_send_ok,
            self.punch_send_fail,
            self.punch_recv_ok,
            self.punch_recv_fail,
            self.rendezvous
                .map_or_else(|| "none".to_string(), |a| a.to_string()),
            self.sessions,
            self.coalesced,
            self.short_circuits,
        )?;
        for (i, s) in self.served.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}->ok={}:bad={}:age={}", s.addr, s.ok, s.bad, s.age.as_secs())?;
        }
        f.write_str(",messages=")?;
        for (i, (t, n_in, n_out)) in self.messages.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{t}:{n_in}/{n_out}")?;
        }
        if self.protocol_errors > 0 {
            write!(f, ",malformed={}", self.protocol_errors)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireMessage;

    #[test]
    fn test_counters() {
        let stats = PuncherStats::new();
        stats.record_punch_sent(true);
        stats.record_punch_sent(false);
        stats.record_punch_sent(false);
        stats.record_punch_served(true);
        stats.record_coalesced();
        stats.record_in(WireMessage::Hb { nonce: 0 }.kind_index());
        stats.record_out(WireMessage::HbAck { nonce: 0 }.kind_index());
        stats.record_in(usize::MAX);

        let snap = stats.snapshot();
        assert_eq!(snap.punch_send_ok, 1);
        assert_eq!(snap.punch_send_fail, 2);
        assert_eq!(snap.punch_recv_ok, 1);
        assert_eq!(snap.coalesced, 1);
        assert_eq!(stats.messages_in("hb"), 1);
        assert_eq!(stats.messages_out("hb_ack"), 1);
        assert_eq!(stats.messages_in("nonexistent"), 0);
        assert_eq!(snap.messages, vec![("hb", 1, 0), ("hb_ack", 0, 1)]);
    }

    #[test]
    fn test_render() {
        let snap = StatsSnapshot {
            punch_send_ok: 3,
            punch_send_fail: 1,
            rendezvous: Some("10.0.0.1:9000".parse().unwrap()),
            last_ok_age: Some(Duration::from_secs(12)),
            sessions: 2,
            served: vec![ServedSummary {
                addr: "10.0.0.2:1".parse().unwrap(),
                ok: 4,
                bad: 0,
                age: Duration::from_secs(60),
            }],
            messages: vec![("punch_req", 5, 6)],
            ..Default::default()
        };
        assert_eq!(
            snap.to_string(),
            "ok=12,fail=-1,fc=0,punch:send=3/1:recv=0/0,rendezvous=10.0.0.1:9000,sessions=2,\
             coalesced=0,short=0,bindings=10.0.0.2:1->ok=4:bad=0:age=60,messages=punch_req:5/6"
        );
    }
}
