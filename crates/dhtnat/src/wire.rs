//! Wire dictionaries exchanged between punchers.
//!
//! Every message is a JSON object tagged by `"t"`. The punch, heartbeat and
//! bind shapes are the interoperability contract between independent peers;
//! field names must not change. Addresses travel as bytes: 4 or 16 address
//! octets followed by a big-endian port.

use crate::error::{PuncherError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Application dictionary carried alongside punch and relay messages
pub type ClientData = serde_json::Map<String, Value>;

/// Puncher protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum WireMessage {
    /// Originator asks a rendezvous to coordinate a punch toward a target
    PunchReq {
        /// Why the punch is wanted
        reason: String,
        /// Target's last known address
        target_addr: Vec<u8>,
        /// Session nonce, echoed by every related message
        nonce: u64,
        /// Sender's wall clock, milliseconds
        ts_ms: u64,
        /// Advisory application data
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_data: Option<ClientData>,
    },

    /// Rendezvous reports the outcome of forwarding a punch
    PunchResp {
        /// Echoed nonce
        nonce: u64,
        /// Whether the target accepted
        ok: bool,
        /// Target's address as observed by the rendezvous (empty if unknown)
        ext_addr: Vec<u8>,
        /// Rendezvous to target round trip
        rtt_ms: u32,
        /// Failure description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
        /// Target's reply data
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_data: Option<ClientData>,
    },

    /// Keep-alive from a bound client
    Hb {
        /// Echoed by the ack
        nonce: u64,
    },

    /// Keep-alive acknowledgement
    HbAck {
        /// Echoed nonce
        nonce: u64,
    },

    /// Client asks to be bound
    BindReq {
        /// Echoed by the ack
        nonce: u64,
        /// Requester's own view of its address (empty if unknown)
        ext_addr: Vec<u8>,
    },

    /// Binding decision
    BindAck {
        /// Echoed nonce
        nonce: u64,
        /// Requester's address as observed by the rendezvous
        ext_addr: Vec<u8>,
        /// Whether the binding was accepted
        ok: bool,
    },

    /// Rendezvous forwards a punch or relayed message to its bound client
    ConnectReq {
        /// Originator's session nonce
        nonce: u64,
        /// Originator's reason
        reason: String,
        /// Originator's address as observed by the rendezvous
        origin_addr: Vec<u8>,
        /// True for a punch, false for a relayed message
        tunnel: bool,
        /// Originator's data
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_data: Option<ClientData>,
    },

    /// Target's answer to a forwarded connect
    ConnectResp {
        /// Echoed nonce
        nonce: u64,
        /// Whether the target accepted
        ok: bool,
        /// Target's reply data
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_data: Option<ClientData>,
    },

    /// Direct hole-punch datagram
    Probe {
        /// Session nonce
        nonce: u64,
    },

    /// Reply to a probe
    ProbeAck {
        /// Echoed nonce
        nonce: u64,
    },

    /// Ask a peer for our externally observed address
    QueryReq {
        /// Echoed by the reply
        nonce: u64,
    },

    /// Observed address reply
    QueryResp {
        /// Echoed nonce
        nonce: u64,
        /// Requester's address as observed by the responder
        ext_addr: Vec<u8>,
    },

    /// Rendezvous is shutting down
    CloseReq {
        /// Echoed by the ack
        nonce: u64,
    },

    /// Close acknowledgement
    CloseAck {
        /// Echoed nonce
        nonce: u64,
    },

    /// Relay an application dictionary to a client of the recipient
    RelayReq {
        /// Echoed by the reply
        nonce: u64,
        /// Target's address
        target_addr: Vec<u8>,
        /// Application dictionary
        payload: ClientData,
    },

    /// Relay result
    RelayResp {
        /// Echoed nonce
        nonce: u64,
        /// Whether the target answered
        ok: bool,
        /// Target's reply
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<ClientData>,
        /// Failure description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },
}

/// Number of distinct message kinds
pub const MESSAGE_KINDS: usize = 18;

/// Every message kind, in [`WireMessage::kind_index`] order
pub const MESSAGE_TYPES: [&str; MESSAGE_KINDS] = [
    "punch_req",
    "punch_resp",
    "hb",
    "hb_ack",
    "bind_req",
    "bind_ack",
    "connect_req",
    "connect_resp",
    "probe",
    "probe_ack",
    "query_req",
    "query_resp",
    "close_req",
    "close_ack",
    "relay_req",
    "relay_resp",
    "unknown",
    "malformed",
];

impl WireMessage {
    /// Serialize to a JSON payload
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(PuncherError::from)
    }

    /// Deserialize from a JSON payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(PuncherError::from)
    }

    /// Get the message type tag
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        MESSAGE_TYPES[self.kind_index()]
    }

    /// Stable index used by per-kind counters
    #[must_use]
    pub fn kind_index(&self) -> usize {
        match self {
            WireMessage::PunchReq { .. } => 0,
            WireMessage::PunchResp { .. } => 1,
            WireMessage::Hb { .. } => 2,
            WireMessage::HbAck { .. } => 3,
            WireMessage::BindReq { .. } => 4,
            WireMessage::BindAck { .. } => 5,
            WireMessage::ConnectReq { .. } => 6,
            WireMessage::ConnectResp { .. } => 7,
            WireMessage::Probe { .. } => 8,
            WireMessage::ProbeAck { .. } => 9,
            WireMessage::QueryReq { .. } => 10,
            WireMessage::QueryResp { .. } => 11,
            WireMessage::CloseReq { .. } => 12,
            WireMessage::CloseAck { .. } => 13,
            WireMessage::RelayReq { .. } => 14,
            WireMessage::RelayResp { .. } => 15,
        }
    }

    /// Nonce carried by the message
    #[must_use]
    pub fn nonce(&self) -> u64 {
        match self {
            WireMessage::PunchReq { nonce, .. }
            | WireMessage::PunchResp { nonce, .. }
            | WireMessage::Hb { nonce }
            | WireMessage::HbAck { nonce }
            | WireMessage::BindReq { nonce, .. }
            | WireMessage::BindAck { nonce, .. }
            | WireMessage::ConnectReq { nonce, .. }
            | WireMessage::ConnectResp { nonce, .. }
            | WireMessage::Probe { nonce }
            | WireMessage::ProbeAck { nonce }
            | WireMessage::QueryReq { nonce }
            | WireMessage::QueryResp { nonce, .. }
            | WireMessage::CloseReq { nonce }
            | WireMessage::CloseAck { nonce }
            | WireMessage::RelayReq { nonce, .. }
            | WireMessage::RelayResp { nonce, .. } => *nonce,
        }
    }
}

/// Index of the "unknown" counter (well-formed JSON, unrecognised tag)
pub const UNKNOWN_KIND: usize = 16;
/// Index of the "malformed" counter
pub const MALFORMED_KIND: usize = 17;

/// Encode an address as address octets followed by a big-endian port
#[must_use]
pub fn encode_addr(addr: SocketAddr) -> Vec<u8> {
    let mut out = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Decode an address written by [`encode_addr`]
pub fn decode_addr(bytes: &[u8]) -> Result<SocketAddr> {
    let (ip, port): (IpAddr, &[u8]) = match bytes.len() {
        6 => {
            let octets: [u8; 4] = bytes[..4]
                .try_into()
                .map_err(|_| PuncherError::protocol("bad IPv4 address"))?;
            (Ipv4Addr::from(octets).into(), &bytes[4..])
        }
        18 => {
            let octets: [u8; 16] = bytes[..16]
                .try_into()
                .map_err(|_| PuncherError::protocol("bad IPv6 address"))?;
            (Ipv6Addr::from(octets).into(), &bytes[16..])
        }
        n => {
            return Err(PuncherError::Protocol(Cow::Owned(format!(
                "address must be 6 or 18 bytes, got {n}"
            ))));
        }
    };
    Ok(SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]])))
}

/// Decode an optional address; empty means "not known"
pub fn decode_opt_addr(bytes: &[u8]) -> Result<Option<SocketAddr>> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        decode_addr(bytes).map(Some)
    }
}

/// Wall clock milliseconds for `ts_ms`
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Fresh random nonce
#[must_use]
pub fn new_nonce() -> u64 {
    rand::random()
}
