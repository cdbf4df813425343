//! Peer identity
//!
//! A [`Contact`] names a DHT participant: a 256-bit [`NodeId`], the transport
//! address it was last reachable on, and an optional protocol version tag.
//! Contacts are immutable values; equality and hashing use the node ID only,
//! so the same peer seen at two addresses is still the same peer.

use blake3::Hasher;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;
use std::str::FromStr;

/// 256-bit node identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Generate a random NodeId
    ///
    /// # Examples
    ///
    /// ```
    /// use dhtnat::NodeId;
    ///
    /// let id = NodeId::random();
    /// assert_eq!(id.as_bytes().len(), 32);
    /// ```
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Derive a deterministic NodeId from a transport address
    ///
    /// Used for peers known only by address (the raw-address `punch`
    /// overload). The same address always maps to the same ID.
    #[must_use]
    pub fn from_addr(addr: SocketAddr) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(b"dhtnat-addr-id");
        hasher.update(&crate::wire::encode_addr(addr));
        Self(*hasher.finalize().as_bytes())
    }

    /// Create NodeId from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the NodeId
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex form
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid node id hex: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("node id must be 32 bytes, got {}", v.len()))?;
        Ok(Self(bytes))
    }
}

/// A peer: identity plus last known reachable address
#[derive(Clone, Serialize, Deserialize)]
pub struct Contact {
    id: NodeId,
    addr: SocketAddr,
    version: Option<u8>,
}

impl Contact {
    /// Create a contact
    #[must_use]
    pub const fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            version: None,
        }
    }

    /// Contact for a peer known only by address
    #[must_use]
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(NodeId::from_addr(addr), addr)
    }

    /// Same contact with a protocol version tag
    #[must_use]
    pub const fn with_version(mut self, version: u8) -> Self {
        self.version = Some(version);
        self
    }

    /// Same identity at a different address
    #[must_use]
    pub fn with_addr(&self, addr: SocketAddr) -> Self {
        Self {
            id: self.id,
            addr,
            version: self.version,
        }
    }

    /// Node identifier
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// Transport address
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Protocol version tag, if known
    #[must_use]
    pub const fn version(&self) -> Option<u8> {
        self.version
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contact({}@{})", self.id, self.addr)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Parses `hex-id@ip:port`, or a bare `ip:port` (ID derived from the address)
impl FromStr for Contact {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((id, addr)) => {
                let id = id.parse::<NodeId>()?;
                let addr = addr
                    .parse::<SocketAddr>()
                    .map_err(|e| format!("invalid address '{addr}': {e}"))?;
                Ok(Self::new(id, addr))
            }
            None => s
                .parse::<SocketAddr>()
                .map(Self::from_addr)
                .map_err(|e| format!("invalid address '{s}': {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_contact_equality_is_by_id() {
        let id = NodeId::from_bytes([7u8; 32]);
        let a = Contact::new(id, addr(1000));
        let b = Contact::new(id, addr(2000)).with_version(3);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_from_addr_is_deterministic() {
        assert_eq!(NodeId::from_addr(addr(4000)), NodeId::from_addr(addr(4000)));
        assert_ne!(NodeId::from_addr(addr(4000)), NodeId::from_addr(addr(4001)));
    }

    #[test]
    fn test_with_addr_keeps_identity() {
        let c = Contact::new(NodeId::random(), addr(1)).with_version(2);
        let moved = c.with_addr(addr(2));
        assert_eq!(moved.id(), c.id());
        assert_eq!(moved.addr(), addr(2));
        assert_eq!(moved.version(), Some(2));
    }

    #[test]
    fn test_parse_contact() {
        let id = NodeId::from_bytes([0xab; 32]);
        let text = format!("{}@127.0.0.1:7000", id.to_hex());
        let c: Contact = text.parse().unwrap();
        assert_eq!(c.id(), &id);
        assert_eq!(c.addr(), "127.0.0.1:7000".parse().unwrap());

        let bare: Contact = "127.0.0.1:7001".parse().unwrap();
        assert_eq!(bare.id(), &NodeId::from_addr("127.0.0.1:7001".parse().unwrap()));

        assert!("zz@127.0.0.1:1".parse::<Contact>().is_err());
        assert!("abcd@127.0.0.1:1".parse::<Contact>().is_err());
        assert!("not-an-addr".parse::<Contact>().is_err());
    }

    #[test]
    fn test_display() {
        let id = NodeId::from_bytes([0x12; 32]);
        assert_eq!(id.to_string(), "1212121212121212");
        assert_eq!(format!("{id:?}"), "NodeId(1212121212121212)");
        let c = Contact::new(id, addr(9));
        assert_eq!(c.to_string(), "1212121212121212@10.0.0.1:9");
    }
}
