use super::bep44::Item;
use super::error::DhtError;
use crate::constants::{
    COMPACT_NODE_V4_LEN, COMPACT_NODE_V6_LEN, COMPACT_PEER_V4_LEN, COMPACT_PEER_V6_LEN, ID_BITS,
    ID_LEN,
};
use bytes::Bytes;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

/// A 160-bit node id or info hash, compared under the XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub const MIN: NodeId = NodeId([0u8; ID_LEN]);

    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; ID_LEN] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        if s.len() != ID_LEN * 2 || !s.is_ascii() {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; ID_LEN];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DhtError::InvalidNodeId)?;
        }
        Ok(Self(id))
    }

    /// SHA-1 over the concatenation of `parts`.
    pub fn sha1(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Orders `a` and `b` by XOR distance to `self`, smaller raw id first on
    /// equal distance.
    pub fn cmp_distance(&self, a: &NodeId, b: &NodeId) -> Ordering {
        self.distance(a)
            .cmp(&self.distance(b))
            .then_with(|| a.0.cmp(&b.0))
    }

    /// Value of bit `index`, counted from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_BITS);
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Copy of this id with bit `index` set.
    pub fn with_bit(mut self, index: usize) -> Self {
        self.0[index / 8] |= 0x80 >> (index % 8);
        self
    }

    /// Whether the first `len` bits of `self` and `other` agree.
    pub fn shares_prefix(&self, other: &NodeId, len: usize) -> bool {
        let full = len / 8;
        if self.0[..full] != other.0[..full] {
            return false;
        }
        let rem = len % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        self.0[full] & mask == other.0[full] & mask
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(id: [u8; ID_LEN]) -> Self {
        Self(id)
    }
}

/// Whether `port` may be used as a datagram destination.
pub fn is_valid_port(port: u16) -> bool {
    (1..=65534).contains(&port)
}

/// A known DHT node.
///
/// Contacts returned by lookups additionally carry the write token the node
/// handed out and, for value lookups, the item it answered with.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub token: Option<Bytes>,
    pub value: Option<Item>,
    pub last_seen: Instant,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            token: None,
            value: None,
            last_seen: Instant::now(),
        }
    }

    pub fn with_token(mut self, token: Option<Bytes>) -> Self {
        self.token = token;
        self
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Parses one compact node info record, 26 bytes for IPv4 or 38 for IPv6.
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_V4_LEN && data.len() != COMPACT_NODE_V6_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..ID_LEN]).ok()?;
        let addr = parse_compact_peer(&data[ID_LEN..])?;
        Some(Self::new(id, addr))
    }

    /// Compact node info for this contact, sized by address family.
    pub fn to_compact(&self) -> Vec<u8> {
        let mut compact = Vec::with_capacity(COMPACT_NODE_V6_LEN);
        compact.extend_from_slice(&self.id.0);
        compact.extend_from_slice(&compact_peer(&self.addr));
        compact
    }
}

/// Splits a `nodes`/`nodes6` blob into contacts, skipping records with an
/// unusable port.
pub fn parse_compact_nodes(data: &[u8], record_len: usize) -> Vec<Contact> {
    data.chunks_exact(record_len)
        .filter_map(Contact::from_compact)
        .filter(|c| is_valid_port(c.addr.port()))
        .collect()
}

/// Concatenated compact node info, IPv4 contacts into the first buffer and
/// IPv6 contacts into the second.
pub fn compact_nodes(contacts: &[Contact]) -> (Vec<u8>, Vec<u8>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for contact in contacts {
        match contact.addr {
            SocketAddr::V4(_) => v4.extend_from_slice(&contact.to_compact()),
            SocketAddr::V6(_) => v6.extend_from_slice(&contact.to_compact()),
        }
    }
    (v4, v6)
}

pub fn compact_peer(addr: &SocketAddr) -> Vec<u8> {
    let mut data = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    data.extend_from_slice(&addr.port().to_be_bytes());
    data
}

pub fn parse_compact_peer(data: &[u8]) -> Option<SocketAddr> {
    let ip = match data.len() {
        COMPACT_PEER_V4_LEN => IpAddr::V4(Ipv4Addr::new(data[0], data[1], data[2], data[3])),
        COMPACT_PEER_V6_LEN => {
            let octets: [u8; 16] = data[..16].try_into().ok()?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([data[data.len() - 2], data[data.len() - 1]]);
    Some(SocketAddr::new(ip, port))
}
