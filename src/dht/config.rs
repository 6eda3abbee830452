use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::node::NodeId;
use crate::constants::{
    ALPHA, BOOTSTRAP_NODES, DEFAULT_MAX_INFO_HASHES, DEFAULT_MAX_PEERS_PER_HASH,
    DEFAULT_MAX_VALUES, MAX_PENDING_QUERIES, PEER_ANNOUNCE_LIFETIME, QUERY_TIMEOUT,
    SECRET_ROTATION_INTERVAL, VALUE_LIFETIME,
};

/// Which storage backend a node uses for BEP-44 items and announced peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLimits {
    /// Never evict. Memory grows with every distinct put and announce.
    Unbounded,
    Bounded {
        max_values: usize,
        max_info_hashes: usize,
        max_peers_per_hash: usize,
        value_lifetime: Duration,
        peer_lifetime: Duration,
    },
}

impl Default for StorageLimits {
    fn default() -> Self {
        StorageLimits::Bounded {
            max_values: DEFAULT_MAX_VALUES,
            max_info_hashes: DEFAULT_MAX_INFO_HASHES,
            max_peers_per_hash: DEFAULT_MAX_PEERS_PER_HASH,
            value_lifetime: VALUE_LIFETIME,
            peer_lifetime: PEER_ANNOUNCE_LIFETIME,
        }
    }
}

/// Settings for a [`DhtServer`](super::DhtServer).
///
/// ```
/// use rdht::dht::DhtConfig;
///
/// let config = DhtConfig {
///     bootstrap: false,
///     ..DhtConfig::default()
/// };
/// assert_eq!(config.alpha, 6);
/// ```
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Local address to bind the UDP socket to. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Fixed node id; a random one is generated when `None`.
    pub node_id: Option<NodeId>,
    /// `host:port` entries resolved and contacted by `bootstrap()`.
    pub bootstrap_nodes: Vec<String>,
    /// Whether `bind` bootstraps immediately in the background.
    pub bootstrap: bool,
    pub query_timeout: Duration,
    pub secret_rotation: Duration,
    /// Concurrent in-flight queries per lookup.
    pub alpha: usize,
    pub max_pending_queries: usize,
    pub storage: StorageLimits,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            node_id: None,
            bootstrap_nodes: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            bootstrap: true,
            query_timeout: QUERY_TIMEOUT,
            secret_rotation: SECRET_ROTATION_INTERVAL,
            alpha: ALPHA,
            max_pending_queries: MAX_PENDING_QUERIES,
            storage: StorageLimits::default(),
        }
    }
}

impl DhtConfig {
    /// Config for a node that binds `addr` and does not contact the public
    /// bootstrap routers.
    pub fn local(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            bootstrap_nodes: Vec::new(),
            bootstrap: false,
            ..Self::default()
        }
    }
}
