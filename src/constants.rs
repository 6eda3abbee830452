//! Protocol constants and tuning parameters.
//!
//! Values follow BEP-5 and BEP-44 where those documents fix them, and the
//! defaults of widely deployed DHT nodes otherwise.

use std::time::Duration;

// ============================================================================
// Kademlia parameters
// ============================================================================

/// Bucket size and replication factor (k value in Kademlia)
pub const K: usize = 20;

/// Maximum concurrent in-flight queries of one iterative lookup
pub const ALPHA: usize = 6;

/// Length of node ids and info hashes in bytes (SHA-1)
pub const ID_LEN: usize = 20;

/// Number of bits in the id space
pub const ID_BITS: usize = ID_LEN * 8;

// ============================================================================
// Timeouts and intervals
// ============================================================================

/// Time a single KRPC query may stay unanswered
pub const QUERY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Interval between token secret rotations. A token stays valid for one
/// to two intervals.
pub const SECRET_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Lifetime of an announced peer in the bounded peer store
pub const PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Lifetime of a BEP-44 item in the bounded value store
pub const VALUE_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

// ============================================================================
// Limits
// ============================================================================

/// Maximum encoded size of a BEP-44 `v` field
pub const MAX_VALUE_SIZE: usize = 1000;

/// Maximum BEP-44 salt length
pub const MAX_SALT_SIZE: usize = 64;

/// Maximum simultaneously pending transactions of one node
pub const MAX_PENDING_QUERIES: usize = 4096;

/// Maximum peer addresses returned in one `get_peers` response, keeps the
/// reply inside a single datagram
pub const MAX_VALUES_PER_RESPONSE: usize = 100;

/// Default capacity of the bounded BEP-44 value store
pub const DEFAULT_MAX_VALUES: usize = 1000;

/// Default number of info hashes tracked by the bounded peer store
pub const DEFAULT_MAX_INFO_HASHES: usize = 1000;

/// Default peers kept per info hash by the bounded peer store
pub const DEFAULT_MAX_PEERS_PER_HASH: usize = 1000;

/// Receive buffer size, the largest possible UDP payload
pub const MAX_DATAGRAM_SIZE: usize = 65535;

// ============================================================================
// Compact encodings
// ============================================================================

/// Compact IPv4 node info: id + address + port
pub const COMPACT_NODE_V4_LEN: usize = ID_LEN + 6;

/// Compact IPv6 node info: id + address + port
pub const COMPACT_NODE_V6_LEN: usize = ID_LEN + 18;

/// Compact IPv4 peer info: address + port
pub const COMPACT_PEER_V4_LEN: usize = 6;

/// Compact IPv6 peer info: address + port
pub const COMPACT_PEER_V6_LEN: usize = 18;

// ============================================================================
// Bootstrap
// ============================================================================

/// Well-known DHT bootstrap nodes
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
    "dht.libtorrent.org:25401",
];
