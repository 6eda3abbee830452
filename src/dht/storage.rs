use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::IndexedRandom as _;
use tracing::debug;

use super::bep44::{signable, Item, Verifier, PUBLIC_KEY_LEN};
use super::config::StorageLimits;
use super::error::{ErrorCode, KrpcError};
use super::node::NodeId;
use crate::constants::{MAX_SALT_SIZE, MAX_VALUES_PER_RESPONSE, MAX_VALUE_SIZE};

/// Backend holding BEP-44 items by target.
pub trait ValueStore: Send + Sync {
    fn get(&mut self, key: &NodeId) -> Option<Item>;
    fn insert(&mut self, key: NodeId, item: Item);
    fn remove(&mut self, key: &NodeId) -> Option<Item>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backend holding announced peers by info hash.
pub trait PeerStore: Send + Sync {
    /// Records `peer` for `info_hash`. Returns true on first insertion of
    /// that address.
    fn add(&mut self, info_hash: NodeId, peer: SocketAddr) -> bool;
    fn remove(&mut self, info_hash: &NodeId, peer: &SocketAddr) -> bool;
    /// Up to `max` peers known for `info_hash`.
    fn peers(&mut self, info_hash: &NodeId, max: usize) -> Vec<SocketAddr>;
}

/// Keeps every item forever.
#[derive(Default)]
pub struct MemoryValueStore {
    items: HashMap<NodeId, Item>,
}

impl ValueStore for MemoryValueStore {
    fn get(&mut self, key: &NodeId) -> Option<Item> {
        self.items.get(key).cloned()
    }

    fn insert(&mut self, key: NodeId, item: Item) {
        self.items.insert(key, item);
    }

    fn remove(&mut self, key: &NodeId) -> Option<Item> {
        self.items.remove(key)
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Default)]
struct PeerList {
    seen: HashSet<SocketAddr>,
    order: Vec<SocketAddr>,
}

/// Keeps every announced peer in announce order until removed.
#[derive(Default)]
pub struct MemoryPeerStore {
    peers: HashMap<NodeId, PeerList>,
}

impl PeerStore for MemoryPeerStore {
    fn add(&mut self, info_hash: NodeId, peer: SocketAddr) -> bool {
        let list = self.peers.entry(info_hash).or_default();
        if !list.seen.insert(peer) {
            return false;
        }
        list.order.push(peer);
        true
    }

    fn remove(&mut self, info_hash: &NodeId, peer: &SocketAddr) -> bool {
        let Some(list) = self.peers.get_mut(info_hash) else {
            return false;
        };
        if !list.seen.remove(peer) {
            return false;
        }
        list.order.retain(|p| p != peer);
        if list.order.is_empty() {
            self.peers.remove(info_hash);
        }
        true
    }

    fn peers(&mut self, info_hash: &NodeId, max: usize) -> Vec<SocketAddr> {
        self.peers
            .get(info_hash)
            .map(|list| list.order.iter().take(max).copied().collect())
            .unwrap_or_default()
    }
}

/// Item store with a capacity bound and lazy expiry. When full, expired
/// items are purged first, then the oldest write is evicted.
pub struct BoundedValueStore {
    capacity: usize,
    max_age: Duration,
    items: HashMap<NodeId, (Item, Instant)>,
}

impl BoundedValueStore {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age,
            items: HashMap::new(),
        }
    }
}

impl ValueStore for BoundedValueStore {
    fn get(&mut self, key: &NodeId) -> Option<Item> {
        let (item, stored_at) = self.items.get(key)?;
        if stored_at.elapsed() < self.max_age {
            return Some(item.clone());
        }
        self.items.remove(key);
        None
    }

    fn insert(&mut self, key: NodeId, item: Item) {
        if !self.items.contains_key(&key) && self.items.len() >= self.capacity {
            let max_age = self.max_age;
            self.items.retain(|_, (_, at)| at.elapsed() < max_age);

            if self.items.len() >= self.capacity {
                let oldest = self
                    .items
                    .iter()
                    .min_by_key(|(_, (_, at))| *at)
                    .map(|(k, _)| *k);
                if let Some(oldest) = oldest {
                    debug!("Value store full, evicting {}", oldest);
                    self.items.remove(&oldest);
                }
            }
        }
        self.items.insert(key, (item, Instant::now()));
    }

    fn remove(&mut self, key: &NodeId) -> Option<Item> {
        self.items.remove(key).map(|(item, _)| item)
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// Peer store bounded both in info hashes and peers per hash. Announces
/// expire after `lifetime`; reads return a random sample so every stored
/// peer gets handed out eventually.
pub struct BoundedPeerStore {
    max_info_hashes: usize,
    max_peers_per_hash: usize,
    lifetime: Duration,
    peers: HashMap<NodeId, Vec<AnnouncedPeer>>,
}

impl BoundedPeerStore {
    pub fn new(max_info_hashes: usize, max_peers_per_hash: usize, lifetime: Duration) -> Self {
        Self {
            max_info_hashes: max_info_hashes.max(1),
            max_peers_per_hash: max_peers_per_hash.max(1),
            lifetime,
            peers: HashMap::new(),
        }
    }

    fn make_room_for_hash(&mut self) {
        let lifetime = self.lifetime;
        self.peers.retain(|_, list| {
            list.retain(|p| p.announced_at.elapsed() < lifetime);
            !list.is_empty()
        });

        if self.peers.len() < self.max_info_hashes {
            return;
        }

        let stalest = self
            .peers
            .iter()
            .min_by_key(|(_, list)| list.iter().map(|p| p.announced_at).max())
            .map(|(hash, _)| *hash);
        if let Some(hash) = stalest {
            debug!("Peer store full, dropping info hash {}", hash);
            self.peers.remove(&hash);
        }
    }
}

impl PeerStore for BoundedPeerStore {
    fn add(&mut self, info_hash: NodeId, peer: SocketAddr) -> bool {
        if !self.peers.contains_key(&info_hash) && self.peers.len() >= self.max_info_hashes {
            self.make_room_for_hash();
        }

        let now = Instant::now();
        let lifetime = self.lifetime;
        let list = self.peers.entry(info_hash).or_default();
        list.retain(|p| now.duration_since(p.announced_at) < lifetime);

        if let Some(existing) = list.iter_mut().find(|p| p.addr == peer) {
            existing.announced_at = now;
            return false;
        }

        if list.len() >= self.max_peers_per_hash {
            if let Some(oldest) = list
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.announced_at)
                .map(|(i, _)| i)
            {
                list.swap_remove(oldest);
            }
        }

        list.push(AnnouncedPeer {
            addr: peer,
            announced_at: now,
        });
        true
    }

    fn remove(&mut self, info_hash: &NodeId, peer: &SocketAddr) -> bool {
        let Some(list) = self.peers.get_mut(info_hash) else {
            return false;
        };
        let before = list.len();
        list.retain(|p| &p.addr != peer);
        let removed = list.len() != before;
        if list.is_empty() {
            self.peers.remove(info_hash);
        }
        removed
    }

    fn peers(&mut self, info_hash: &NodeId, max: usize) -> Vec<SocketAddr> {
        let Some(list) = self.peers.get_mut(info_hash) else {
            return Vec::new();
        };
        let lifetime = self.lifetime;
        list.retain(|p| p.announced_at.elapsed() < lifetime);

        list.choose_multiple(&mut rand::rng(), max)
            .map(|p| p.addr)
            .collect()
    }
}

/// BEP-44 item store and BEP-5 peer store of a node, with the validation
/// every incoming `put` goes through.
pub struct StorageEngine {
    values: Box<dyn ValueStore>,
    peers: Box<dyn PeerStore>,
    verifier: Arc<dyn Verifier>,
}

impl StorageEngine {
    pub fn new(
        values: Box<dyn ValueStore>,
        peers: Box<dyn PeerStore>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            values,
            peers,
            verifier,
        }
    }

    pub fn with_limits(limits: &StorageLimits, verifier: Arc<dyn Verifier>) -> Self {
        match *limits {
            StorageLimits::Unbounded => Self::new(
                Box::<MemoryValueStore>::default(),
                Box::<MemoryPeerStore>::default(),
                verifier,
            ),
            StorageLimits::Bounded {
                max_values,
                max_info_hashes,
                max_peers_per_hash,
                value_lifetime,
                peer_lifetime,
            } => Self::new(
                Box::new(BoundedValueStore::new(max_values, value_lifetime)),
                Box::new(BoundedPeerStore::new(
                    max_info_hashes,
                    max_peers_per_hash,
                    peer_lifetime,
                )),
                verifier,
            ),
        }
    }

    pub fn verifier(&self) -> &Arc<dyn Verifier> {
        &self.verifier
    }

    /// Validates and stores `item`, returning the key it was stored under.
    ///
    /// Checks run in a fixed order and the first failure is reported: size,
    /// key and signature, CAS and sequence against the stored item, salt
    /// length.
    pub fn put(&mut self, item: &Item) -> Result<NodeId, KrpcError> {
        if item.v.encoded_len() > MAX_VALUE_SIZE {
            return Err(KrpcError::new(
                ErrorCode::MessageTooBig,
                "v field too big",
            ));
        }

        let Some(k) = &item.k else {
            let key = item.target();
            self.values.insert(key, item.stored());
            return Ok(key);
        };

        if k.len() != PUBLIC_KEY_LEN {
            return Err(KrpcError::protocol("invalid k"));
        }
        let seq = item
            .seq
            .ok_or_else(|| KrpcError::protocol("missing seq"))?;

        let signature_ok = item.sig.as_ref().is_some_and(|sig| {
            let message = signable(seq, item.salt.as_deref(), &item.v);
            self.verifier.verify(sig, &message, k)
        });
        if !signature_ok {
            return Err(KrpcError::new(
                ErrorCode::InvalidSignature,
                "invalid signature",
            ));
        }

        let key = item.target();
        if let Some(prior_seq) = self.values.get(&key).and_then(|prior| prior.seq) {
            if item.cas.is_some_and(|cas| cas != prior_seq) {
                return Err(KrpcError::new(ErrorCode::CasMismatch, "CAS mismatch"));
            }
            if seq <= prior_seq {
                return Err(KrpcError::new(
                    ErrorCode::SequenceTooOld,
                    "sequence number less than current",
                ));
            }
        }

        if item.salt.as_ref().is_some_and(|s| s.len() > MAX_SALT_SIZE) {
            return Err(KrpcError::new(ErrorCode::SaltTooBig, "salt too big"));
        }

        self.values.insert(key, item.stored());
        Ok(key)
    }

    pub fn get(&mut self, key: &NodeId) -> Option<Item> {
        self.values.get(key)
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn add_peer(&mut self, info_hash: NodeId, peer: SocketAddr) -> bool {
        self.peers.add(info_hash, peer)
    }

    pub fn remove_peer(&mut self, info_hash: &NodeId, peer: &SocketAddr) -> bool {
        self.peers.remove(info_hash, peer)
    }

    /// Peers for `info_hash`, at most as many as fit in one response.
    pub fn peers(&mut self, info_hash: &NodeId) -> Vec<SocketAddr> {
        self.peers.peers(info_hash, MAX_VALUES_PER_RESPONSE)
    }
}
