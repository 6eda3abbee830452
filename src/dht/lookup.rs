//! Iterative Kademlia lookup.
//!
//! A lookup keeps every contact it learns about in a distance-ordered
//! table and keeps at most `alpha` queries in flight. Each reply is merged
//! as soon as it arrives, then the `K` closest known contacts that have not
//! been asked yet are queried until the in-flight budget is full again. The
//! lookup ends when nothing is in flight and every one of the `K` closest
//! contacts has been asked, or, for value lookups, as soon as a verified
//! value arrives.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use super::bep44::{Item, Verifier};
use super::error::DhtError;
use super::message::{Query, Response};
use super::node::{Contact, NodeId};
use crate::constants::{ALPHA, ID_LEN, K};

/// What a lookup asks each node for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupMode {
    /// `find_node`: converge on the nodes closest to the target.
    FindNode,
    /// `get_peers`: collect peers and write tokens for an info hash.
    GetPeers,
    /// BEP-44 `get`: find the item stored under the target.
    Get,
}

/// Sends queries on behalf of a lookup.
pub trait QueryRpc: Send + Sync {
    fn our_id(&self) -> NodeId;

    fn query(
        &self,
        addr: SocketAddr,
        query: Query,
    ) -> BoxFuture<'static, Result<Response, DhtError>>;
}

/// Result of a completed lookup.
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub target: NodeId,
    /// Up to `K` closest responders. For `get_peers` and `get` only nodes
    /// that handed out a write token are included.
    pub closest: Vec<Contact>,
    /// Peers returned by `get_peers` responses, deduplicated.
    pub peers: Vec<SocketAddr>,
    /// First verified item, `get` lookups only.
    pub value: Option<Item>,
    /// Number of distinct addresses queried.
    pub queried: usize,
}

type Distance = [u8; ID_LEN];

type InFlight = FuturesUnordered<BoxFuture<'static, (SocketAddr, Result<Response, DhtError>)>>;

/// State of one lookup. Owned by the future running it, so merging a reply
/// and deciding whether to continue always happen together.
pub struct Lookup {
    target: NodeId,
    mode: LookupMode,
    stop_on_value: bool,
    alpha: usize,
    verifier: Arc<dyn Verifier>,
    seeds: VecDeque<SocketAddr>,
    table: BTreeMap<Distance, Contact>,
    tokenful: BTreeMap<Distance, Contact>,
    queried: HashSet<SocketAddr>,
    failed: HashSet<SocketAddr>,
    pending: usize,
    peers: Vec<SocketAddr>,
    seen_peers: HashSet<SocketAddr>,
    value: Option<Item>,
    rejected: usize,
}

impl Lookup {
    pub fn new(target: NodeId, mode: LookupMode, verifier: Arc<dyn Verifier>) -> Self {
        Self {
            target,
            mode,
            stop_on_value: mode == LookupMode::Get,
            alpha: ALPHA,
            verifier,
            seeds: VecDeque::new(),
            table: BTreeMap::new(),
            tokenful: BTreeMap::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
            pending: 0,
            peers: Vec::new(),
            seen_peers: HashSet::new(),
            value: None,
            rejected: 0,
        }
    }

    pub fn alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha.max(1);
        self
    }

    /// Whether a verified value ends a `get` lookup. Turned off when the
    /// lookup only gathers tokens ahead of a `put`.
    pub fn stop_on_value(mut self, stop: bool) -> Self {
        self.stop_on_value = stop;
        self
    }

    /// Known contacts to start from, typically the closest ones in the
    /// routing table.
    pub fn seed_contacts(mut self, contacts: impl IntoIterator<Item = Contact>) -> Self {
        for contact in contacts {
            self.table
                .entry(self.target.distance(&contact.id))
                .or_insert(contact);
        }
        self
    }

    /// Addresses to query first, ids unknown. Every seed is asked before
    /// any contact from the candidate table.
    pub fn seed_addrs(mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.seeds.extend(addrs);
        self
    }

    fn query(&self) -> Query {
        match self.mode {
            LookupMode::FindNode => Query::FindNode {
                target: self.target,
            },
            LookupMode::GetPeers => Query::GetPeers {
                info_hash: self.target,
            },
            LookupMode::Get => Query::Get {
                target: self.target,
                seq: None,
            },
        }
    }

    pub async fn run<R: QueryRpc + ?Sized>(mut self, rpc: &R) -> Result<LookupOutcome, DhtError> {
        let our_id = rpc.our_id();
        let mut in_flight = InFlight::new();

        self.refill(rpc, &mut in_flight);

        while let Some((addr, result)) = in_flight.next().await {
            self.pending -= 1;

            match result {
                Ok(response) => {
                    if self.absorb(addr, response, &our_id) {
                        trace!(
                            "Lookup for {} found value, {} queries abandoned",
                            self.target,
                            self.pending
                        );
                        break;
                    }
                }
                Err(DhtError::Destroyed) => return Err(DhtError::Destroyed),
                Err(e) => {
                    trace!("Lookup query to {} failed: {}", addr, e);
                    // Unresponsive nodes give up their place among the K closest.
                    self.table.retain(|_, c| c.addr != addr);
                    self.failed.insert(addr);
                }
            }

            self.refill(rpc, &mut in_flight);
        }

        self.finish()
    }

    fn dispatch<R: QueryRpc + ?Sized>(&mut self, addr: SocketAddr, rpc: &R, in_flight: &mut InFlight) {
        self.queried.insert(addr);
        self.pending += 1;
        let reply = rpc.query(addr, self.query());
        in_flight.push(Box::pin(async move { (addr, reply.await) }));
    }

    /// Queries pending seeds, then unasked contacts among the `K` closest,
    /// until `alpha` queries are in flight or no candidate is left.
    fn refill<R: QueryRpc + ?Sized>(&mut self, rpc: &R, in_flight: &mut InFlight) {
        while self.pending < self.alpha {
            let next = self.next_seed().or_else(|| {
                self.table
                    .values()
                    .take(K)
                    .find(|c| !self.queried.contains(&c.addr))
                    .map(|c| c.addr)
            });

            match next {
                Some(addr) => self.dispatch(addr, rpc, in_flight),
                None => break,
            }
        }
    }

    fn next_seed(&mut self) -> Option<SocketAddr> {
        while let Some(addr) = self.seeds.pop_front() {
            if !self.queried.contains(&addr) {
                return Some(addr);
            }
        }
        None
    }

    /// Merges a response into the lookup state. Returns true when the
    /// lookup is complete because a verified value arrived.
    fn absorb(&mut self, addr: SocketAddr, response: Response, our_id: &NodeId) -> bool {
        if response.id == *our_id {
            return false;
        }

        let value_wanted = self.mode == LookupMode::Get && self.stop_on_value;
        let mut found = None;
        if value_wanted {
            if let Some(item) = response.item {
                if !item.verify_for(&self.target, self.verifier.as_ref()) {
                    debug!(
                        "Discarding response from {}: value fails verification for {}",
                        addr, self.target
                    );
                    self.rejected += 1;
                    return false;
                }
                found = Some(item);
            }
        }

        let distance = self.target.distance(&response.id);
        let mut contact = Contact::new(response.id, addr).with_token(response.token);
        contact.value = found.clone();

        if contact.token.is_some() {
            self.tokenful.insert(distance, contact.clone());
        }
        self.table.insert(distance, contact);

        for node in response.nodes.into_iter().flatten() {
            if node.id == *our_id || self.failed.contains(&node.addr) {
                continue;
            }
            self.table
                .entry(self.target.distance(&node.id))
                .or_insert(node);
        }

        for peer in response.values.into_iter().flatten() {
            if self.seen_peers.insert(peer) {
                self.peers.push(peer);
            }
        }

        if found.is_some() {
            self.value = found;
            return true;
        }
        false
    }

    fn finish(self) -> Result<LookupOutcome, DhtError> {
        if self.mode == LookupMode::Get && self.stop_on_value && self.value.is_none() {
            if self.rejected > 0 {
                return Err(DhtError::Verification(format!(
                    "{} value(s) for {} failed verification",
                    self.rejected, self.target
                )));
            }
            return Err(DhtError::NotFound);
        }

        let pool = match self.mode {
            LookupMode::FindNode => &self.table,
            LookupMode::GetPeers | LookupMode::Get => &self.tokenful,
        };
        let closest = pool.values().take(K).cloned().collect();

        Ok(LookupOutcome {
            target: self.target,
            closest,
            peers: self.peers,
            value: self.value,
            queried: self.queried.len(),
        })
    }
}
