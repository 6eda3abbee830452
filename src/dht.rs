//! Distributed Hash Table (BEP-5, BEP-44)
//!
//! A Kademlia node speaking KRPC over UDP: routing table, write tokens,
//! transaction tracking, peer and item storage, and iterative lookups,
//! driven by a single task that owns all node state.

mod bep44;
mod config;
mod error;
mod lookup;
mod message;
mod node;
mod routing;
mod server;
mod storage;
mod token;
mod transaction;

pub use bep44::{
    immutable_target, mutable_target, signable, Ed25519Verifier, Item, Signer, Verifier,
    PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
pub use config::{DhtConfig, StorageLimits};
pub use error::{DhtError, ErrorCode, KrpcError};
pub use lookup::{Lookup, LookupMode, LookupOutcome, QueryRpc};
pub use message::{Body, KrpcMessage, Method, Query, Response, TransactionId};
pub use node::{
    compact_nodes, compact_peer, is_valid_port, parse_compact_nodes, parse_compact_peer, Contact,
    NodeId,
};
pub use routing::{Insertion, RoutingTable};
pub use server::{AnnounceOutcome, DhtEvent, DhtServer, LookupOptions, PutOutcome};
pub use storage::{
    BoundedPeerStore, BoundedValueStore, MemoryPeerStore, MemoryValueStore, PeerStore,
    StorageEngine, ValueStore,
};
pub use token::TokenAuthority;
pub use transaction::{ReplySender, TransactionManager};

#[cfg(test)]
mod tests;
