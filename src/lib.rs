//! rdht - A BitTorrent DHT node
//!
//! An implementation of the Kademlia distributed hash table used by
//! BitTorrent, following BEP-5 and BEP-44 (BitTorrent Enhancement
//! Proposals).
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 Distributed Hash Table with BEP-44 arbitrary data storage
//! - [`constants`] - Protocol constants and defaults

pub mod bencode;
pub mod constants;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    Contact, DhtConfig, DhtError, DhtEvent, DhtServer, Item, KrpcError, KrpcMessage, NodeId,
    RoutingTable,
};
