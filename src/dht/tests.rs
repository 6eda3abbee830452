use super::*;
use crate::bencode::Value;
use crate::constants::{ALPHA, K};
use bytes::Bytes;
use ed25519_dalek::SigningKey;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
}

fn id_with_first_byte(b: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = b;
    NodeId(bytes)
}

fn storage() -> StorageEngine {
    StorageEngine::with_limits(&StorageLimits::Unbounded, Arc::new(Ed25519Verifier))
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

// ---------------------------------------------------------------------------
// Node ids
// ---------------------------------------------------------------------------

#[test]
fn test_node_id_generate() {
    let id1 = NodeId::generate();
    let id2 = NodeId::generate();
    assert_ne!(id1, id2);
}

#[test]
fn test_node_id_from_bytes_invalid() {
    assert!(NodeId::from_bytes(&[1u8; 10]).is_err());
    assert_eq!(NodeId::from_bytes(&[1u8; 20]).unwrap(), NodeId([1u8; 20]));
}

#[test]
fn test_node_id_distance() {
    let a = NodeId::generate();
    let b = NodeId::generate();

    assert_eq!(a.distance(&b), b.distance(&a));
    assert_eq!(a.distance(&a), [0u8; 20]);
    assert_eq!(NodeId([0u8; 20]).distance(&NodeId([0xFF; 20])), [0xFF; 20]);
}

#[test]
fn test_node_id_cmp_distance_tie_break() {
    let target = NodeId([0u8; 20]);
    let near = id_with_first_byte(0x01);
    let far = id_with_first_byte(0x80);

    assert_eq!(target.cmp_distance(&near, &far), std::cmp::Ordering::Less);
    assert_eq!(target.cmp_distance(&far, &far), std::cmp::Ordering::Equal);
}

#[test]
fn test_node_id_hex() {
    let id = NodeId::from_hex("4a533d47ec9c7d95b1ad75f576cffc641853b750").unwrap();
    assert_eq!(id.to_string(), "4a533d47ec9c7d95b1ad75f576cffc641853b750");
    assert!(NodeId::from_hex("4a53").is_err());
}

#[test]
fn test_contact_compact_v4() {
    let contact = Contact::new(NodeId([1u8; 20]), addr(1, 6881));
    let compact = contact.to_compact();
    assert_eq!(compact.len(), 26);

    let parsed = Contact::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, contact.id);
    assert_eq!(parsed.addr, contact.addr);
}

#[test]
fn test_contact_compact_v6() {
    let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 6881);
    let contact = Contact::new(NodeId([2u8; 20]), v6);
    let compact = contact.to_compact();
    assert_eq!(compact.len(), 38);
    assert_eq!(Contact::from_compact(&compact).unwrap().addr, v6);
}

#[test]
fn test_parse_compact_nodes_skips_invalid_ports() {
    let good = Contact::new(NodeId([1u8; 20]), addr(1, 6881));
    let zero = Contact::new(NodeId([2u8; 20]), addr(2, 0));
    let max = Contact::new(NodeId([3u8; 20]), addr(3, 65535));

    let (v4, v6) = compact_nodes(&[good, zero, max]);
    assert!(v6.is_empty());

    let parsed = parse_compact_nodes(&v4, 26);
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].addr, addr(1, 6881));
}

#[test]
fn test_compact_peer() {
    let peer = addr(9, 51413);
    let compact = compact_peer(&peer);
    assert_eq!(compact, vec![10, 0, 0, 9, 0xC8, 0xD5]);
    assert_eq!(parse_compact_peer(&compact), Some(peer));
    assert_eq!(parse_compact_peer(&compact[..5]), None);
}

// ---------------------------------------------------------------------------
// Routing table
// ---------------------------------------------------------------------------

#[test]
fn test_routing_table_add() {
    let mut table = RoutingTable::new(NodeId::generate());
    let id = NodeId::generate();

    assert_eq!(table.add(Contact::new(id, addr(1, 6881))), Insertion::Added);
    assert_eq!(table.add(Contact::new(id, addr(1, 6881))), Insertion::Unchanged);
    assert_eq!(table.add(Contact::new(id, addr(2, 6881))), Insertion::Updated);

    assert_eq!(table.len(), 1);
    assert_eq!(table.get(&id).unwrap().addr, addr(2, 6881));
}

#[test]
fn test_routing_table_rejects_self() {
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id);
    table.set_local_addr(addr(1, 6881));

    assert_eq!(table.add(Contact::new(our_id, addr(2, 6881))), Insertion::Rejected);
    assert_eq!(
        table.add(Contact::new(NodeId::generate(), addr(1, 6881))),
        Insertion::Rejected
    );
    assert!(table.is_empty());
}

#[test]
fn test_routing_table_split_keeps_buckets_bounded() {
    let mut table = RoutingTable::new(NodeId::generate());
    let mut ids = HashSet::new();

    for i in 0..500u32 {
        let id = NodeId::generate();
        ids.insert(id);
        let port = 1000 + (i % 60000) as u16;
        table.add(Contact::new(id, addr((i % 250) as u8 + 1, port)));
    }

    assert!(table.bucket_count() > 1);
    assert!(table.max_bucket_len() <= K);
    assert_eq!(table.len(), ids.len());

    let distinct: HashSet<NodeId> = table.contacts().map(|c| c.id).collect();
    assert_eq!(distinct.len(), table.len());
}

#[test]
fn test_routing_table_closest() {
    let mut table = RoutingTable::new(NodeId([0xFF; 20]));

    for i in 1..=40u8 {
        table.add(Contact::new(id_with_first_byte(i), addr(i, 6881)));
    }

    let target = NodeId([0u8; 20]);
    let closest = table.closest(&target, 8);
    assert_eq!(closest.len(), 8);

    let ids: Vec<NodeId> = closest.iter().map(|c| c.id).collect();
    let expected: Vec<NodeId> = (1..=8u8).map(id_with_first_byte).collect();
    assert_eq!(ids, expected);

    for pair in closest.windows(2) {
        assert_ne!(
            target.cmp_distance(&pair[0].id, &pair[1].id),
            std::cmp::Ordering::Greater
        );
    }
}

#[test]
fn test_routing_table_remove() {
    let mut table = RoutingTable::new(NodeId::generate());
    let id = NodeId::generate();
    table.add(Contact::new(id, addr(1, 6881)));

    assert!(table.remove(&id).is_some());
    assert!(table.remove(&id).is_none());
    assert!(table.get(&id).is_none());
    assert!(table.is_empty());
    assert!(table.contacts().all(|c| c.addr != addr(1, 6881)));
}

#[test]
fn test_routing_table_snapshot_skips_valued_contacts() {
    let mut table = RoutingTable::new(NodeId::generate());
    let plain = NodeId::generate();
    let valued = NodeId::generate();

    table.add(Contact::new(plain, addr(1, 6881)));
    let mut contact = Contact::new(valued, addr(2, 6881));
    contact.value = Some(Item::immutable(Value::string("x")));
    table.add(contact);

    let snapshot = table.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, plain);
    assert_eq!(table.len(), 2);
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[test]
fn test_token_lifetime() {
    let mut tokens = TokenAuthority::new();
    let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7));
    let token = tokens.generate(ip);

    assert_eq!(token.len(), 20);
    assert!(tokens.is_valid(&token, ip));
    assert!(!tokens.is_valid(&token, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 8))));

    tokens.rotate();
    assert!(tokens.is_valid(&token, ip));

    tokens.rotate();
    assert!(!tokens.is_valid(&token, ip));
}

#[test]
fn test_token_ignores_port() {
    let tokens = TokenAuthority::new();
    let ip = IpAddr::V6(Ipv6Addr::LOCALHOST);
    assert_eq!(tokens.generate(ip), tokens.generate(ip));
    assert!(!tokens.is_valid(b"short", ip));
}

// ---------------------------------------------------------------------------
// KRPC messages
// ---------------------------------------------------------------------------

#[test]
fn test_krpc_ping() {
    let our_id = NodeId::generate();
    let msg = KrpcMessage::query(0x0102, our_id, Query::Ping);
    let encoded = msg.encode();

    let parsed = KrpcMessage::parse(&encoded).unwrap();
    assert_eq!(parsed.transaction_id.as_ref(), &[0x01, 0x02]);
    assert_eq!(parsed.transaction_id(), Some(0x0102));
    match parsed.body {
        Body::Query { sender, query } => {
            assert_eq!(sender, our_id);
            assert_eq!(query, Query::Ping);
        }
        other => panic!("unexpected body: {:?}", other),
    }
}

#[test]
fn test_krpc_announce_implied_port() {
    let info_hash = NodeId([0xAB; 20]);
    let query = Query::AnnouncePeer {
        info_hash,
        port: 0,
        implied_port: true,
        token: Bytes::from_static(b"tok"),
    };
    let encoded = KrpcMessage::query(7, NodeId::generate(), query.clone()).encode();

    match KrpcMessage::parse(&encoded).unwrap().body {
        Body::Query { query: parsed, .. } => assert_eq!(parsed, query),
        other => panic!("unexpected body: {:?}", other),
    }
}

#[test]
fn test_krpc_get_peers_response() {
    let responder = NodeId::generate();
    let mut response = Response::new(responder);
    response.token = Some(Bytes::from_static(b"token"));
    response.values = Some(vec![addr(1, 6881), addr(2, 6882)]);

    let encoded = KrpcMessage::response(Bytes::from_static(b"aa"), response).encode();
    match KrpcMessage::parse(&encoded).unwrap().body {
        Body::Response(parsed) => {
            assert_eq!(parsed.id, responder);
            assert_eq!(parsed.token.as_deref(), Some(&b"token"[..]));
            assert_eq!(parsed.values, Some(vec![addr(1, 6881), addr(2, 6882)]));
            assert!(parsed.nodes.is_none());
        }
        other => panic!("unexpected body: {:?}", other),
    }
}

#[test]
fn test_krpc_nodes_response_with_ipv6() {
    let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 6881);
    let mut response = Response::new(NodeId::generate());
    response.nodes = Some(vec![
        Contact::new(NodeId([1u8; 20]), addr(1, 6881)),
        Contact::new(NodeId([2u8; 20]), v6),
    ]);

    let encoded = KrpcMessage::response(Bytes::from_static(b"bb"), response).encode();
    match KrpcMessage::parse(&encoded).unwrap().body {
        Body::Response(parsed) => {
            let addrs: Vec<SocketAddr> = parsed.nodes.unwrap().iter().map(|c| c.addr).collect();
            assert_eq!(addrs, vec![addr(1, 6881), v6]);
        }
        other => panic!("unexpected body: {:?}", other),
    }
}

#[test]
fn test_krpc_put_mutable() {
    let item = Item::mutable([0u8; 32], 4, Value::string("hello"))
        .with_salt("salt")
        .sign(&signing_key())
        .with_cas(3);
    let query = Query::Put {
        token: Bytes::from_static(b"tok"),
        item: item.clone(),
    };
    let encoded = KrpcMessage::query(9, NodeId::generate(), query).encode();

    match KrpcMessage::parse(&encoded).unwrap().body {
        Body::Query {
            query: Query::Put { token, item: parsed },
            ..
        } => {
            assert_eq!(token.as_ref(), b"tok");
            assert_eq!(parsed, item);
        }
        other => panic!("unexpected body: {:?}", other),
    }
}

#[test]
fn test_krpc_error() {
    let error = KrpcError::new(ErrorCode::SequenceTooOld, "sequence number less than current");
    let encoded = KrpcMessage::error(Bytes::from_static(b"cc"), error.clone()).encode();

    match KrpcMessage::parse(&encoded).unwrap().body {
        Body::Error(parsed) => assert_eq!(parsed, error),
        other => panic!("unexpected body: {:?}", other),
    }
}

#[test]
fn test_krpc_unknown_method() {
    let data = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:fool1:t2:aa1:y1:qe";
    match KrpcMessage::parse(data).unwrap().body {
        Body::InvalidQuery(e) => assert_eq!(e.code, ErrorCode::MethodUnknown),
        other => panic!("unexpected body: {:?}", other),
    }
}

#[test]
fn test_krpc_missing_arguments() {
    let data = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q9:find_node1:t2:aa1:y1:qe";
    match KrpcMessage::parse(data).unwrap().body {
        Body::InvalidQuery(e) => assert_eq!(e.code, ErrorCode::Protocol),
        other => panic!("unexpected body: {:?}", other),
    }
}

#[test]
fn test_krpc_malformed() {
    assert!(KrpcMessage::parse(b"not bencode").is_err());
    assert!(KrpcMessage::parse(b"d1:y1:qe").is_err());
    assert!(KrpcMessage::parse(b"d1:t2:aa1:y1:ze").is_err());
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[test]
fn test_transaction_ids_unique() {
    let mut transactions = TransactionManager::new();
    let dest = addr(1, 6881);
    let mut ids = HashSet::new();
    let mut receivers = Vec::new();

    for _ in 0..100 {
        let (tx, rx) = oneshot::channel();
        receivers.push(rx);
        assert!(ids.insert(transactions.begin(dest, tx).unwrap()));
    }
    assert_eq!(transactions.len(), 100);
}

#[test]
fn test_transaction_resolves_once() {
    let mut transactions = TransactionManager::new();
    let dest = addr(1, 6881);
    let (tx, mut rx) = oneshot::channel();
    let tid = transactions.begin(dest, tx).unwrap();
    let responder = NodeId::generate();

    assert!(transactions.is_pending(dest, tid));
    assert!(transactions.resolve(dest, tid, Ok(Response::new(responder))));
    assert!(!transactions.resolve(dest, tid, Err(DhtError::Timeout)));
    assert!(!transactions.expire(dest, tid));
    assert!(transactions.is_empty());

    let response = rx.try_recv().unwrap().unwrap();
    assert_eq!(response.id, responder);
}

#[test]
fn test_transaction_wrong_destination_does_not_match() {
    let mut transactions = TransactionManager::new();
    let (tx, _rx) = oneshot::channel();
    let tid = transactions.begin(addr(1, 6881), tx).unwrap();

    assert!(!transactions.resolve(addr(2, 6881), tid, Err(DhtError::Timeout)));
    assert!(transactions.is_pending(addr(1, 6881), tid));
}

#[test]
fn test_transaction_expire() {
    let mut transactions = TransactionManager::new();
    let dest = addr(1, 6881);
    let (tx, mut rx) = oneshot::channel();
    let tid = transactions.begin(dest, tx).unwrap();

    assert!(transactions.expire(dest, tid));
    assert!(matches!(rx.try_recv().unwrap(), Err(DhtError::Timeout)));
}

#[test]
fn test_transaction_cancel_all_drops_replies() {
    let mut transactions = TransactionManager::new();
    let (tx, mut rx) = oneshot::channel();
    transactions.begin(addr(1, 6881), tx).unwrap();

    transactions.cancel_all();
    assert!(transactions.is_empty());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_transaction_ids_exhausted_then_reused() {
    let mut transactions = TransactionManager::new();
    let dest = addr(1, 6881);
    let mut receivers = Vec::with_capacity(65536);

    for _ in 0..65536 {
        let (tx, rx) = oneshot::channel();
        receivers.push(rx);
        transactions.begin(dest, tx).unwrap();
    }

    let (tx, _rx) = oneshot::channel();
    assert!(transactions.begin(dest, tx).is_err());

    transactions.resolve(dest, 5, Err(DhtError::Timeout));
    let (tx, _rx) = oneshot::channel();
    assert_eq!(transactions.begin(dest, tx).unwrap(), 5);
}

// ---------------------------------------------------------------------------
// BEP-44 items
// ---------------------------------------------------------------------------

const VECTOR_KEY: &str = "77ff84905a91936367c01360803104f92432fcd904a43511876df5cdf3e7e548";
const VECTOR_SIG: &str = "305ac8aeb6c9c151fa120f120ea2cfb923564e11552d06a5d856091e5e853cff1260d3f39e4999684aa92eb73ffd136e6f4f3ecbfda0ce53a1608ecd7ae21f01";
const VECTOR_SALTED_SIG: &str = "6834284b6b24c3204eb2fea824d82f88883a3d95e8b4a21b8c0ded553d17d17ddf9a8a7104b1258f30bed3787e6cb896fca78c58f8e03b5f18f14951a87d9a08";

fn vector_item(sig: &str) -> Item {
    let key: [u8; 32] = hex::decode(VECTOR_KEY).unwrap().try_into().unwrap();
    let mut item = Item::mutable(key, 1, Value::string("Hello World!"));
    item.sig = Some(Bytes::from(hex::decode(sig).unwrap()));
    item
}

#[test]
fn test_bep44_signable() {
    let v = Value::string("Hello World!");
    assert_eq!(signable(1, None, &v), b"3:seqi1e1:v12:Hello World!".to_vec());
    assert_eq!(
        signable(1, Some(b"foobar"), &v),
        b"4:salt6:foobar3:seqi1e1:v12:Hello World!".to_vec()
    );
    assert_eq!(signable(1, Some(b""), &v), signable(1, None, &v));
}

#[test]
fn test_bep44_targets() {
    assert_eq!(
        immutable_target(&Value::string("Hello World!")).to_string(),
        "e5f96f6f38320f0f33959cb4d3d656452117aadb"
    );

    let key = hex::decode(VECTOR_KEY).unwrap();
    assert_eq!(
        mutable_target(&key, None).to_string(),
        "4a533d47ec9c7d95b1ad75f576cffc641853b750"
    );
    assert_eq!(
        mutable_target(&key, Some(b"foobar")).to_string(),
        "411eba73b6f087ca51a3795d9c8c938d365e32c1"
    );
}

#[test]
fn test_bep44_vector_verifies() {
    let item = vector_item(VECTOR_SIG);
    let target = NodeId::from_hex("4a533d47ec9c7d95b1ad75f576cffc641853b750").unwrap();
    assert_eq!(item.target(), target);
    assert!(item.verify_for(&target, &Ed25519Verifier));

    let salted = vector_item(VECTOR_SALTED_SIG).with_salt("foobar");
    let salted_target = NodeId::from_hex("411eba73b6f087ca51a3795d9c8c938d365e32c1").unwrap();
    assert!(salted.verify_for(&salted_target, &Ed25519Verifier));

    // Signature over the unsalted buffer does not cover the salt.
    let wrong = vector_item(VECTOR_SIG).with_salt("foobar");
    assert!(!wrong.verify_for(&salted_target, &Ed25519Verifier));
}

#[test]
fn test_bep44_sign_roundtrip() {
    let key = signing_key();
    let item = Item::mutable([0u8; 32], 3, Value::string("data")).sign(&key);

    assert_eq!(item.k.as_deref(), Some(&key.verifying_key().to_bytes()[..]));
    assert_eq!(item.sig.as_ref().map(|s| s.len()), Some(SIGNATURE_LEN));
    assert!(item.verify_for(&item.target(), &Ed25519Verifier));

    let mut tampered = item.clone();
    tampered.v = Value::string("evil");
    assert!(!tampered.verify_for(&item.target(), &Ed25519Verifier));
}

#[test]
fn test_bep44_immutable_verify() {
    let item = Item::immutable(Value::string("Hello World!"));
    assert!(!item.is_mutable());
    assert!(item.verify_for(&item.target(), &Ed25519Verifier));
    assert!(!item.verify_for(&NodeId([0u8; 20]), &Ed25519Verifier));
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[test]
fn test_storage_immutable_idempotent() {
    let mut store = storage();
    let item = Item::immutable(Value::string("Hello World!"));

    let key = store.put(&item).unwrap();
    assert_eq!(store.put(&item).unwrap(), key);
    assert_eq!(store.value_count(), 1);
    assert_eq!(store.get(&key), Some(item));
}

#[test]
fn test_storage_rejects_oversized_value() {
    let mut store = storage();
    let item = Item::immutable(Value::bytes(vec![0u8; 1000]));

    let err = store.put(&item).unwrap_err();
    assert_eq!(err.code, ErrorCode::MessageTooBig);
    assert_eq!(store.value_count(), 0);
}

#[test]
fn test_storage_accepts_value_at_limit() {
    let mut store = storage();
    // "995:" prefix plus 995 bytes encodes to exactly 999 bytes.
    let item = Item::immutable(Value::bytes(vec![1u8; 995]));
    assert!(store.put(&item).is_ok());
}

#[test]
fn test_storage_rejects_bad_signature() {
    let mut store = storage();
    let mut item = Item::mutable([0u8; 32], 1, Value::string("data")).sign(&signing_key());
    item.v = Value::string("tampered");

    assert_eq!(store.put(&item).unwrap_err().code, ErrorCode::InvalidSignature);

    let mut unsigned = Item::mutable([0u8; 32], 1, Value::string("data"));
    unsigned.sig = None;
    assert_eq!(store.put(&unsigned).unwrap_err().code, ErrorCode::InvalidSignature);
}

#[test]
fn test_storage_rejects_bad_key_length() {
    let mut store = storage();
    let mut item = Item::mutable([0u8; 32], 1, Value::string("data")).sign(&signing_key());
    item.k = Some(Bytes::from_static(b"short"));

    assert_eq!(store.put(&item).unwrap_err().code, ErrorCode::Protocol);
}

#[test]
fn test_storage_rejects_big_salt() {
    let mut store = storage();
    let item = Item::mutable([0u8; 32], 1, Value::string("data"))
        .with_salt(vec![b's'; 65])
        .sign(&signing_key());

    assert_eq!(store.put(&item).unwrap_err().code, ErrorCode::SaltTooBig);

    let ok = Item::mutable([0u8; 32], 1, Value::string("data"))
        .with_salt(vec![b's'; 64])
        .sign(&signing_key());
    assert!(store.put(&ok).is_ok());
}

#[test]
fn test_storage_sequence_numbers() {
    let mut store = storage();
    let key = signing_key();
    let item = |seq: i64| Item::mutable([0u8; 32], seq, Value::string("data")).sign(&key);

    let target = store.put(&item(0)).unwrap();
    store.put(&item(1)).unwrap();

    assert_eq!(store.put(&item(1)).unwrap_err().code, ErrorCode::SequenceTooOld);
    assert_eq!(store.put(&item(0)).unwrap_err().code, ErrorCode::SequenceTooOld);
    assert_eq!(store.get(&target).unwrap().seq, Some(1));
}

#[test]
fn test_storage_cas() {
    let mut store = storage();
    let key = signing_key();
    let item = |seq: i64| Item::mutable([0u8; 32], seq, Value::string("data")).sign(&key);

    let target = store.put(&item(1)).unwrap();

    let err = store.put(&item(2).with_cas(5)).unwrap_err();
    assert_eq!(err.code, ErrorCode::CasMismatch);

    store.put(&item(2).with_cas(1)).unwrap();
    let stored = store.get(&target).unwrap();
    assert_eq!(stored.seq, Some(2));
    assert_eq!(stored.cas, None);
}

#[test]
fn test_storage_peers() {
    let mut store = storage();
    let info_hash = NodeId::generate();

    assert!(store.add_peer(info_hash, addr(1, 6881)));
    assert!(!store.add_peer(info_hash, addr(1, 6881)));
    assert!(store.add_peer(info_hash, addr(2, 6881)));
    assert_eq!(store.peers(&info_hash).len(), 2);

    assert!(store.remove_peer(&info_hash, &addr(1, 6881)));
    assert_eq!(store.peers(&info_hash), vec![addr(2, 6881)]);
    assert!(store.peers(&NodeId::generate()).is_empty());
}

#[test]
fn test_storage_peers_capped_per_response() {
    let mut store = storage();
    let info_hash = NodeId::generate();
    for i in 0..150u16 {
        store.add_peer(info_hash, addr(1, 1000 + i));
    }
    assert_eq!(store.peers(&info_hash).len(), 100);
}

#[test]
fn test_bounded_peer_store_limits() {
    let mut peers = BoundedPeerStore::new(2, 3, std::time::Duration::from_secs(60));
    let hashes: Vec<NodeId> = (1..=3u8).map(id_with_first_byte).collect();

    for i in 0..5u16 {
        peers.add(hashes[0], addr(1, 1000 + i));
    }
    assert_eq!(peers.peers(&hashes[0], 100).len(), 3);

    peers.add(hashes[1], addr(1, 2000));
    peers.add(hashes[2], addr(1, 3000));
    let tracked = hashes
        .iter()
        .filter(|h| !peers.peers(h, 100).is_empty())
        .count();
    assert_eq!(tracked, 2);
}

#[test]
fn test_bounded_value_store_capacity() {
    let mut values = BoundedValueStore::new(2, std::time::Duration::from_secs(60));
    let items: Vec<Item> = ["a", "b", "c"]
        .iter()
        .map(|v| Item::immutable(Value::string(v)))
        .collect();

    for item in &items {
        values.insert(item.target(), item.clone());
    }

    assert_eq!(values.len(), 2);
    assert!(values.get(&items[2].target()).is_some());

    values.insert(items[2].target(), items[2].clone());
    assert_eq!(values.len(), 2);
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

/// In-memory network where every node knows every other node.
struct FakeNetwork {
    our_id: NodeId,
    nodes: Vec<Contact>,
    holder: Option<(SocketAddr, Item)>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    queried: Mutex<Vec<SocketAddr>>,
}

impl FakeNetwork {
    fn new(size: u8) -> Self {
        let nodes = (1..=size)
            .map(|i| Contact::new(NodeId::generate(), addr(i, 6881)))
            .collect();
        Self {
            our_id: NodeId::generate(),
            nodes,
            holder: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            queried: Mutex::new(Vec::new()),
        }
    }

    fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut nodes = self.nodes.clone();
        nodes.sort_by(|a, b| target.cmp_distance(&a.id, &b.id));
        nodes.truncate(count);
        nodes
    }

    fn respond(&self, to: SocketAddr, query: &Query) -> Result<Response, DhtError> {
        let node = self
            .nodes
            .iter()
            .find(|c| c.addr == to)
            .ok_or(DhtError::Timeout)?;

        let target = match query {
            Query::FindNode { target } | Query::Get { target, .. } => *target,
            Query::GetPeers { info_hash } => *info_hash,
            _ => return Ok(Response::new(node.id)),
        };

        let mut response = Response::new(node.id);
        response.nodes = Some(self.closest(&target, K));
        response.token = Some(Bytes::from_static(b"tok"));
        if let (Query::Get { .. }, Some((holder, item))) = (query, &self.holder) {
            if *holder == to {
                response.item = Some(item.clone());
            }
        }
        Ok(response)
    }
}

impl QueryRpc for FakeNetwork {
    fn our_id(&self) -> NodeId {
        self.our_id
    }

    fn query(&self, to: SocketAddr, query: Query) -> BoxFuture<'static, Result<Response, DhtError>> {
        self.queried.lock().unwrap().push(to);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let in_flight = self.in_flight.clone();
        let result = self.respond(to, &query);
        Box::pin(async move {
            in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

fn lookup(network: &FakeNetwork, target: NodeId, mode: LookupMode) -> Lookup {
    Lookup::new(target, mode, Arc::new(Ed25519Verifier)).seed_contacts(network.nodes[..3].to_vec())
}

#[tokio::test]
async fn test_lookup_converges_on_closest() {
    let network = FakeNetwork::new(60);
    let target = NodeId::generate();

    let outcome = lookup(&network, target, LookupMode::FindNode)
        .run(&network)
        .await
        .unwrap();

    let expected: Vec<NodeId> = network.closest(&target, K).iter().map(|c| c.id).collect();
    let found: Vec<NodeId> = outcome.closest.iter().map(|c| c.id).collect();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn test_lookup_respects_alpha() {
    let network = FakeNetwork::new(60);

    let outcome = lookup(&network, NodeId::generate(), LookupMode::FindNode)
        .run(&network)
        .await
        .unwrap();

    assert!(outcome.queried > ALPHA);
    assert!(network.max_in_flight.load(Ordering::SeqCst) <= ALPHA);

    let queried = network.queried.lock().unwrap();
    let distinct: HashSet<&SocketAddr> = queried.iter().collect();
    assert_eq!(distinct.len(), queried.len());
}

#[tokio::test]
async fn test_lookup_custom_alpha() {
    let network = FakeNetwork::new(60);

    lookup(&network, NodeId::generate(), LookupMode::FindNode)
        .alpha(2)
        .run(&network)
        .await
        .unwrap();

    assert!(network.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_lookup_get_not_found() {
    let network = FakeNetwork::new(30);

    let result = lookup(&network, NodeId::generate(), LookupMode::Get)
        .run(&network)
        .await;
    assert!(matches!(result, Err(DhtError::NotFound)));
}

#[tokio::test]
async fn test_lookup_get_finds_value() {
    let mut network = FakeNetwork::new(30);
    let item = Item::immutable(Value::string("Hello World!"));
    let target = item.target();
    let holder = network.closest(&target, 1)[0].addr;
    network.holder = Some((holder, item.clone()));

    let outcome = lookup(&network, target, LookupMode::Get)
        .run(&network)
        .await
        .unwrap();
    assert_eq!(outcome.value, Some(item));
}

#[tokio::test]
async fn test_lookup_ignores_invalid_value() {
    let mut network = FakeNetwork::new(30);
    let target = NodeId::generate();
    let holder = network.closest(&target, 1)[0].addr;
    network.holder = Some((holder, Item::immutable(Value::string("not the target"))));

    let result = lookup(&network, target, LookupMode::Get).run(&network).await;
    assert!(matches!(result, Err(DhtError::Verification(_))));
}

#[tokio::test]
async fn test_lookup_queries_every_seed() {
    let network = FakeNetwork::new(0);
    let seeds: Vec<SocketAddr> = (1..=10)
        .map(|i| SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 1, i)), 6881))
        .collect();

    let outcome = Lookup::new(NodeId::generate(), LookupMode::FindNode, Arc::new(Ed25519Verifier))
        .seed_addrs(seeds.clone())
        .run(&network)
        .await
        .unwrap();

    assert_eq!(outcome.queried, seeds.len());
    assert!(outcome.closest.is_empty());
    let queried = network.queried.lock().unwrap().clone();
    assert_eq!(queried, seeds);
    assert!(network.max_in_flight.load(Ordering::SeqCst) <= ALPHA);
}

#[tokio::test]
async fn test_lookup_asks_seeds_before_contacts() {
    let network = FakeNetwork::new(30);
    let seeds = vec![network.nodes[20].addr, network.nodes[21].addr];

    Lookup::new(NodeId::generate(), LookupMode::FindNode, Arc::new(Ed25519Verifier))
        .seed_contacts(network.nodes[..3].to_vec())
        .seed_addrs(seeds.clone())
        .alpha(1)
        .run(&network)
        .await
        .unwrap();

    let queried = network.queried.lock().unwrap().clone();
    assert_eq!(queried[..2], seeds[..]);
}

#[tokio::test]
async fn test_lookup_get_without_stopping() {
    let mut network = FakeNetwork::new(30);
    let item = Item::immutable(Value::string("Hello World!"));
    let target = item.target();
    let holder = network.closest(&target, 1)[0].addr;
    network.holder = Some((holder, item));

    let outcome = lookup(&network, target, LookupMode::Get)
        .stop_on_value(false)
        .run(&network)
        .await
        .unwrap();

    assert!(outcome.value.is_none());
    assert_eq!(outcome.closest.len(), K);
    assert!(outcome.closest.iter().all(|c| c.token.is_some()));
}

#[tokio::test]
async fn test_lookup_drops_unresponsive_nodes() {
    let network = FakeNetwork::new(30);
    let dead = Contact::new(NodeId::generate(), addr(200, 6881));

    let outcome = Lookup::new(NodeId::generate(), LookupMode::FindNode, Arc::new(Ed25519Verifier))
        .seed_contacts(vec![dead.clone(), network.nodes[0].clone()])
        .run(&network)
        .await
        .unwrap();

    assert!(outcome.closest.iter().all(|c| c.addr != dead.addr));
    assert!(network.queried.lock().unwrap().contains(&dead.addr));
}

#[tokio::test]
async fn test_lookup_with_no_contacts() {
    let network = FakeNetwork::new(0);

    let outcome = Lookup::new(NodeId::generate(), LookupMode::FindNode, Arc::new(Ed25519Verifier))
        .run(&network)
        .await
        .unwrap();
    assert!(outcome.closest.is_empty());
    assert_eq!(outcome.queried, 0);
}
