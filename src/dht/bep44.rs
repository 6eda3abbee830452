//! Arbitrary data items ([BEP-44]).
//!
//! Immutable items are addressed by the SHA-1 of their bencoded value.
//! Mutable items are addressed by the SHA-1 of the owner's ed25519 public
//! key (plus optional salt) and carry a signature over the canonical
//! encoding of `{salt, seq, v}` with the outer dictionary framing removed.
//!
//! Signing and verification are injected through [`Signer`] and
//! [`Verifier`]; [`Ed25519Verifier`] and the [`Signer`] impl for
//! `ed25519_dalek::SigningKey` cover the standard scheme.
//!
//! [BEP-44]: http://bittorrent.org/beps/bep_0044.html

use super::node::NodeId;
use crate::bencode::{encode, encode_into, Value};
use bytes::Bytes;
use std::collections::BTreeMap;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Signature check over a message with a raw public key.
pub trait Verifier: Send + Sync {
    /// Returns true only when `signature` is a valid signature of `message`
    /// under `public_key`. Wrong-sized inputs never verify.
    fn verify(&self, signature: &[u8], message: &[u8], public_key: &[u8]) -> bool;
}

/// Produces signatures for mutable items.
pub trait Signer {
    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN];
    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN];
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, signature: &[u8], message: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <&[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <&[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(key_bytes) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(sig_bytes);
        key.verify_strict(message, &signature).is_ok()
    }
}

impl Signer for ed25519_dalek::SigningKey {
    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        ed25519_dalek::Signer::sign(self, message).to_bytes()
    }
}

/// A BEP-44 item as stored, transmitted and returned by `get`.
///
/// `k` set means the item is mutable. `cas` is only meaningful on the way
/// in and is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub v: Value,
    pub k: Option<Bytes>,
    pub sig: Option<Bytes>,
    pub seq: Option<i64>,
    pub salt: Option<Bytes>,
    pub cas: Option<i64>,
}

impl Item {
    pub fn immutable(v: Value) -> Self {
        Self {
            v,
            k: None,
            sig: None,
            seq: None,
            salt: None,
            cas: None,
        }
    }

    /// An unsigned mutable item owned by `public_key`. Call [`Item::sign`]
    /// or set `sig` before storing it.
    pub fn mutable(public_key: [u8; PUBLIC_KEY_LEN], seq: i64, v: Value) -> Self {
        Self {
            v,
            k: Some(Bytes::copy_from_slice(&public_key)),
            sig: None,
            seq: Some(seq),
            salt: None,
            cas: None,
        }
    }

    pub fn with_salt(mut self, salt: impl AsRef<[u8]>) -> Self {
        self.salt = Some(Bytes::copy_from_slice(salt.as_ref()));
        self
    }

    pub fn with_cas(mut self, cas: i64) -> Self {
        self.cas = Some(cas);
        self
    }

    /// Signs the item with `signer`, replacing `k` with the signer's key.
    pub fn sign(mut self, signer: &dyn Signer) -> Self {
        self.k = Some(Bytes::copy_from_slice(&signer.public_key()));
        let message = signable(self.seq.unwrap_or(0), self.salt.as_deref(), &self.v);
        self.sig = Some(Bytes::copy_from_slice(&signer.sign(&message)));
        self
    }

    pub fn is_mutable(&self) -> bool {
        self.k.is_some()
    }

    /// The DHT key this item is stored under.
    pub fn target(&self) -> NodeId {
        match &self.k {
            Some(k) => mutable_target(k, self.salt.as_deref()),
            None => immutable_target(&self.v),
        }
    }

    /// Checks that this item is a legitimate answer for `target`: the hash
    /// must match and mutable items must carry a valid signature.
    pub fn verify_for(&self, target: &NodeId, verifier: &dyn Verifier) -> bool {
        if self.target() != *target {
            return false;
        }
        match (&self.k, &self.sig, self.seq) {
            (None, _, _) => true,
            (Some(k), Some(sig), Some(seq)) => {
                let message = signable(seq, self.salt.as_deref(), &self.v);
                verifier.verify(sig, &message, k)
            }
            _ => false,
        }
    }

    /// Copy suitable for storage, without the transient `cas`.
    pub(crate) fn stored(&self) -> Self {
        Self {
            cas: None,
            ..self.clone()
        }
    }
}

pub fn immutable_target(v: &Value) -> NodeId {
    NodeId::sha1(&[&encode(v)])
}

pub fn mutable_target(public_key: &[u8], salt: Option<&[u8]>) -> NodeId {
    NodeId::sha1(&[public_key, salt.unwrap_or_default()])
}

/// The byte string signed for a mutable item: the canonical encoding of
/// `{salt?, seq, v}` without the enclosing `d` and `e`.
pub fn signable(seq: i64, salt: Option<&[u8]>, v: &Value) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    if let Some(salt) = salt.filter(|s| !s.is_empty()) {
        dict.insert(Bytes::from_static(b"salt"), Value::bytes(salt));
    }
    dict.insert(Bytes::from_static(b"seq"), Value::Integer(seq));
    dict.insert(Bytes::from_static(b"v"), v.clone());

    let mut buf = Vec::with_capacity(v.encoded_len() + 32);
    encode_into(&Value::Dict(dict), &mut buf);
    buf.pop();
    buf.remove(0);
    buf
}
