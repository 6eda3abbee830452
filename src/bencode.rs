//! Bencode encoding and decoding ([BEP-3]).
//!
//! Every KRPC datagram exchanged by the DHT is a bencoded dictionary, and
//! BEP-44 derives storage keys and signatures from the canonical encoding of
//! stored values. The codec here is therefore strict in both directions:
//! the encoder always emits canonical output and the decoder refuses input
//! that could not have come out of a canonical encoder.
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` → ["spam", 42] |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` → {"foo": "bar"} |
//!
//! # Examples
//!
//! ```
//! use rdht::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d1:ti7e1:y1:qe").unwrap();
//! assert_eq!(value.get(b"t").and_then(Value::as_integer), Some(7));
//! assert_eq!(value.get(b"y").and_then(Value::as_str), Some("q"));
//!
//! assert_eq!(encode(&value), b"d1:ti7e1:y1:qe");
//! ```
//!
//! Decoding fails with:
//!
//! - [`BencodeError::UnexpectedEof`] - input ended inside a value
//! - [`BencodeError::InvalidInteger`] - malformed integer (e.g. leading zeros)
//! - [`BencodeError::UnexpectedChar`] - byte that cannot start a value
//! - [`BencodeError::UnsortedKeys`] - dictionary keys out of order or repeated
//! - [`BencodeError::NestingTooDeep`] - more than 64 nested containers
//! - [`BencodeError::TrailingData`] - bytes after the top-level value
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::Value;
