use bytes::Bytes;
use std::collections::BTreeMap;

/// A bencode value.
///
/// ```
/// use rdht::bencode::Value;
///
/// let port: Value = 6881i64.into();
/// let method = Value::string("get_peers");
///
/// assert_eq!(port.as_integer(), Some(6881));
/// assert_eq!(method.as_str(), Some("get_peers"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string (may or may not be valid UTF-8).
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte string keys, kept sorted.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Creates a byte string value by copying `data`.
    pub fn bytes(data: impl AsRef<[u8]>) -> Self {
        Value::Bytes(Bytes::copy_from_slice(data.as_ref()))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a UTF-8 string if it is a byte string holding
    /// valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key in this value if it is a dictionary.
    ///
    /// ```
    /// use rdht::bencode::decode;
    ///
    /// let value = decode(b"d2:id3:abce").unwrap();
    /// assert_eq!(value.get(b"id").and_then(|v| v.as_str()), Some("abc"));
    /// assert_eq!(value.get(b"missing"), None);
    /// ```
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    /// Length of the canonical encoding of this value, computed without
    /// allocating.
    pub fn encoded_len(&self) -> usize {
        fn bytes_len(len: usize) -> usize {
            decimal_len(len as u64) + 1 + len
        }

        fn decimal_len(mut n: u64) -> usize {
            let mut digits = 1;
            while n >= 10 {
                n /= 10;
                digits += 1;
            }
            digits
        }

        match self {
            Value::Integer(i) => {
                let sign = usize::from(*i < 0);
                2 + sign + decimal_len(i.unsigned_abs())
            }
            Value::Bytes(b) => bytes_len(b.len()),
            Value::List(items) => 2 + items.iter().map(Value::encoded_len).sum::<usize>(),
            Value::Dict(entries) => {
                2 + entries
                    .iter()
                    .map(|(k, v)| bytes_len(k.len()) + v.encoded_len())
                    .sum::<usize>()
            }
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(d: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(d)
    }
}
