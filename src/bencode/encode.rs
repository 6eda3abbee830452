use super::value::Value;

/// Encodes a bencode value to a fresh byte vector.
///
/// Dictionary keys are written in ascending byte order, which `BTreeMap`
/// already guarantees, so the output is canonical and can be hashed or
/// signed directly.
///
/// ```
/// use rdht::bencode::{encode, Value};
///
/// let list = Value::List(vec![Value::Integer(1), Value::string("two")]);
/// assert_eq!(encode(&list), b"li1e3:twoe");
/// ```
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    encode_into(value, &mut buf);
    buf
}

/// Appends the encoding of `value` to `buf`.
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => write_bytes(b, buf),
        Value::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(entries) => {
            buf.push(b'd');
            for (key, val) in entries {
                write_bytes(key, buf);
                encode_into(val, buf);
            }
            buf.push(b'e');
        }
    }
}

fn write_bytes(data: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(data);
}
