use super::bep44::Item;
use super::error::{DhtError, ErrorCode, KrpcError};
use super::node::{compact_nodes, compact_peer, parse_compact_nodes, parse_compact_peer, Contact, NodeId};
use crate::bencode::{decode, encode, Value};
use crate::constants::{COMPACT_NODE_V4_LEN, COMPACT_NODE_V6_LEN};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

/// Transaction ids are two bytes on the wire, big-endian.
pub type TransactionId = u16;

type Dict = BTreeMap<Bytes, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
    Get,
    Put,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::FindNode => "find_node",
            Method::GetPeers => "get_peers",
            Method::AnnouncePeer => "announce_peer",
            Method::Get => "get",
            Method::Put => "put",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"ping" => Some(Method::Ping),
            b"find_node" => Some(Method::FindNode),
            b"get_peers" => Some(Method::GetPeers),
            b"announce_peer" => Some(Method::AnnouncePeer),
            b"get" => Some(Method::Get),
            b"put" => Some(Method::Put),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: NodeId,
    },
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
        token: Bytes,
    },
    Get {
        target: NodeId,
        /// Only return the item if it is newer than this.
        seq: Option<i64>,
    },
    Put {
        token: Bytes,
        item: Item,
    },
}

impl Query {
    pub fn method(&self) -> Method {
        match self {
            Query::Ping => Method::Ping,
            Query::FindNode { .. } => Method::FindNode,
            Query::GetPeers { .. } => Method::GetPeers,
            Query::AnnouncePeer { .. } => Method::AnnouncePeer,
            Query::Get { .. } => Method::Get,
            Query::Put { .. } => Method::Put,
        }
    }
}

/// The `r` dictionary of a response. Which fields are present depends on
/// the method that was queried.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub id: NodeId,
    /// Entries from both `nodes` and `nodes6`.
    pub nodes: Option<Vec<Contact>>,
    pub token: Option<Bytes>,
    pub values: Option<Vec<SocketAddr>>,
    pub item: Option<Item>,
}

impl Response {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum Body {
    Query { sender: NodeId, query: Query },
    /// A query we understood well enough to answer with an error.
    InvalidQuery(KrpcError),
    Response(Response),
    Error(KrpcError),
}

#[derive(Debug, Clone)]
pub struct KrpcMessage {
    pub transaction_id: Bytes,
    pub body: Body,
}

fn key(k: &'static [u8]) -> Bytes {
    Bytes::from_static(k)
}

fn bytes_arg<'a>(dict: &'a Dict, name: &[u8]) -> Option<&'a Bytes> {
    dict.get(name).and_then(Value::as_bytes)
}

fn int_arg(dict: &Dict, name: &[u8]) -> Option<i64> {
    dict.get(name).and_then(Value::as_integer)
}

fn id_arg(dict: &Dict, name: &'static str) -> Result<NodeId, KrpcError> {
    bytes_arg(dict, name.as_bytes())
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or_else(|| KrpcError::protocol(format!("missing or invalid {}", name)))
}

fn required<'a>(dict: &'a Dict, name: &'static str) -> Result<&'a Bytes, KrpcError> {
    bytes_arg(dict, name.as_bytes()).ok_or_else(|| KrpcError::protocol(format!("missing {}", name)))
}

impl KrpcMessage {
    pub fn query(transaction_id: TransactionId, sender: NodeId, query: Query) -> Self {
        Self {
            transaction_id: Bytes::copy_from_slice(&transaction_id.to_be_bytes()),
            body: Body::Query { sender, query },
        }
    }

    pub fn response(transaction_id: Bytes, response: Response) -> Self {
        Self {
            transaction_id,
            body: Body::Response(response),
        }
    }

    pub fn error(transaction_id: Bytes, error: KrpcError) -> Self {
        Self {
            transaction_id,
            body: Body::Error(error),
        }
    }

    /// The transaction id as issued by this implementation; `None` when the
    /// peer used some other length.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        let bytes: [u8; 2] = self.transaction_id.as_ref().try_into().ok()?;
        Some(u16::from_be_bytes(bytes))
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;

        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::InvalidMessage("expected dict".into()))?;

        let transaction_id = bytes_arg(dict, b"t")
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let msg_type = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        let body = match msg_type {
            "q" => match Self::parse_query(dict) {
                Ok((sender, query)) => Body::Query { sender, query },
                Err(e) => Body::InvalidQuery(e),
            },
            "r" => Body::Response(Self::parse_response(dict)?),
            "e" => Body::Error(Self::parse_error(dict)),
            _ => {
                return Err(DhtError::InvalidMessage(format!(
                    "unknown message type: {}",
                    msg_type
                )))
            }
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }

    fn parse_query(dict: &Dict) -> Result<(NodeId, Query), KrpcError> {
        let name = required(dict, "q")?;
        let method = Method::from_name(name).ok_or_else(|| {
            KrpcError::new(
                ErrorCode::MethodUnknown,
                format!("method unknown: {}", String::from_utf8_lossy(name)),
            )
        })?;

        let args = dict
            .get(b"a".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| KrpcError::protocol("missing query args"))?;

        let sender = id_arg(args, "id")?;

        let query = match method {
            Method::Ping => Query::Ping,
            Method::FindNode => Query::FindNode {
                target: id_arg(args, "target")?,
            },
            Method::GetPeers => Query::GetPeers {
                info_hash: id_arg(args, "info_hash")?,
            },
            Method::AnnouncePeer => {
                let implied_port = int_arg(args, b"implied_port") == Some(1);
                let port = match int_arg(args, b"port") {
                    Some(p) => u16::try_from(p).map_err(|_| KrpcError::protocol("invalid port"))?,
                    None if implied_port => 0,
                    None => return Err(KrpcError::protocol("missing port")),
                };

                Query::AnnouncePeer {
                    info_hash: id_arg(args, "info_hash")?,
                    port,
                    implied_port,
                    token: required(args, "token")?.clone(),
                }
            }
            Method::Get => Query::Get {
                target: id_arg(args, "target")?,
                seq: int_arg(args, b"seq"),
            },
            Method::Put => {
                let token = required(args, "token")?.clone();
                let v = args
                    .get(b"v".as_slice())
                    .cloned()
                    .ok_or_else(|| KrpcError::protocol("missing v"))?;

                Query::Put {
                    token,
                    item: Item {
                        v,
                        k: bytes_arg(args, b"k").cloned(),
                        sig: bytes_arg(args, b"sig").cloned(),
                        seq: int_arg(args, b"seq"),
                        salt: bytes_arg(args, b"salt").cloned(),
                        cas: int_arg(args, b"cas"),
                    },
                }
            }
        };

        Ok((sender, query))
    }

    fn parse_response(dict: &Dict) -> Result<Response, DhtError> {
        let resp = dict
            .get(b"r".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?;

        let id = bytes_arg(resp, b"id")
            .and_then(|b| NodeId::from_bytes(b).ok())
            .ok_or_else(|| DhtError::InvalidMessage("missing id in response".into()))?;

        let nodes4 = bytes_arg(resp, b"nodes").map(|d| parse_compact_nodes(d, COMPACT_NODE_V4_LEN));
        let nodes6 = bytes_arg(resp, b"nodes6").map(|d| parse_compact_nodes(d, COMPACT_NODE_V6_LEN));
        let nodes = match (nodes4, nodes6) {
            (None, None) => None,
            (a, b) => Some(a.into_iter().chain(b).flatten().collect()),
        };

        let values = resp.get(b"values".as_slice()).and_then(|v| v.as_list()).map(|list| {
            list.iter()
                .filter_map(|v| v.as_bytes())
                .filter_map(|b| parse_compact_peer(b))
                .collect()
        });

        let item = resp.get(b"v".as_slice()).map(|v| Item {
            v: v.clone(),
            k: bytes_arg(resp, b"k").cloned(),
            sig: bytes_arg(resp, b"sig").cloned(),
            seq: int_arg(resp, b"seq"),
            salt: bytes_arg(resp, b"salt").cloned(),
            cas: None,
        });

        Ok(Response {
            id,
            nodes,
            token: bytes_arg(resp, b"token").cloned(),
            values,
            item,
        })
    }

    fn parse_error(dict: &Dict) -> KrpcError {
        let list = dict.get(b"e".as_slice()).and_then(|v| v.as_list());

        let code = list
            .and_then(|l| l.first())
            .and_then(|v| v.as_integer())
            .map(ErrorCode::from_code)
            .unwrap_or(ErrorCode::Generic);

        let message = list
            .and_then(|l| l.get(1))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();

        KrpcError { code, message }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = Dict::new();
        dict.insert(key(b"t"), Value::Bytes(self.transaction_id.clone()));

        match &self.body {
            Body::Query { sender, query } => {
                dict.insert(key(b"y"), Value::string("q"));
                dict.insert(key(b"q"), Value::string(query.method().as_str()));
                dict.insert(key(b"a"), Value::Dict(Self::encode_args(sender, query)));
            }
            Body::Response(response) => {
                dict.insert(key(b"y"), Value::string("r"));
                dict.insert(key(b"r"), Value::Dict(Self::encode_response(response)));
            }
            Body::InvalidQuery(error) | Body::Error(error) => {
                dict.insert(key(b"y"), Value::string("e"));
                dict.insert(
                    key(b"e"),
                    Value::List(vec![
                        Value::Integer(error.code.code()),
                        Value::string(&error.message),
                    ]),
                );
            }
        }

        encode(&Value::Dict(dict))
    }

    fn encode_args(sender: &NodeId, query: &Query) -> Dict {
        let mut args = Dict::new();
        args.insert(key(b"id"), Value::bytes(sender.as_bytes()));

        match query {
            Query::Ping => {}
            Query::FindNode { target } => {
                args.insert(key(b"target"), Value::bytes(target.as_bytes()));
            }
            Query::GetPeers { info_hash } => {
                args.insert(key(b"info_hash"), Value::bytes(info_hash.as_bytes()));
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                args.insert(key(b"info_hash"), Value::bytes(info_hash.as_bytes()));
                args.insert(key(b"port"), Value::Integer(i64::from(*port)));
                args.insert(key(b"token"), Value::Bytes(token.clone()));
                if *implied_port {
                    args.insert(key(b"implied_port"), Value::Integer(1));
                }
            }
            Query::Get { target, seq } => {
                args.insert(key(b"target"), Value::bytes(target.as_bytes()));
                if let Some(seq) = seq {
                    args.insert(key(b"seq"), Value::Integer(*seq));
                }
            }
            Query::Put { token, item } => {
                args.insert(key(b"token"), Value::Bytes(token.clone()));
                insert_item(&mut args, item);
                if let Some(cas) = item.cas {
                    args.insert(key(b"cas"), Value::Integer(cas));
                }
            }
        }

        args
    }

    fn encode_response(response: &Response) -> Dict {
        let mut resp = Dict::new();
        resp.insert(key(b"id"), Value::bytes(response.id.as_bytes()));

        if let Some(nodes) = &response.nodes {
            let (v4, v6) = compact_nodes(nodes);
            if !v6.is_empty() {
                resp.insert(key(b"nodes6"), Value::Bytes(Bytes::from(v6)));
            }
            resp.insert(key(b"nodes"), Value::Bytes(Bytes::from(v4)));
        }

        if let Some(token) = &response.token {
            resp.insert(key(b"token"), Value::Bytes(token.clone()));
        }

        if let Some(values) = &response.values {
            let values = values
                .iter()
                .map(|addr| Value::Bytes(Bytes::from(compact_peer(addr))))
                .collect();
            resp.insert(key(b"values"), Value::List(values));
        }

        if let Some(item) = &response.item {
            insert_item(&mut resp, item);
        }

        resp
    }
}

fn insert_item(dict: &mut Dict, item: &Item) {
    dict.insert(key(b"v"), item.v.clone());
    if let Some(k) = &item.k {
        dict.insert(key(b"k"), Value::Bytes(k.clone()));
    }
    if let Some(sig) = &item.sig {
        dict.insert(key(b"sig"), Value::Bytes(sig.clone()));
    }
    if let Some(seq) = item.seq {
        dict.insert(key(b"seq"), Value::Integer(seq));
    }
    if let Some(salt) = &item.salt {
        dict.insert(key(b"salt"), Value::Bytes(salt.clone()));
    }
}
