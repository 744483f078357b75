use super::error::{DhtError, KrpcError};
use super::id::Id;
use crate::bencode::{decode_lenient, encode, Dict, Value};
use crate::constants::{
    COMPACT_NODE_V4_LEN, COMPACT_NODE_V6_LEN, COMPACT_PEER_V4_LEN, COMPACT_PEER_V6_LEN, ID_LEN,
};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub type TransactionId = Bytes;

/// A node as carried in `nodes`/`nodes6`: identifier plus endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Contact {
    pub id: Id,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: Id, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// Address families a querier wants nodes for (`want: ["n4", "n6"]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Want {
    pub v4: bool,
    pub v6: bool,
}

impl Want {
    pub fn to_value(self) -> Value {
        let mut list = Vec::new();
        if self.v4 {
            list.push(Value::string("n4"));
        }
        if self.v6 {
            list.push(Value::string("n6"));
        }
        Value::List(list)
    }

    /// Parses `want`, defaulting to the family of the socket the query came in on.
    pub fn from_args(args: &Dict, from: &SocketAddr) -> Self {
        match args.get(b"want".as_slice()).and_then(|v| v.as_list()) {
            Some(list) => Self {
                v4: list.iter().any(|v| v.as_str() == Some("n4")),
                v6: list.iter().any(|v| v.as_str() == Some("n6")),
            },
            None => Self {
                v4: from.is_ipv4(),
                v6: from.is_ipv6(),
            },
        }
    }
}

/// A KRPC message as it travels over UDP.
#[derive(Debug, Clone)]
pub enum Envelope {
    Query {
        tid: TransactionId,
        method: String,
        args: Dict,
    },
    Response {
        tid: TransactionId,
        ret: Dict,
        /// BEP-42 `ip`: the querier's address as seen by the responder.
        ip: Option<SocketAddr>,
    },
    Error {
        tid: TransactionId,
        error: KrpcError,
    },
}

impl Envelope {
    pub fn tid(&self) -> &TransactionId {
        match self {
            Envelope::Query { tid, .. }
            | Envelope::Response { tid, .. }
            | Envelope::Error { tid, .. } => tid,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode_lenient(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::InvalidMessage("expected dict".into()))?;

        let tid = dict.require_bytes(b"t")?.clone();
        let kind = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        match kind {
            "q" => {
                let method = dict
                    .get(b"q".as_slice())
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?
                    .to_string();
                let args = dict
                    .get(b"a".as_slice())
                    .and_then(|v| v.as_dict())
                    .cloned()
                    .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;
                Ok(Envelope::Query { tid, method, args })
            }
            "r" => {
                let ret = dict
                    .get(b"r".as_slice())
                    .and_then(|v| v.as_dict())
                    .cloned()
                    .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?;
                let ip = dict.bytes_at(b"ip").and_then(|b| decode_peer(b));
                Ok(Envelope::Response { tid, ret, ip })
            }
            "e" => {
                let list = dict
                    .get(b"e".as_slice())
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;
                let code = list
                    .first()
                    .and_then(|v| v.as_integer())
                    .unwrap_or(KrpcError::GENERIC);
                let message = list
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error");
                Ok(Envelope::Error {
                    tid,
                    error: KrpcError::new(code, message),
                })
            }
            other => Err(DhtError::InvalidMessage(format!(
                "unknown message type: {}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        let mut dict = Dict::new();
        dict.put(b"t", Value::Bytes(self.tid().clone()));

        match self {
            Envelope::Query { method, args, .. } => {
                dict.put(b"y", "q");
                dict.put(b"q", method.as_str());
                dict.put(b"a", args.clone());
            }
            Envelope::Response { ret, ip, .. } => {
                dict.put(b"y", "r");
                dict.put(b"r", ret.clone());
                if let Some(ip) = ip {
                    dict.put(b"ip", encode_peer(ip));
                }
            }
            Envelope::Error { error, .. } => {
                dict.put(b"y", "e");
                dict.put(
                    b"e",
                    Value::List(vec![
                        Value::Integer(error.code),
                        Value::string(&error.message),
                    ]),
                );
            }
        }

        Ok(encode(&Value::Dict(dict))?)
    }
}

/// Typed access to KRPC argument and return dictionaries.
pub trait DictExt {
    fn put(&mut self, key: &'static [u8], value: impl Into<Value>);
    fn bytes_at(&self, key: &[u8]) -> Option<&Bytes>;
    fn int_at(&self, key: &[u8]) -> Option<i64>;
    fn require_bytes(&self, key: &[u8]) -> Result<&Bytes, DhtError>;
    /// A mandatory 20-byte identifier.
    fn id_at(&self, key: &[u8]) -> Result<Id, DhtError>;
}

impl DictExt for Dict {
    fn put(&mut self, key: &'static [u8], value: impl Into<Value>) {
        self.insert(Bytes::from_static(key), value.into());
    }

    fn bytes_at(&self, key: &[u8]) -> Option<&Bytes> {
        self.get(key).and_then(|v| v.as_bytes())
    }

    fn int_at(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(|v| v.as_integer())
    }

    fn require_bytes(&self, key: &[u8]) -> Result<&Bytes, DhtError> {
        self.bytes_at(key).ok_or_else(|| {
            DhtError::InvalidMessage(format!("missing {}", String::from_utf8_lossy(key)))
        })
    }

    fn id_at(&self, key: &[u8]) -> Result<Id, DhtError> {
        Id::from_wire(self.require_bytes(key)?)
    }
}

/// Concatenated compact node infos of one family; nodes of the other family are skipped.
pub fn encode_nodes<'a>(contacts: impl IntoIterator<Item = &'a Contact>, ipv6: bool) -> Bytes {
    let mut out = Vec::new();
    for contact in contacts {
        if contact.addr.is_ipv6() != ipv6 {
            continue;
        }
        let Ok(id) = contact.id.to_wire() else {
            continue;
        };
        out.extend_from_slice(&id);
        out.extend_from_slice(&encode_peer(&contact.addr));
    }
    Bytes::from(out)
}

pub fn decode_nodes(data: &[u8], ipv6: bool) -> Vec<Contact> {
    let len = if ipv6 {
        COMPACT_NODE_V6_LEN
    } else {
        COMPACT_NODE_V4_LEN
    };
    data.chunks_exact(len)
        .filter_map(|chunk| {
            let addr = decode_peer(&chunk[ID_LEN..])?;
            if addr.port() == 0 {
                return None;
            }
            Some(Contact::new(Id::from_be_bytes(&chunk[..ID_LEN]), addr))
        })
        .collect()
}

/// Compact peer info: 4 or 16 address bytes followed by the port, big-endian.
pub fn encode_peer(addr: &SocketAddr) -> Bytes {
    let mut out = Vec::with_capacity(COMPACT_PEER_V6_LEN);
    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    Bytes::from(out)
}

pub fn decode_peer(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        COMPACT_PEER_V4_LEN => {
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        COMPACT_PEER_V6_LEN => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// The peer list of a `get_peers` reply.
pub fn decode_values(ret: &Dict) -> Vec<SocketAddr> {
    ret.get(b"values".as_slice())
        .and_then(|v| v.as_list())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_bytes())
                .filter_map(|b| decode_peer(b))
                .collect()
        })
        .unwrap_or_default()
}

/// Both node lists of a reply.
pub fn decode_reply_nodes(ret: &Dict) -> Vec<Contact> {
    let mut contacts = Vec::new();
    if let Some(nodes) = ret.bytes_at(b"nodes") {
        contacts.extend(decode_nodes(nodes, false));
    }
    if let Some(nodes6) = ret.bytes_at(b"nodes6") {
        contacts.extend(decode_nodes(nodes6, true));
    }
    contacts
}
