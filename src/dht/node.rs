use super::bucket::Reason;
use super::error::{DataError, DhtError};
use super::id::Id;
use super::item::Item;
use super::message::{decode_reply_nodes, decode_values, Contact, DictExt};
use super::routing::RoutingTable;
use super::storage::DhtData;
use crate::bencode::{decode, encode, Dict, Value};
use crate::constants::{MAX_NODE_FAILURES, MAX_SYNC_ROUNDS, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Answered recently and has not failed since.
    Good,
    /// Answered at some point, but not recently or with failures since.
    Questionable,
    /// Never answered, or failed too often in a row.
    Bad,
}

#[derive(Debug, Default)]
struct Activity {
    last_query: Option<Instant>,
    last_response: Option<Instant>,
    failures: u8,
}

/// A remote endpoint, with an identifier once one is known.
///
/// One `Node` exists per endpoint and is shared by every bucket, interest and
/// queue that refers to it, so liveness and tokens are tracked once.
pub struct Node {
    id: RwLock<Option<Id>>,
    endpoint: RwLock<SocketAddr>,
    activity: Mutex<Activity>,
    tokens: Mutex<HashMap<Id, Bytes>>,
}

/// What a `get_peers` exchange produced.
#[derive(Debug, Default)]
pub struct PeersReply {
    pub contacts: Vec<Contact>,
    pub peers: Vec<SocketAddr>,
    pub has_token: bool,
}

/// What a `get` exchange produced.
#[derive(Debug, Default)]
pub struct GetReply {
    pub contacts: Vec<Contact>,
    pub has_token: bool,
    /// The responder holds a value.
    pub has_value: bool,
    /// Sequence number the responder reported, mutable items only.
    pub seq: Option<i64>,
    /// The local record changed as a result.
    pub updated: bool,
}

impl Node {
    pub fn new(id: Option<Id>, endpoint: SocketAddr) -> Self {
        Self {
            id: RwLock::new(id),
            endpoint: RwLock::new(endpoint),
            activity: Mutex::new(Activity::default()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Option<Id> {
        self.id.read().clone()
    }

    pub fn endpoint(&self) -> SocketAddr {
        *self.endpoint.read()
    }

    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.write() = endpoint;
    }

    /// Records the identifier reported for this endpoint. An identifier that
    /// differs from a known one is refused.
    pub fn learn_id(&self, id: Id) -> bool {
        let mut current = self.id.write();
        match &*current {
            Some(known) => *known == id,
            None => {
                *current = Some(id);
                true
            }
        }
    }

    /// XOR distance to `target`; `None` while the identifier is unknown.
    pub fn distance_to(&self, target: &Id) -> Option<Id> {
        self.id.read().as_ref().map(|id| id.distance(target))
    }

    pub fn liveness(&self, window: Duration) -> Liveness {
        let activity = self.activity.lock();
        let Some(last_response) = activity.last_response else {
            return Liveness::Bad;
        };
        let last_active = activity.last_query.map_or(last_response, |q| q.max(last_response));
        if activity.failures == 0 && last_active.elapsed() < window {
            Liveness::Good
        } else {
            Liveness::Questionable
        }
    }

    pub fn is_bad(&self) -> bool {
        self.activity.lock().last_response.is_none()
    }

    pub fn has_responded(&self) -> bool {
        !self.is_bad()
    }

    /// Most recent time we heard from the node, as querier or responder.
    pub fn last_active(&self) -> Option<Instant> {
        let activity = self.activity.lock();
        match (activity.last_query, activity.last_response) {
            (Some(q), Some(r)) => Some(q.max(r)),
            (q, r) => q.or(r),
        }
    }

    pub fn failures(&self) -> u8 {
        self.activity.lock().failures
    }

    /// The node sent us a query.
    pub fn record_query(&self) {
        self.activity.lock().last_query = Some(Instant::now());
    }

    pub fn record_response(&self) {
        let mut activity = self.activity.lock();
        activity.last_response = Some(Instant::now());
        activity.failures = 0;
    }

    /// Counts a failed exchange. Enough consecutive failures make the node bad.
    pub fn record_failure(&self) {
        let mut activity = self.activity.lock();
        activity.failures = activity.failures.saturating_add(1);
        if activity.failures >= MAX_NODE_FAILURES {
            activity.last_response = None;
        }
    }

    pub fn token(&self, hash: &Id) -> Option<Bytes> {
        self.tokens.lock().get(hash).cloned()
    }

    fn store_token(&self, hash: &Id, ret: &Dict) -> bool {
        match ret.bytes_at(b"token") {
            Some(token) => {
                self.tokens.lock().insert(hash.clone(), token.clone());
                true
            }
            None => false,
        }
    }

    pub fn contact(&self) -> Option<Contact> {
        Some(Contact::new(self.id()?, self.endpoint()))
    }

    pub fn ping(self: &Arc<Self>, table: &RoutingTable) -> Result<(), DhtError> {
        self.query(table, "ping", Dict::new())?;
        table.on_response(self, Reason::Responded);
        Ok(())
    }

    pub fn find_nodes(
        self: &Arc<Self>,
        table: &RoutingTable,
        target: &Id,
    ) -> Result<Vec<Contact>, DhtError> {
        let mut args = Dict::new();
        args.put(b"target", Bytes::copy_from_slice(&target.to_wire()?));
        args.put(b"want", table.want().to_value());

        let ret = self.query(table, "find_node", args)?;
        table.on_response(self, Reason::Responded);
        Ok(self.contacts(table, &ret))
    }

    pub fn get_peers(
        self: &Arc<Self>,
        table: &RoutingTable,
        info_hash: &Id,
    ) -> Result<PeersReply, DhtError> {
        let mut args = Dict::new();
        args.put(b"info_hash", Bytes::copy_from_slice(&info_hash.to_wire()?));
        args.put(b"want", table.want().to_value());

        let ret = self.query(table, "get_peers", args)?;
        let has_token = self.store_token(info_hash, &ret);
        table.on_response(self, reason_for(has_token));

        Ok(PeersReply {
            contacts: self.contacts(table, &ret),
            peers: decode_values(&ret),
            has_token,
        })
    }

    /// Announces the local socket's port for `info_hash`, using the token
    /// from an earlier [`get_peers`](Self::get_peers).
    pub fn announce_peer(
        self: &Arc<Self>,
        table: &RoutingTable,
        info_hash: &Id,
    ) -> Result<(), DhtError> {
        let token = self.token(info_hash).ok_or(DhtError::NoToken)?;

        let mut args = Dict::new();
        args.put(b"info_hash", Bytes::copy_from_slice(&info_hash.to_wire()?));
        args.put(b"implied_port", 1i64);
        args.put(b"port", i64::from(table.transport().local_endpoint().port()));
        args.put(b"token", token);

        self.query(table, "announce_peer", args)?;
        table.on_response(self, Reason::Cooperated);
        Ok(())
    }

    /// Fetches the item stored under `data`'s hash and applies it locally.
    pub fn get(
        self: &Arc<Self>,
        table: &RoutingTable,
        data: &DhtData,
    ) -> Result<GetReply, DhtError> {
        let hash = data.hash();
        let mut args = Dict::new();
        args.put(b"target", Bytes::copy_from_slice(&hash.to_wire()?));
        args.put(b"want", table.want().to_value());
        if let Some(seq) = data.seq() {
            args.put(b"seq", seq);
        }

        let ret = self.query(table, "get", args)?;
        let has_token = self.store_token(hash, &ret);
        let seq = ret.int_at(b"seq");

        let mut reply = GetReply {
            contacts: self.contacts(table, &ret),
            has_token,
            has_value: false,
            seq,
            updated: false,
        };

        if let Some(value) = ret.get(b"v".as_slice()) {
            reply.has_value = true;
            let item = item_from_reply(data, value, &ret).inspect_err(|_| self.record_failure())?;
            match data.apply(item) {
                Ok(changed) => reply.updated = changed,
                Err(DataError::StaleSequence { .. }) => {}
                Err(e) => {
                    debug!("Rejected item from {}: {}", self.endpoint(), e);
                    self.record_failure();
                    return Err(e.into());
                }
            }
        }

        table.on_response(self, reason_for(has_token));
        Ok(reply)
    }

    /// Stores the local item on the node. `cas` guards against a concurrent
    /// writer having replaced the sequence number we last saw.
    pub fn put(
        self: &Arc<Self>,
        table: &RoutingTable,
        data: &DhtData,
        cas: Option<i64>,
    ) -> Result<(), DhtError> {
        let token = self.token(data.hash()).ok_or(DhtError::NoToken)?;
        let item = data.current().ok_or(DhtError::NoValue)?;

        let mut args = Dict::new();
        args.put(b"token", token);
        args.put(b"v", decode(item.value())?);
        if let (Some(key), Some(sig), Some(seq)) = (item.key(), item.sig(), item.seq()) {
            args.put(b"k", Bytes::copy_from_slice(key));
            args.put(b"sig", Bytes::copy_from_slice(sig));
            args.put(b"seq", seq);
            if !item.salt().is_empty() {
                args.put(b"salt", item.salt().clone());
            }
            if let Some(cas) = cas {
                args.put(b"cas", cas);
            }
        }

        self.query(table, "put", args)?;
        table.on_response(self, Reason::Cooperated);
        Ok(())
    }

    /// Brings the node and the local record to the same item.
    ///
    /// A newer remote item is merged in by `get`; a missing or older one is
    /// overwritten by `put`. A `put` refused because someone else wrote in
    /// between starts another round, up to [`MAX_SYNC_ROUNDS`].
    pub fn sync(self: &Arc<Self>, table: &RoutingTable, data: &DhtData) -> Result<(), DhtError> {
        for _ in 0..MAX_SYNC_ROUNDS {
            let reply = self.get(table, data)?;
            if !data.has_value() {
                return Ok(());
            }

            let behind = match data.seq() {
                Some(local) => reply.seq.map_or(true, |remote| remote < local),
                None => !reply.has_value,
            };
            if !behind {
                return Ok(());
            }

            match self.put(table, data, reply.seq) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_write_conflict() => {
                    debug!("put to {} raced another writer, retrying", self.endpoint());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn contacts(&self, table: &RoutingTable, ret: &Dict) -> Vec<Contact> {
        let local = table.local_id();
        decode_reply_nodes(ret)
            .into_iter()
            .filter(|contact| contact.id != local)
            .collect()
    }

    fn query(&self, table: &RoutingTable, method: &str, mut args: Dict) -> Result<Dict, DhtError> {
        args.put(b"id", Bytes::copy_from_slice(&table.local_id().to_wire()?));
        let endpoint = self.endpoint();

        let result = table
            .transport()
            .call(method, args, endpoint, table.config().rpc_timeout, table.cancel_token())
            .and_then(|ret| {
                let id = ret.id_at(b"id")?;
                if id == table.local_id() || !self.learn_id(id) {
                    return Err(DhtError::InvalidMessage("unexpected responder id".into()));
                }
                Ok(ret)
            });

        match result {
            Ok(ret) => {
                self.record_response();
                Ok(ret)
            }
            Err(DhtError::Cancelled) => Err(DhtError::Cancelled),
            Err(e) => {
                if !e.is_write_conflict() {
                    self.record_failure();
                }
                debug!("{} to {} failed: {}", method, endpoint, e);
                Err(e)
            }
        }
    }
}

fn reason_for(has_token: bool) -> Reason {
    if has_token {
        Reason::Cooperated
    } else {
        Reason::Responded
    }
}

fn item_from_reply(data: &DhtData, value: &Value, ret: &Dict) -> Result<Item, DhtError> {
    let encoded = Bytes::from(encode(value)?);
    let Some(key) = ret.bytes_at(b"k") else {
        return Ok(Item::immutable_encoded(encoded)?);
    };

    let key: [u8; PUBLIC_KEY_LEN] = key
        .as_ref()
        .try_into()
        .map_err(|_| DhtError::Data(DataError::InvalidKey))?;
    let sig: [u8; SIGNATURE_LEN] = ret
        .require_bytes(b"sig")?
        .as_ref()
        .try_into()
        .map_err(|_| DhtError::Data(DataError::InvalidSignature))?;

    Ok(Item::from_parts(key, data.salt(), ret.int_at(b"seq"), sig, encoded))
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}
