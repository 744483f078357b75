use super::error::DataError;
use super::id::Id;
use super::item::Item;
use bytes::Bytes;
use dashmap::DashMap;
use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Folds a newly discovered value into the one already held: `merge(old, new)`.
/// Both arguments and the result are bencoded values.
pub type MergeFn = Arc<dyn Fn(&Bytes, &Bytes) -> Bytes + Send + Sync>;

/// Called with the effective item each time its sequence number advances.
pub type Observer = Arc<dyn Fn(&Item) + Send + Sync>;

/// The live set of peers known for one info-hash.
///
/// Handed out by [`Dht::get_peers`](super::Dht::get_peers) and filled in as
/// `get_peers` replies and `announce_peer` queries arrive.
pub struct PeerSet {
    info_hash: Id,
    peers: Mutex<HashMap<SocketAddr, Instant>>,
    lifetime: Duration,
    capacity: usize,
}

impl PeerSet {
    fn new(info_hash: Id, lifetime: Duration, capacity: usize) -> Self {
        Self {
            info_hash,
            peers: Mutex::new(HashMap::new()),
            lifetime,
            capacity,
        }
    }

    pub fn info_hash(&self) -> &Id {
        &self.info_hash
    }

    /// Adds or refreshes a peer. Returns true if it was not known before.
    pub fn insert(&self, addr: SocketAddr) -> bool {
        let mut peers = self.peers.lock();
        let now = Instant::now();
        peers.retain(|_, seen| now.duration_since(*seen) < self.lifetime);

        if let Some(seen) = peers.get_mut(&addr) {
            *seen = now;
            return false;
        }
        if peers.len() >= self.capacity {
            return false;
        }
        peers.insert(addr, now);
        true
    }

    pub fn extend(&self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        addrs.into_iter().filter(|addr| self.insert(*addr)).count()
    }

    /// Current, unexpired peers.
    pub fn snapshot(&self) -> Vec<SocketAddr> {
        let mut peers = self.peers.lock();
        let now = Instant::now();
        peers.retain(|_, seen| now.duration_since(*seen) < self.lifetime);
        peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct DataState {
    item: Option<Item>,
    notified_seq: Option<i64>,
    notified: bool,
}

impl DataState {
    /// Records the notification and reports whether observers must run.
    fn advance(&mut self, item: &Item) -> bool {
        let due = match item.seq() {
            Some(seq) => !self.notified || self.notified_seq.map_or(true, |last| seq > last),
            None => !self.notified,
        };
        if due {
            self.notified = true;
            self.notified_seq = item.seq();
        }
        due
    }
}

/// The record kept for one hash: the best known item plus local publishing state.
///
/// Lock order: `state` before `observers`. Neither is held while observers
/// run, so an observer may read the record or register further observers.
pub struct DhtData {
    hash: Id,
    state: Mutex<DataState>,
    salt: RwLock<Bytes>,
    signer: RwLock<Option<SigningKey>>,
    merge: RwLock<Option<MergeFn>>,
    observers: Mutex<Vec<Observer>>,
}

impl DhtData {
    pub fn new(hash: Id) -> Self {
        Self {
            hash,
            state: Mutex::new(DataState {
                item: None,
                notified_seq: None,
                notified: false,
            }),
            salt: RwLock::new(Bytes::new()),
            signer: RwLock::new(None),
            merge: RwLock::new(None),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn hash(&self) -> &Id {
        &self.hash
    }

    pub fn current(&self) -> Option<Item> {
        self.state.lock().item.clone()
    }

    pub fn seq(&self) -> Option<i64> {
        self.state.lock().item.as_ref().and_then(Item::seq)
    }

    pub fn has_value(&self) -> bool {
        self.state.lock().item.is_some()
    }

    /// True when this node can re-sign the item (it owns the private key).
    pub fn is_publisher(&self) -> bool {
        self.signer.read().is_some()
    }

    /// Salt of a mutable record. Replies to `get` omit it, so it must be
    /// known before remote items can be checked against the hash.
    pub fn salt(&self) -> Bytes {
        self.salt.read().clone()
    }

    pub fn set_salt(&self, salt: Bytes) {
        *self.salt.write() = salt;
    }

    pub fn set_signer(&self, signer: SigningKey) {
        *self.signer.write() = Some(signer);
    }

    pub fn set_merge(&self, merge: MergeFn) {
        *self.merge.write() = Some(merge);
    }

    pub fn observe(&self, observer: Observer) {
        self.observers.lock().push(observer);
    }

    /// Registers `observer` and hands it the current item, if there is one.
    ///
    /// Registration happens under the record lock, so an update racing with
    /// it is seen exactly once: either here or through the notification.
    pub fn observe_current(&self, observer: Observer) {
        let current = {
            let state = self.state.lock();
            self.observers.lock().push(observer.clone());
            state.item.clone()
        };

        if let Some(item) = current {
            observer(&item);
        }
    }

    /// Applies an item learned from the network or from a `put`.
    ///
    /// Returns `Ok(true)` if the stored item changed. Rejected items leave the
    /// record untouched.
    pub fn apply(&self, incoming: Item) -> Result<bool, DataError> {
        self.apply_with_cas(incoming, None)
    }

    /// [`apply`](Self::apply) guarded by the sequence number the writer expects
    /// to replace. The guard is ignored while no item is stored.
    pub fn apply_with_cas(&self, incoming: Item, cas: Option<i64>) -> Result<bool, DataError> {
        incoming.verify_for(&self.hash)?;

        let pending = {
            let mut state = self.state.lock();
            let next = match &state.item {
                None => incoming,
                Some(existing) => {
                    if !existing.is_mutable() {
                        return Ok(false);
                    }
                    if let Some(expected) = cas {
                        if existing.seq() != Some(expected) {
                            return Err(DataError::CasMismatch {
                                expected,
                                current: existing.seq(),
                            });
                        }
                    }
                    if existing.seq().is_some() && incoming.seq().is_none() {
                        return Err(DataError::SequenceDisabled);
                    }
                    if incoming.seq() <= existing.seq() {
                        return Err(DataError::StaleSequence {
                            current: existing.seq(),
                            offered: incoming.seq(),
                        });
                    }
                    self.merged(existing, incoming)?
                }
            };

            trace!(hash = %self.hash, seq = ?next.seq(), "item stored");
            let due = state.advance(&next);
            state.item = Some(next.clone());
            due.then(|| (next, self.observers()))
        };

        if let Some((item, observers)) = pending {
            notify(&observers, &item);
        }
        Ok(true)
    }

    /// Publishes a new local value for a mutable item we hold the key for.
    ///
    /// The sequence number advances past the stored one; a configured merge
    /// function folds the stored value in first.
    pub fn publish(&self, encoded_value: Bytes) -> Result<Item, DataError> {
        let salt = self.salt();
        let signer = self.signer.read().clone().ok_or(DataError::NotSigner)?;
        let merge = self.merge.read().clone();

        let (item, observers) = {
            let mut state = self.state.lock();
            let (seq, value) = match &state.item {
                Some(existing) => {
                    let value = match &merge {
                        Some(merge) => merge(existing.value(), &encoded_value),
                        None => encoded_value,
                    };
                    (existing.seq().map_or(1, |s| s + 1), value)
                }
                None => (1, encoded_value),
            };

            let item = Item::signed(&signer, salt, seq, value)?;
            if item.target() != self.hash {
                return Err(DataError::HashMismatch);
            }
            let due = state.advance(&item);
            state.item = Some(item.clone());
            let observers = if due { self.observers() } else { Vec::new() };
            (item, observers)
        };

        notify(&observers, &item);
        Ok(item)
    }

    fn merged(&self, existing: &Item, incoming: Item) -> Result<Item, DataError> {
        let Some(merge) = self.merge.read().clone() else {
            return Ok(incoming);
        };
        let Some(signer) = self.signer.read().clone() else {
            return Ok(incoming);
        };

        let merged = merge(existing.value(), incoming.value());
        if merged == *incoming.value() {
            return Ok(incoming);
        }

        let seq = incoming.seq().map_or(1, |s| s + 1);
        debug!(hash = %self.hash, seq, "merged concurrent value");
        incoming.resigned(&signer, seq, merged)
    }

    /// Snapshot taken while `state` is held, run after it is released.
    fn observers(&self) -> Vec<Observer> {
        self.observers.lock().clone()
    }
}

fn notify(observers: &[Observer], item: &Item) {
    for observer in observers {
        observer(item);
    }
}

/// Peer lists and BEP-44 records, keyed by hash.
///
/// The two maps are locked independently of each other and of the routing table.
pub struct Storage {
    peers: DashMap<Id, Arc<PeerSet>>,
    data: DashMap<Id, Arc<DhtData>>,
    peer_lifetime: Duration,
    max_peers: usize,
}

impl Storage {
    pub fn new(peer_lifetime: Duration, max_peers: usize) -> Self {
        Self {
            peers: DashMap::new(),
            data: DashMap::new(),
            peer_lifetime,
            max_peers,
        }
    }

    pub fn peers(&self, info_hash: &Id) -> Option<Arc<PeerSet>> {
        self.peers.get(info_hash).map(|set| set.value().clone())
    }

    /// The peer set for `info_hash`, created on first use.
    pub fn peer_set(&self, info_hash: &Id) -> Arc<PeerSet> {
        self.peers
            .entry(info_hash.clone())
            .or_insert_with(|| {
                Arc::new(PeerSet::new(
                    info_hash.clone(),
                    self.peer_lifetime,
                    self.max_peers,
                ))
            })
            .clone()
    }

    pub fn announce(&self, info_hash: &Id, addr: SocketAddr) -> bool {
        self.peer_set(info_hash).insert(addr)
    }

    /// Up to `limit` stored peers of one address family.
    pub fn peers_for(&self, info_hash: &Id, ipv6: bool, limit: usize) -> Vec<SocketAddr> {
        self.peers(info_hash)
            .map(|set| {
                set.snapshot()
                    .into_iter()
                    .filter(|addr| addr.is_ipv6() == ipv6)
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn data(&self, hash: &Id) -> Option<Arc<DhtData>> {
        self.data.get(hash).map(|data| data.value().clone())
    }

    /// The record for `hash`, created empty on first use.
    pub fn data_entry(&self, hash: &Id) -> Arc<DhtData> {
        self.data
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(DhtData::new(hash.clone())))
            .clone()
    }

    /// Compare-and-set entry point used by inbound `put`.
    ///
    /// Without a stored item the new one is kept unconditionally (after
    /// verification); otherwise `cas`, when given, must equal the stored sequence number.
    pub fn update_data(&self, hash: &Id, cas: Option<i64>, item: Item) -> Result<bool, DataError> {
        item.verify_for(hash)?;
        self.data_entry(hash).apply_with_cas(item, cas)
    }

    /// Drops peer sets that are empty and no longer held outside storage,
    /// unless `keep` says the hash is still of interest.
    pub fn prune(&self, keep: impl Fn(&Id) -> bool) {
        self.peers
            .retain(|hash, set| keep(hash) || Arc::strong_count(set) > 1 || !set.is_empty());
        self.data
            .retain(|hash, data| keep(hash) || Arc::strong_count(data) > 1 || data.has_value());
    }

    pub fn peer_hashes(&self) -> usize {
        self.peers.len()
    }

    pub fn data_hashes(&self) -> usize {
        self.data.len()
    }
}
