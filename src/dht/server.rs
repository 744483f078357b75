use super::bootstrap;
use super::bucket::Reason;
use super::config::DhtConfig;
use super::error::{DataError, DhtError, KrpcError};
use super::id::Id;
use super::interest::InterestFlags;
use super::item::{mutable_target, Item};
use super::message::{encode_nodes, encode_peer, DictExt, Want};
use super::routing::{RoutingTable, TableStats};
use super::storage::{DhtData, MergeFn, PeerSet, Storage};
use super::token::TokenIssuer;
use super::transport::{KrpcSocket, Transport};
use crate::bencode::{encode, Dict, Value};
use crate::constants::{
    K, MAX_PEERS_PER_REPLY, MAX_SALT_LEN, MAX_VALUE_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
use bytes::Bytes;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type QueryFn = fn(&Dht, &RoutingTable, SocketAddr, &Dict) -> Result<Dict, KrpcError>;

/// A mainline DHT node ([BEP-5]) with BEP-44 storage.
///
/// One [`RoutingTable`] runs per transport, normally one per address family.
/// They share the peer and item storage and the token issuer. Blocking
/// methods must be called from outside the tokio runtime.
///
/// # Examples
///
/// ```no_run
/// use mldht::dht::{Dht, DhtConfig, Id};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = tokio::runtime::Runtime::new()?;
/// let addrs = ["0.0.0.0:6881".parse()?];
/// let dht = Dht::bind(&addrs, DhtConfig::default(), runtime.handle().clone())?;
/// dht.start()?;
///
/// // Collect peers for a torrent while the lookup runs in the background
/// let peers = dht.get_peers(Id::from([0u8; 20]));
/// std::thread::sleep(std::time::Duration::from_secs(30));
/// println!("{} peers", peers.len());
/// # Ok(())
/// # }
/// ```
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
pub struct Dht {
    tables: Vec<Arc<RoutingTable>>,
    storage: Arc<Storage>,
    tokens: TokenIssuer,
    config: Arc<DhtConfig>,
    runtime: Handle,
    cancel: CancellationToken,
    bootstrap: Mutex<Option<JoinHandle<()>>>,
    /// Live value handles per hash. The interest goes away with the last one.
    watchers: Mutex<HashMap<Id, usize>>,
}

/// Keeps a value lookup or publication alive.
///
/// The refresh task re-registers the interest with a growing delay. Dropping
/// the handle or calling [`cancel`](Self::cancel) stops it.
pub struct ValueHandle {
    data: Arc<DhtData>,
    scope: CancellationToken,
}

impl ValueHandle {
    pub fn hash(&self) -> &Id {
        self.data.hash()
    }

    pub fn data(&self) -> &Arc<DhtData> {
        &self.data
    }

    pub fn current(&self) -> Option<Item> {
        self.data.current()
    }

    /// Publishes a new value under a mutable key we hold.
    pub fn publish(&self, value: &Value) -> Result<Item, DhtError> {
        Ok(self.data.publish(Bytes::from(encode(value)?))?)
    }

    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }
}

impl Drop for ValueHandle {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

impl Dht {
    pub fn new(
        transports: Vec<Arc<dyn Transport>>,
        config: DhtConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let storage = Arc::new(Storage::new(config.peer_lifetime, config.max_peers_per_hash));
        let cancel = CancellationToken::new();

        let want = Want {
            v4: transports.iter().any(|t| t.local_endpoint().is_ipv4()),
            v6: transports.iter().any(|t| t.local_endpoint().is_ipv6()),
        };

        let tables: Vec<_> = transports
            .into_iter()
            .map(|transport| {
                RoutingTable::new(
                    transport,
                    storage.clone(),
                    config.clone(),
                    runtime.clone(),
                    cancel.child_token(),
                )
            })
            .collect();

        for table in &tables {
            table.set_want(want);
            for sibling in &tables {
                if !Arc::ptr_eq(table, sibling) {
                    table.add_sibling(sibling);
                }
            }
        }

        let dht = Arc::new(Self {
            tables,
            storage,
            tokens: TokenIssuer::new(config.token_rotation),
            config,
            runtime,
            cancel,
            bootstrap: Mutex::new(None),
            watchers: Mutex::new(HashMap::new()),
        });

        for table in &dht.tables {
            Self::register_handlers(&dht, table);
        }
        dht
    }

    /// Binds a UDP socket per address.
    pub fn bind(
        addrs: &[SocketAddr],
        config: DhtConfig,
        runtime: Handle,
    ) -> Result<Arc<Self>, DhtError> {
        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        for addr in addrs {
            transports.push(KrpcSocket::bind(*addr, runtime.clone())?);
        }
        Ok(Self::new(transports, config, runtime))
    }

    /// Starts the worker threads and, if hosts are configured, bootstrapping.
    pub fn start(self: &Arc<Self>) -> Result<(), DhtError> {
        for table in &self.tables {
            table.start()?;
        }
        if !self.config.bootstrap_nodes.is_empty() {
            *self.bootstrap.lock() = Some(bootstrap::spawn(self)?);
        }
        info!("DHT started with {} routing tables", self.tables.len());
        Ok(())
    }

    /// Cancels all work and joins the worker threads.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for table in &self.tables {
            table.shutdown();
        }
        if let Some(handle) = self.bootstrap.lock().take() {
            if handle.join().is_err() {
                warn!("DHT bootstrap thread panicked");
            }
        }
        info!("DHT shut down");
    }

    pub fn tables(&self) -> &[Arc<RoutingTable>] {
        &self.tables
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn stats(&self) -> Vec<TableStats> {
        self.tables.iter().map(|table| table.stats()).collect()
    }

    /// True once some table holds `K` live nodes near its own identifier.
    pub fn is_booted(&self) -> bool {
        self.tables.iter().any(|table| table.is_booted())
    }

    fn tables_for<'a>(
        &'a self,
        endpoint: &'a SocketAddr,
    ) -> impl Iterator<Item = &'a Arc<RoutingTable>> + 'a {
        self.tables
            .iter()
            .filter(move |table| table.transport().can_send_to(endpoint))
    }

    pub fn ping_endpoint(&self, endpoint: SocketAddr) -> Result<(), DhtError> {
        self.tables_for(&endpoint)
            .next()
            .ok_or(DhtError::Unreachable(endpoint))?
            .ping_endpoint(endpoint)
    }

    /// Queues an endpoint of unknown identity to be pinged.
    pub fn consider_endpoint(&self, endpoint: SocketAddr) {
        for table in self.tables_for(&endpoint) {
            table.consider_endpoint(endpoint);
        }
    }

    /// Offers a node to every table that can reach it, optionally registering
    /// an interest first so the node is weighed against it.
    pub fn consider(
        &self,
        id: Option<Id>,
        endpoint: SocketAddr,
        interest: Option<(Id, InterestFlags)>,
        reason: Reason,
    ) -> bool {
        let mut admitted = false;
        for table in self.tables_for(&endpoint) {
            if let Some((hash, flags)) = &interest {
                table.add_interest(hash.clone(), *flags);
            }
            admitted |= table.consider_node(id.clone(), endpoint, reason);
        }
        admitted
    }

    pub fn add_interest(&self, hash: &Id, flags: InterestFlags) {
        for table in &self.tables {
            table.add_interest(hash.clone(), flags);
        }
    }

    pub fn remove_interest(&self, hash: &Id) {
        for table in &self.tables {
            table.remove_interest(hash);
        }
    }

    /// Starts collecting peers for `info_hash`. The returned set fills in as
    /// replies arrive; [`stop_peers`](Self::stop_peers) ends the lookup.
    pub fn get_peers(&self, info_hash: Id) -> Arc<PeerSet> {
        self.add_interest(&info_hash, InterestFlags::peers());
        self.storage.peer_set(&info_hash)
    }

    /// Like [`get_peers`](Self::get_peers), additionally announcing our port
    /// to every node that hands out a token.
    pub fn announce(&self, info_hash: Id) -> Arc<PeerSet> {
        self.add_interest(&info_hash, InterestFlags::announce());
        self.storage.peer_set(&info_hash)
    }

    pub fn stop_peers(&self, info_hash: &Id) {
        self.remove_interest(info_hash);
    }

    /// Looks up an immutable item. `on_value` runs once the item is known;
    /// the lookup then stops.
    pub fn get_value(
        self: &Arc<Self>,
        hash: Id,
        on_value: impl Fn(&Item) + Send + Sync + 'static,
    ) -> ValueHandle {
        let data = self.storage.data_entry(&hash);
        data.observe_current(Arc::new(on_value));
        self.watch(data, InterestFlags::data(), true)
    }

    /// Follows a mutable item. `on_value` runs for every newer sequence number.
    pub fn get_mutable(
        self: &Arc<Self>,
        public_key: [u8; PUBLIC_KEY_LEN],
        salt: Bytes,
        on_value: impl Fn(&Item) + Send + Sync + 'static,
    ) -> ValueHandle {
        let data = self.storage.data_entry(&mutable_target(&public_key, &salt));
        data.set_salt(salt);
        data.observe_current(Arc::new(on_value));
        self.watch(data, InterestFlags::data(), false)
    }

    /// Stores an immutable item locally and keeps pushing it to the closest nodes.
    pub fn put_immutable(self: &Arc<Self>, value: &Value) -> Result<ValueHandle, DhtError> {
        let item = Item::immutable(value)?;
        let data = self.storage.data_entry(&item.target());
        data.apply(item)?;
        Ok(self.watch(data, InterestFlags::publish(), false))
    }

    /// Signs and publishes a mutable item. With `merge`, values found on the
    /// network are folded into ours instead of replacing them.
    pub fn put_mutable(
        self: &Arc<Self>,
        signer: SigningKey,
        salt: Bytes,
        value: &Value,
        merge: Option<MergeFn>,
    ) -> Result<ValueHandle, DhtError> {
        let key = signer.verifying_key().to_bytes();
        let data = self.storage.data_entry(&mutable_target(&key, &salt));
        data.set_salt(salt);
        data.set_signer(signer);
        if let Some(merge) = merge {
            data.set_merge(merge);
        }
        data.publish(Bytes::from(encode(value)?))?;
        Ok(self.watch(data, InterestFlags::publish(), false))
    }

    fn watch(
        self: &Arc<Self>,
        data: Arc<DhtData>,
        flags: InterestFlags,
        until_found: bool,
    ) -> ValueHandle {
        let scope = self.cancel.child_token();
        if until_found {
            if data.has_value() {
                scope.cancel();
            } else {
                let found = scope.clone();
                data.observe(Arc::new(move |_| found.cancel()));
            }
        }

        let dht = Arc::downgrade(self);
        let hash = data.hash().clone();
        let token = scope.clone();
        *self.watchers.lock().entry(hash.clone()).or_insert(0) += 1;
        let mut delay = self.config.value_refresh_min;

        self.runtime.spawn(async move {
            while !token.is_cancelled() {
                let Some(strong) = dht.upgrade() else {
                    return;
                };
                let next = strong.config.next_refresh_delay(delay);
                let target = hash.clone();
                let registered =
                    tokio::task::spawn_blocking(move || strong.add_interest(&target, flags)).await;
                if registered.is_err() {
                    break;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = next;
            }

            if let Some(dht) = dht.upgrade() {
                debug!("value lookup {} stopped", hash);
                dht.release_watch(&hash);
            }
        });

        ValueHandle { data, scope }
    }

    /// Drops one handle's claim on `hash`, removing the interest with the last.
    fn release_watch(&self, hash: &Id) {
        let mut watchers = self.watchers.lock();
        let Some(count) = watchers.get_mut(hash) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            watchers.remove(hash);
            self.remove_interest(hash);
        }
    }

    fn register_handlers(dht: &Arc<Self>, table: &Arc<RoutingTable>) {
        let handlers: [(&str, QueryFn); 6] = [
            ("ping", Dht::on_ping),
            ("find_node", Dht::on_find_node),
            ("get_peers", Dht::on_get_peers),
            ("announce_peer", Dht::on_announce_peer),
            ("get", Dht::on_get),
            ("put", Dht::on_put),
        ];

        for (method, handler) in handlers {
            let weak_dht = Arc::downgrade(dht);
            let weak_table = Arc::downgrade(table);
            table.transport().register(
                method,
                Arc::new(move |from: SocketAddr, args: Dict| -> Result<Dict, KrpcError> {
                    let (Some(dht), Some(table)) = (weak_dht.upgrade(), weak_table.upgrade())
                    else {
                        return Err(KrpcError::new(KrpcError::SERVER, "shutting down"));
                    };
                    let querier = args.id_at(b"id")?;
                    dht.note_querier(&table, querier, from);
                    handler(&dht, &table, from, &args)
                }),
            );
        }
    }

    /// Considers the querier off the handler thread, since admission may
    /// have to ping other nodes first.
    fn note_querier(&self, table: &Arc<RoutingTable>, id: Id, from: SocketAddr) {
        let table = table.clone();
        self.runtime.spawn_blocking(move || {
            table.consider_node(Some(id), from, Reason::Talked);
        });
    }

    fn reply(table: &RoutingTable) -> Result<Dict, KrpcError> {
        let mut ret = Dict::new();
        ret.put(b"id", Bytes::copy_from_slice(&table.local_id().to_wire()?));
        Ok(ret)
    }

    fn add_nodes(&self, ret: &mut Dict, target: &Id, want: Want) {
        for table in &self.tables {
            let ipv6 = table.transport().local_endpoint().is_ipv6();
            if (ipv6 && !want.v6) || (!ipv6 && !want.v4) {
                continue;
            }
            let contacts = table.closest_contacts(target, K);
            let key = if ipv6 {
                b"nodes6".as_slice()
            } else {
                b"nodes".as_slice()
            };
            ret.put(key, encode_nodes(&contacts, ipv6));
        }
    }

    fn on_ping(
        &self,
        table: &RoutingTable,
        _from: SocketAddr,
        _args: &Dict,
    ) -> Result<Dict, KrpcError> {
        Self::reply(table)
    }

    fn on_find_node(
        &self,
        table: &RoutingTable,
        from: SocketAddr,
        args: &Dict,
    ) -> Result<Dict, KrpcError> {
        let target = args
            .id_at(b"target")
            .or_else(|_| args.id_at(b"info_hash"))?;
        let mut ret = Self::reply(table)?;
        self.add_nodes(&mut ret, &target, Want::from_args(args, &from));
        Ok(ret)
    }

    fn on_get_peers(
        &self,
        table: &RoutingTable,
        from: SocketAddr,
        args: &Dict,
    ) -> Result<Dict, KrpcError> {
        let info_hash = args.id_at(b"info_hash")?;
        let mut ret = Self::reply(table)?;
        ret.put(b"token", self.tokens.issue(&from, &info_hash));

        let peers = self
            .storage
            .peers_for(&info_hash, from.is_ipv6(), MAX_PEERS_PER_REPLY);
        if !peers.is_empty() {
            let values: Vec<Value> = peers
                .iter()
                .map(|peer| Value::Bytes(encode_peer(peer)))
                .collect();
            ret.put(b"values", values);
        }

        self.add_nodes(&mut ret, &info_hash, Want::from_args(args, &from));
        Ok(ret)
    }

    fn on_announce_peer(
        &self,
        table: &RoutingTable,
        from: SocketAddr,
        args: &Dict,
    ) -> Result<Dict, KrpcError> {
        let info_hash = args.id_at(b"info_hash")?;
        let token = args
            .bytes_at(b"token")
            .ok_or_else(|| KrpcError::protocol("missing token"))?;
        if !self.tokens.validate(&from, &info_hash, token) {
            debug!("Rejecting announce_peer from {} - invalid token", from);
            return Err(KrpcError::protocol("invalid token"));
        }

        let port = if args.int_at(b"implied_port") == Some(1) {
            from.port()
        } else {
            args.int_at(b"port")
                .and_then(|port| u16::try_from(port).ok())
                .filter(|port| *port != 0)
                .ok_or_else(|| KrpcError::protocol("invalid port"))?
        };

        let peer = SocketAddr::new(from.ip(), port);
        self.storage.announce(&info_hash, peer);
        debug!("Stored announced peer {} for {}", peer, info_hash);
        Self::reply(table)
    }

    fn on_get(
        &self,
        table: &RoutingTable,
        from: SocketAddr,
        args: &Dict,
    ) -> Result<Dict, KrpcError> {
        let target = args.id_at(b"target")?;
        let mut ret = Self::reply(table)?;
        ret.put(b"token", self.tokens.issue(&from, &target));
        self.add_nodes(&mut ret, &target, Want::from_args(args, &from));

        let Some(item) = self.storage.data(&target).and_then(|data| data.current()) else {
            return Ok(ret);
        };
        let value = item
            .decoded_value()
            .map_err(|e| KrpcError::new(KrpcError::SERVER, e.to_string()))?;

        match (item.key(), item.sig(), item.seq()) {
            (Some(key), Some(sig), Some(seq)) => {
                ret.put(b"seq", seq);
                if args.int_at(b"seq").map_or(true, |known| known < seq) {
                    ret.put(b"k", Bytes::copy_from_slice(key));
                    ret.put(b"sig", Bytes::copy_from_slice(sig));
                    ret.put(b"v", value);
                }
            }
            _ => ret.put(b"v", value),
        }
        Ok(ret)
    }

    fn on_put(
        &self,
        table: &RoutingTable,
        from: SocketAddr,
        args: &Dict,
    ) -> Result<Dict, KrpcError> {
        let value = args
            .get(b"v".as_slice())
            .ok_or_else(|| KrpcError::protocol("missing v"))?;
        let encoded = Bytes::from(encode(value).map_err(|e| KrpcError::protocol(e.to_string()))?);
        if encoded.len() > MAX_VALUE_LEN {
            return Err(DataError::ValueTooLarge.into());
        }
        let token = args
            .bytes_at(b"token")
            .ok_or_else(|| KrpcError::protocol("missing token"))?;

        let item = match args.bytes_at(b"k") {
            None => Item::immutable_encoded(encoded)?,
            Some(key) => {
                let key: [u8; PUBLIC_KEY_LEN] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| KrpcError::from(DataError::InvalidKey))?;
                let sig: [u8; SIGNATURE_LEN] = args
                    .bytes_at(b"sig")
                    .and_then(|sig| sig.as_ref().try_into().ok())
                    .ok_or_else(|| KrpcError::from(DataError::InvalidSignature))?;
                let seq = args
                    .int_at(b"seq")
                    .ok_or_else(|| KrpcError::protocol("missing seq"))?;
                let salt = args.bytes_at(b"salt").cloned().unwrap_or_default();
                if salt.len() > MAX_SALT_LEN {
                    return Err(DataError::SaltTooLarge.into());
                }
                Item::from_parts(key, salt, Some(seq), sig, encoded)
            }
        };

        let target = item.target();
        if !self.tokens.validate(&from, &target, token) {
            debug!("Rejecting put from {} - invalid token", from);
            return Err(KrpcError::protocol("invalid token"));
        }

        let stored = self.storage.data(&target).and_then(|data| data.current());
        if stored.as_ref() == Some(&item) {
            return Self::reply(table);
        }

        self.storage
            .update_data(&target, args.int_at(b"cas"), item)
            .map_err(|e| {
                debug!("Rejecting put from {} for {}: {}", from, target, e);
                KrpcError::from(e)
            })?;
        Self::reply(table)
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
