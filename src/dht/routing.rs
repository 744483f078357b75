use super::bucket::{Admission, Bucket, Reason};
use super::config::DhtConfig;
use super::error::DhtError;
use super::id::Id;
use super::interest::{Interest, InterestFlags};
use super::message::{Contact, Want};
use super::node::{Liveness, Node};
use super::queue::{DistinctQueue, RejectCache};
use super::secure_id::{generate_secure_node_id, validate_node_id};
use super::storage::Storage;
use super::transport::Transport;
use crate::constants::{K, MAX_SPLITS};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A point-in-time summary of one routing table, logged periodically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub buckets: usize,
    pub good: usize,
    pub questionable: usize,
    pub bad: usize,
    pub interests: usize,
    pub candidates: usize,
    pub queued: usize,
    pub known_endpoints: usize,
    pub rejected: usize,
}

impl TableStats {
    pub fn nodes(&self) -> usize {
        self.good + self.questionable + self.bad
    }
}

/// The routing state reachable through one transport.
///
/// Routing buckets partition `[0, 2^160)` and split only along the path to
/// the local identifier. Interests keep their own centered buckets. Every
/// node admitted anywhere is queued for the search workers, which run the
/// per-interest lookups.
///
/// Lock order is table (`buckets`, then `interests`, then `local_id`) before
/// bucket. No lock is held across a remote call.
pub struct RoutingTable {
    local_id: RwLock<Id>,
    transport: Arc<dyn Transport>,
    storage: Arc<Storage>,
    config: Arc<DhtConfig>,
    runtime: Handle,
    cancel: CancellationToken,
    buckets: RwLock<Vec<Arc<Bucket>>>,
    interests: RwLock<HashMap<Id, Arc<Interest>>>,
    registry: DashMap<SocketAddr, Weak<Node>>,
    work: DistinctQueue<SocketAddr, Arc<Node>>,
    refresh: DistinctQueue<Id, (Id, Id)>,
    rejected: RejectCache,
    want: RwLock<Want>,
    siblings: RwLock<Vec<Weak<RoutingTable>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingTable {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Arc<Storage>,
        config: Arc<DhtConfig>,
        runtime: Handle,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let local_id = transport
            .public_endpoint()
            .map(|endpoint| generate_secure_node_id(endpoint.ip()))
            .unwrap_or_else(Id::generate);
        let local = transport.local_endpoint();

        let mut interests = HashMap::new();
        interests.insert(
            local_id.clone(),
            Arc::new(Interest::new(
                local_id.clone(),
                InterestFlags {
                    persistent: true,
                    ..InterestFlags::lookup()
                },
                config.interest_queue_capacity,
            )),
        );

        let table = Arc::new(Self {
            local_id: RwLock::new(local_id.clone()),
            storage,
            runtime,
            cancel,
            buckets: RwLock::new(vec![Arc::new(Bucket::new(Id::zero(), Id::end()))]),
            interests: RwLock::new(interests),
            registry: DashMap::new(),
            work: DistinctQueue::new(config.work_queue_capacity),
            refresh: DistinctQueue::new(config.work_queue_capacity),
            rejected: RejectCache::new(config.reject_capacity, config.reject_ttl),
            want: RwLock::new(Want {
                v4: local.is_ipv4(),
                v6: local.is_ipv6(),
            }),
            siblings: RwLock::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            config,
            transport,
        });

        let weak = Arc::downgrade(&table);
        table
            .transport
            .on_public_endpoint_change(Box::new(move |endpoint| {
                if let Some(table) = weak.upgrade() {
                    table.set_public_endpoint(endpoint);
                }
            }));

        info!("DHT table on {} with id {}", local, local_id);
        table
    }

    pub fn local_id(&self) -> Id {
        self.local_id.read().clone()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Address families requested in outgoing `want` lists.
    pub fn want(&self) -> Want {
        *self.want.read()
    }

    pub fn set_want(&self, want: Want) {
        *self.want.write() = want;
    }

    /// Links a table of the other address family, so contacts it cannot
    /// reach are handed over instead of dropped.
    pub fn add_sibling(&self, sibling: &Arc<RoutingTable>) {
        self.siblings.write().push(Arc::downgrade(sibling));
    }

    /// Starts the search, refresh, scheduling and statistics threads.
    pub fn start(self: &Arc<Self>) -> Result<(), DhtError> {
        let mut workers = self.workers.lock();
        let family = if self.transport.local_endpoint().is_ipv6() {
            "v6"
        } else {
            "v4"
        };

        for i in 0..self.config.search_workers {
            let table = self.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("dht-{}-search-{}", family, i))
                    .spawn(move || table.search_worker())?,
            );
        }
        for i in 0..self.config.refresh_workers {
            let table = self.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("dht-{}-refresh-{}", family, i))
                    .spawn(move || table.refresh_worker())?,
            );
        }

        let table = self.clone();
        workers.push(
            std::thread::Builder::new()
                .name(format!("dht-{}-scheduler", family))
                .spawn(move || table.refresh_scheduler())?,
        );
        let table = self.clone();
        workers.push(
            std::thread::Builder::new()
                .name(format!("dht-{}-stats", family))
                .spawn(move || table.stats_reporter())?,
        );

        debug!("DHT {} table started {} threads", family, workers.len());
        Ok(())
    }

    /// Cancels the table's scope and joins its threads.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.work.wake_all();
        self.refresh.wake_all();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = std::thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("DHT worker thread panicked");
            }
        }
    }

    pub fn buckets(&self) -> Vec<Arc<Bucket>> {
        self.buckets.read().clone()
    }

    pub fn interest(&self, hash: &Id) -> Option<Arc<Interest>> {
        self.interests.read().get(hash).cloned()
    }

    pub fn interests(&self) -> Vec<Arc<Interest>> {
        self.interests.read().values().cloned().collect()
    }

    /// The bucket whose range holds `id`.
    pub fn bucket_for(&self, id: &Id) -> Result<Arc<Bucket>, DhtError> {
        self.buckets
            .read()
            .iter()
            .find(|bucket| bucket.in_range(id))
            .cloned()
            .ok_or_else(|| DhtError::Corrupted(format!("no bucket covers {}", id)))
    }

    /// Checks that the buckets tile `[0, 2^160)` without gaps or overlaps.
    pub fn check_coverage(&self) -> Result<(), DhtError> {
        let buckets = self.buckets.read();
        let mut expected = Id::zero();
        for bucket in buckets.iter() {
            let (min, max) = bucket.range();
            if min != expected || max <= min {
                return Err(DhtError::Corrupted(format!(
                    "bucket [{}, {}) does not start at {}",
                    min, max, expected
                )));
            }
            expected = max;
        }
        if expected != Id::end() {
            return Err(DhtError::Corrupted(format!("buckets end at {}", expected)));
        }
        Ok(())
    }

    /// Splits the bucket at `index`, which must hold the local identifier.
    pub fn split_bucket_at(&self, index: usize) -> Result<(), DhtError> {
        let local = self.local_id();
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .get(index)
            .cloned()
            .ok_or_else(|| DhtError::Corrupted(format!("no bucket at index {}", index)))?;
        let upper = bucket.split(&local)?;
        buckets.insert(index + 1, Arc::new(upper));
        Ok(())
    }

    /// Queues a bare endpoint to be pinged so its identifier can be learned.
    pub fn consider_endpoint(&self, endpoint: SocketAddr) {
        if !self.transport.can_send_to(&endpoint) {
            return;
        }
        let node = self.node_for(None, endpoint);
        if node.id().is_none() {
            self.work.push(endpoint, node);
        }
    }

    /// Offers a node to the routing buckets and to every interest.
    ///
    /// Returns true if it was admitted anywhere, in which case it is also
    /// queued for the search workers.
    pub fn consider_node(&self, id: Option<Id>, endpoint: SocketAddr, reason: Reason) -> bool {
        let Some(id) = id else {
            self.consider_endpoint(endpoint);
            return false;
        };
        if id == self.local_id() || !self.transport.can_send_to(&endpoint) {
            return false;
        }

        let node = self.node_for(Some(&id), endpoint);
        match reason {
            Reason::Talked => node.record_query(),
            Reason::Responded | Reason::Cooperated => node.record_response(),
            Reason::Rumor | Reason::Refresh => {}
        }

        let mut admitted = self.admit_routing(&node, &id, reason);
        for interest in self.interests() {
            if self.admit_interest(&interest, &node, reason) {
                admitted = true;
            }
        }

        if admitted {
            self.enqueue(&node);
        }
        admitted
    }

    /// Feeds contacts from a reply back in as rumors, handing those of the
    /// other address family to a sibling table.
    pub fn consider_contacts(&self, contacts: Vec<Contact>) {
        for contact in contacts {
            if self.transport.can_send_to(&contact.addr) {
                self.consider_node(Some(contact.id), contact.addr, Reason::Rumor);
                continue;
            }
            let siblings: Vec<_> = self.siblings.read().iter().filter_map(Weak::upgrade).collect();
            if let Some(sibling) = siblings
                .iter()
                .find(|s| s.transport.can_send_to(&contact.addr))
            {
                sibling.consider_node(Some(contact.id), contact.addr, Reason::Rumor);
            }
        }
    }

    /// Hook run after a node answered one of our queries.
    pub fn on_response(&self, node: &Arc<Node>, reason: Reason) {
        self.consider_node(node.id(), node.endpoint(), reason);
    }

    fn admit_routing(&self, node: &Arc<Node>, id: &Id, reason: Reason) -> bool {
        for _ in 0..=MAX_SPLITS {
            let bucket = match self.bucket_for(id) {
                Ok(bucket) => bucket,
                Err(e) => {
                    error!("{}", e);
                    return false;
                }
            };

            match bucket.consider(self, node, reason) {
                Admission::Added => return true,
                Admission::Refreshed => return false,
                Admission::Rejected => match self.split(&bucket) {
                    Ok(true) => continue,
                    Ok(false) => return false,
                    Err(e) => {
                        debug!("bucket not split: {}", e);
                        return false;
                    }
                },
            }
        }
        false
    }

    /// Splits `bucket` if it still holds the local identifier. Returns true
    /// when the caller should look its bucket up again.
    fn split(&self, bucket: &Arc<Bucket>) -> Result<bool, DhtError> {
        let local = self.local_id();
        let mut buckets = self.buckets.write();
        let Some(index) = buckets.iter().position(|b| Arc::ptr_eq(b, bucket)) else {
            return Ok(false);
        };
        if !bucket.in_range(&local) {
            return Ok(false);
        }
        let upper = bucket.split(&local)?;
        buckets.insert(index + 1, Arc::new(upper));
        debug!("routing table now has {} buckets", buckets.len());
        Ok(true)
    }

    fn admit_interest(&self, interest: &Interest, node: &Arc<Node>, reason: Reason) -> bool {
        match interest.bucket.consider(self, node, reason) {
            Admission::Added => {
                interest.queue.remove(node);
                true
            }
            Admission::Refreshed => false,
            Admission::Rejected => interest.queue.offer(node),
        }
    }

    fn node_for(&self, id: Option<&Id>, endpoint: SocketAddr) -> Arc<Node> {
        let existing = self.registry.get(&endpoint).and_then(|node| node.upgrade());
        if let Some(existing) = existing {
            match (existing.id(), id) {
                (Some(known), Some(id)) if known != *id => {}
                (None, Some(id)) => {
                    if existing.learn_id(id.clone()) {
                        return existing;
                    }
                }
                _ => return existing,
            }
        }

        let node = Arc::new(Node::new(id.cloned(), endpoint));
        self.registry.insert(endpoint, Arc::downgrade(&node));
        node
    }

    /// Pings an endpoint directly, admitting it if it answers.
    pub fn ping_endpoint(&self, endpoint: SocketAddr) -> Result<(), DhtError> {
        if !self.transport.can_send_to(&endpoint) {
            return Err(DhtError::Unreachable(endpoint));
        }
        self.node_for(None, endpoint).ping(self)
    }

    pub fn enqueue(&self, node: &Arc<Node>) {
        self.work.push(node.endpoint(), node.clone());
    }

    /// Drops `node` from every bucket, interest and the endpoint registry.
    pub fn remove_node(&self, node: &Arc<Node>) {
        for bucket in self.buckets() {
            bucket.remove(node);
        }
        for interest in self.interests() {
            interest.bucket.remove(node);
            interest.queue.remove(node);
        }
        self.registry
            .remove_if(&node.endpoint(), |_, weak| weak.as_ptr() == Arc::as_ptr(node));
    }

    /// Drops every entry carrying `id`, whatever endpoint it was seen at.
    /// Returns how many bucket or queue entries were removed.
    pub fn remove_id(&self, id: &Id) -> usize {
        let mut removed: usize = self.buckets().iter().map(|b| b.remove_id(id)).sum();
        for interest in self.interests() {
            removed += interest.bucket.remove_id(id);
            removed += interest.queue.remove_id(id);
        }
        self.registry
            .retain(|_, weak| weak.upgrade().map_or(true, |n| n.id().as_ref() != Some(id)));
        removed
    }

    pub fn in_routing(&self, node: &Arc<Node>) -> bool {
        node.id()
            .and_then(|id| self.bucket_for(&id).ok())
            .is_some_and(|bucket| bucket.contains(node))
    }

    fn is_relevant(&self, node: &Arc<Node>, interest: &Interest) -> bool {
        interest.tracks(node) || (*interest.hash() == self.local_id() && self.in_routing(node))
    }

    /// Up to `count` routing-table nodes closest to `target`, skipping bad ones.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<Arc<Node>> {
        let mut nodes: Vec<(Id, Arc<Node>)> = self
            .buckets()
            .iter()
            .flat_map(|bucket| bucket.nodes())
            .filter(|node| !node.is_bad())
            .filter_map(|node| Some((node.distance_to(target)?, node)))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes.into_iter().take(count).map(|(_, node)| node).collect()
    }

    pub fn closest_contacts(&self, target: &Id, count: usize) -> Vec<Contact> {
        self.closest(target, count)
            .iter()
            .filter_map(|node| node.contact())
            .collect()
    }

    /// True once the buckets hold `K` live nodes near the local identifier.
    pub fn is_booted(&self) -> bool {
        self.closest(&self.local_id(), K).len() >= K
    }

    /// Registers or upgrades an interest and seeds it from the closest known nodes.
    pub fn add_interest(&self, hash: Id, flags: InterestFlags) -> Arc<Interest> {
        let interest = {
            let mut interests = self.interests.write();
            match interests.get(&hash) {
                Some(existing) => {
                    if existing.upgrade(flags) {
                        debug!("interest {} upgraded to {:?}", hash, existing.flags());
                    }
                    existing.touch();
                    existing.clone()
                }
                None => {
                    let interest = Arc::new(Interest::new(
                        hash.clone(),
                        flags,
                        self.config.interest_queue_capacity,
                    ));
                    interests.insert(hash.clone(), interest.clone());
                    interest
                }
            }
        };

        for node in self.closest(&hash, K) {
            if self.admit_interest(&interest, &node, Reason::Refresh) {
                self.enqueue(&node);
            }
        }
        for node in interest.bucket.nodes() {
            self.enqueue(&node);
        }
        interest
    }

    /// Drops an interest. The local identifier's interest is permanent.
    pub fn remove_interest(&self, hash: &Id) -> bool {
        if *hash == self.local_id() {
            return false;
        }
        self.interests.write().remove(hash).is_some()
    }

    /// Adopts an identifier valid for the newly confirmed public endpoint and
    /// rebuilds the routing state around it.
    pub fn set_public_endpoint(&self, endpoint: SocketAddr) {
        if validate_node_id(&self.local_id(), endpoint.ip()) {
            return;
        }

        let new_id = generate_secure_node_id(endpoint.ip());
        let nodes: Vec<Arc<Node>> = {
            let mut buckets = self.buckets.write();
            let mut interests = self.interests.write();
            let mut local_id = self.local_id.write();

            let nodes = buckets.iter().flat_map(|bucket| bucket.nodes()).collect();
            *buckets = vec![Arc::new(Bucket::new(Id::zero(), Id::end()))];

            let flags = interests
                .remove(&*local_id)
                .map(|old| old.flags())
                .unwrap_or_default();
            interests.insert(
                new_id.clone(),
                Arc::new(Interest::new(
                    new_id.clone(),
                    flags,
                    self.config.interest_queue_capacity,
                )),
            );
            *local_id = new_id.clone();
            nodes
        };

        info!(
            "DHT id changed to {} for public endpoint {}",
            new_id, endpoint
        );
        for node in nodes {
            self.consider_node(node.id(), node.endpoint(), Reason::Refresh);
        }
    }

    pub fn stats(&self) -> TableStats {
        let window = self.config.good_window;
        let mut stats = TableStats::default();
        let buckets = self.buckets();
        stats.buckets = buckets.len();
        for node in buckets.iter().flat_map(|bucket| bucket.nodes()) {
            match node.liveness(window) {
                Liveness::Good => stats.good += 1,
                Liveness::Questionable => stats.questionable += 1,
                Liveness::Bad => stats.bad += 1,
            }
        }
        let interests = self.interests();
        stats.interests = interests.len();
        stats.candidates = interests.iter().map(|i| i.queue.len()).sum();
        stats.queued = self.work.len();
        stats.known_endpoints = self.registry.len();
        stats.rejected = self.rejected.len();
        stats
    }

    /// Sleeps for `duration`; returns true if the table was cancelled meanwhile.
    fn sleep(&self, duration: Duration) -> bool {
        let cancel = self.cancel.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(duration) => false,
            }
        })
    }

    fn search_worker(self: Arc<Self>) {
        while let Some(node) = self.work.pop(&self.cancel) {
            self.inquire(&node);
        }
    }

    fn inquire(&self, node: &Arc<Node>) {
        if node.id().is_none() {
            if let Err(e) = node.ping(self) {
                debug!("ping {} failed: {}", node.endpoint(), e);
                if node.is_bad() {
                    self.remove_node(node);
                }
            }
            return;
        }

        for interest in self.interests() {
            if self.cancel.is_cancelled() {
                return;
            }
            if !self.is_relevant(node, &interest)
                || self.rejected.contains(&node.endpoint(), interest.hash())
            {
                continue;
            }

            let result = self.inquire_interest(node, &interest);
            interest.queue.remove(node);
            match result {
                Ok(()) => {}
                Err(DhtError::Cancelled) => return,
                Err(e) => {
                    debug!("lookup {} via {} failed: {}", interest.hash(), node.endpoint(), e);
                    if node.is_bad() {
                        self.remove_node(node);
                        return;
                    }
                    if e.is_transport() {
                        return;
                    }
                }
            }
        }
    }

    fn inquire_interest(&self, node: &Arc<Node>, interest: &Interest) -> Result<(), DhtError> {
        let hash = interest.hash();
        let flags = interest.flags();

        let contacts = node.find_nodes(self, hash)?;
        self.consider_contacts(contacts);

        if flags.peers {
            let reply = node.get_peers(self, hash)?;
            self.consider_contacts(reply.contacts);
            if !reply.peers.is_empty() {
                self.storage.peer_set(hash).extend(reply.peers);
            }
            if !reply.has_token {
                self.rejected.insert(node.endpoint(), hash.clone());
                return Ok(());
            }
            if flags.announce {
                node.announce_peer(self, hash)?;
            }
        }

        if flags.data {
            let data = self.storage.data_entry(hash);
            if flags.publish {
                node.sync(self, &data)?;
            } else {
                let reply = node.get(self, &data)?;
                self.consider_contacts(reply.contacts);
                if !reply.has_token {
                    self.rejected.insert(node.endpoint(), hash.clone());
                }
            }
        }
        Ok(())
    }

    fn refresh_scheduler(self: Arc<Self>) {
        while !self.sleep(self.config.refresh_scan_interval) {
            if self.work.take_overflow() {
                self.requeue_tracked();
            }
            self.schedule_refreshes();
            self.expire_interests();
            self.storage
                .prune(|hash| self.interests.read().contains_key(hash));
        }
    }

    /// Offers every bucket and interest member to the search queue again,
    /// after earlier pushes were refused for capacity.
    fn requeue_tracked(&self) {
        let buckets = self.buckets();
        let interests = self.interests();
        let nodes = buckets
            .iter()
            .flat_map(|bucket| bucket.nodes())
            .chain(interests.iter().flat_map(|i| i.bucket.nodes()))
            .chain(interests.iter().flat_map(|i| i.queue.nodes()));
        for node in nodes {
            self.enqueue(&node);
        }
        debug!("requeued tracked nodes, {} queued", self.work.len());
    }

    fn schedule_refreshes(&self) {
        for bucket in self.buckets() {
            if bucket.changed_at().elapsed() < self.config.bucket_refresh_interval {
                continue;
            }
            bucket.touch();
            let (min, max) = bucket.range();
            self.refresh.push(min.clone(), (min, max));
        }
    }

    fn expire_interests(&self) {
        let local = self.local_id();
        let lifetime = self.config.one_shot_lifetime;
        self.interests.write().retain(|hash, interest| {
            *hash == local || interest.flags().persistent || interest.idle() < lifetime
        });
    }

    fn refresh_worker(self: Arc<Self>) {
        while let Some((min, max)) = self.refresh.pop(&self.cancel) {
            let Some(target) = Id::random_in_range(&min, &max) else {
                continue;
            };
            debug!("refreshing bucket [{}, {}) via {}", min, max, target);
            self.add_interest(target, InterestFlags::lookup());
        }
    }

    fn stats_reporter(self: Arc<Self>) {
        while !self.sleep(self.config.stats_interval) {
            self.registry.retain(|_, node| node.strong_count() > 0);
            if let Err(e) = self.check_coverage() {
                error!("{}", e);
            }

            let stats = self.stats();
            info!(
                "DHT {}: {} buckets, {} good, {} questionable, {} bad, {} interests, {} queued",
                self.transport.local_endpoint(),
                stats.buckets,
                stats.good,
                stats.questionable,
                stats.bad,
                stats.interests,
                stats.queued
            );
        }
    }
}
