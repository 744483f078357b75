use crate::constants::{
    BOOTSTRAP_NODES, BOOTSTRAP_RETRY_DELAY, BOOTSTRAP_THREADS, BUCKET_REFRESH_INTERVAL,
    INTEREST_QUEUE_CAPACITY, INTEREST_REFRESH_BACKOFF, INTEREST_REFRESH_MAX, INTEREST_REFRESH_MIN,
    INTEREST_RUMOR_WINDOW, MAX_PEERS_PER_HASH, NODE_GOOD_WINDOW, ONE_SHOT_INTEREST_LIFETIME,
    PEER_ANNOUNCE_LIFETIME, REFRESH_SCAN_INTERVAL, REFRESH_WORKERS, REJECT_CACHE_CAPACITY,
    REJECT_TTL, RPC_TIMEOUT, SEARCH_WORKERS, STATS_INTERVAL, TOKEN_ROTATION, WORK_QUEUE_CAPACITY,
};
use std::time::Duration;

/// Tunables of a [`Dht`](super::Dht) instance.
///
/// `Default` gives the values used on the public mainline network; tests
/// shrink the worker counts and intervals.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub rpc_timeout: Duration,
    pub token_rotation: Duration,
    /// A node that answered within this window counts as good.
    pub good_window: Duration,
    pub bucket_refresh_interval: Duration,
    pub refresh_scan_interval: Duration,
    pub one_shot_lifetime: Duration,
    /// After this long an interest stops admitting rumored nodes.
    pub interest_rumor_window: Duration,
    pub interest_queue_capacity: usize,
    pub value_refresh_min: Duration,
    pub value_refresh_max: Duration,
    pub value_refresh_backoff: u32,
    pub stats_interval: Duration,
    pub search_workers: usize,
    pub refresh_workers: usize,
    pub work_queue_capacity: usize,
    pub reject_capacity: usize,
    pub reject_ttl: Duration,
    pub peer_lifetime: Duration,
    pub max_peers_per_hash: usize,
    /// `host:port` strings resolved at startup. Empty disables bootstrapping.
    pub bootstrap_nodes: Vec<String>,
    pub bootstrap_threads: usize,
    pub bootstrap_retry_delay: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: RPC_TIMEOUT,
            token_rotation: TOKEN_ROTATION,
            good_window: NODE_GOOD_WINDOW,
            bucket_refresh_interval: BUCKET_REFRESH_INTERVAL,
            refresh_scan_interval: REFRESH_SCAN_INTERVAL,
            one_shot_lifetime: ONE_SHOT_INTEREST_LIFETIME,
            interest_rumor_window: INTEREST_RUMOR_WINDOW,
            interest_queue_capacity: INTEREST_QUEUE_CAPACITY,
            value_refresh_min: INTEREST_REFRESH_MIN,
            value_refresh_max: INTEREST_REFRESH_MAX,
            value_refresh_backoff: INTEREST_REFRESH_BACKOFF,
            stats_interval: STATS_INTERVAL,
            search_workers: SEARCH_WORKERS,
            refresh_workers: REFRESH_WORKERS,
            work_queue_capacity: WORK_QUEUE_CAPACITY,
            reject_capacity: REJECT_CACHE_CAPACITY,
            reject_ttl: REJECT_TTL,
            peer_lifetime: PEER_ANNOUNCE_LIFETIME,
            max_peers_per_hash: MAX_PEERS_PER_HASH,
            bootstrap_nodes: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            bootstrap_threads: BOOTSTRAP_THREADS,
            bootstrap_retry_delay: BOOTSTRAP_RETRY_DELAY,
        }
    }
}

impl DhtConfig {
    /// No bootstrap hosts and small worker pools, for private networks.
    pub fn local() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            search_workers: 4,
            refresh_workers: 1,
            ..Self::default()
        }
    }

    /// Next delay of a value refresh: multiplied by the backoff factor and capped.
    pub fn next_refresh_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.value_refresh_backoff)
            .min(self.value_refresh_max)
    }
}
