//! Protocol constants and tuning parameters.
//!
//! This module contains the constants used throughout the DHT implementation:
//! protocol sizes fixed by BEP-5, BEP-42 and BEP-44, timeouts, worker pool
//! sizes and maintenance intervals.
//!
//! Tuning values follow the defaults of the common mainline implementations
//! (libtorrent, Transmission) where those exist. Every interval here is only a
//! default; [`DhtConfig`](crate::dht::DhtConfig) carries the values actually
//! used at runtime.

use std::time::Duration;

// ============================================================================
// Identifiers
// ============================================================================

/// Width of a node identifier or data key in bits.
pub const ID_BITS: u32 = 160;

/// Width of a node identifier or data key in bytes.
pub const ID_LEN: usize = 20;

/// Bucket capacity (the Kademlia `k`).
pub const K: usize = 8;

/// Upper bound on bucket splits performed by a single admission attempt.
pub const MAX_SPLITS: usize = ID_BITS as usize;

// ============================================================================
// Wire encodings
// ============================================================================

/// Compact IPv4 node: 20-byte id + 4-byte address + 2-byte port.
pub const COMPACT_NODE_V4_LEN: usize = ID_LEN + 6;

/// Compact IPv6 node: 20-byte id + 16-byte address + 2-byte port.
pub const COMPACT_NODE_V6_LEN: usize = ID_LEN + 18;

/// Compact IPv4 peer (address + port).
pub const COMPACT_PEER_V4_LEN: usize = 6;

/// Compact IPv6 peer (address + port).
pub const COMPACT_PEER_V6_LEN: usize = 18;

/// Length of the random transaction id attached to every query.
pub const TRANSACTION_ID_LEN: usize = 2;

/// Largest datagram we are willing to receive.
pub const MAX_DATAGRAM: usize = 65535;

/// Maximum number of outstanding queries per socket.
pub const MAX_PENDING_QUERIES: usize = 1024;

// ============================================================================
// BEP-44 storage
// ============================================================================

/// Maximum size of a bencoded stored value.
pub const MAX_VALUE_LEN: usize = 1000;

/// Maximum salt size for mutable items.
pub const MAX_SALT_LEN: usize = 64;

/// Ed25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Upper bound on get/put rounds when synchronizing one item with one peer.
pub const MAX_SYNC_ROUNDS: usize = 4;

/// Maximum number of announced peers remembered per info-hash.
pub const MAX_PEERS_PER_HASH: usize = 1000;

/// How long an announced peer stays in the peer set.
pub const PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Maximum number of peers returned in one get_peers reply.
pub const MAX_PEERS_PER_REPLY: usize = 100;

// ============================================================================
// Tokens
// ============================================================================

/// Rotation period of the token secret. Tokens stay valid for one to two periods.
pub const TOKEN_ROTATION: Duration = Duration::from_secs(5 * 60);

/// Length of an issued token.
pub const TOKEN_LEN: usize = 8;

/// Length of a token secret.
pub const TOKEN_SECRET_LEN: usize = 16;

// ============================================================================
// Node liveness
// ============================================================================

/// A node that has answered is good while it was active within this window.
pub const NODE_GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Consecutive failures after which a node is treated as never having answered.
pub const MAX_NODE_FAILURES: u8 = 2;

/// Pings sent to a questionable node before it is evicted.
pub const EVICTION_PING_ATTEMPTS: usize = 2;

// ============================================================================
// Timeouts and maintenance
// ============================================================================

/// Time allowed for a single RPC round trip.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// A bucket is refreshed when it has not changed for this long.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How often the refresh coordinator scans for due buckets and stale interests.
pub const REFRESH_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Lifetime of a one-shot (non persistent) interest such as a bucket refresh.
pub const ONE_SHOT_INTEREST_LIFETIME: Duration = Duration::from_secs(2 * 60);

/// Interest buckets accept rumored nodes for this long after creation.
pub const INTEREST_RUMOR_WINDOW: Duration = Duration::from_secs(30);

/// Capacity of the candidate queue kept next to every interest bucket.
pub const INTEREST_QUEUE_CAPACITY: usize = 3 * K;

/// First re-registration delay for value lookups.
pub const INTEREST_REFRESH_MIN: Duration = Duration::from_secs(60);

/// Ceiling for the value lookup re-registration delay.
pub const INTEREST_REFRESH_MAX: Duration = Duration::from_secs(30 * 60);

/// Multiplicative backoff applied to the re-registration delay.
pub const INTEREST_REFRESH_BACKOFF: u32 = 2;

/// Period of the statistics log line.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Granularity at which blocked workers re-check for shutdown.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Worker pools and queues
// ============================================================================

/// Threads consuming the shared "nodes to inquire" queue.
pub const SEARCH_WORKERS: usize = 32;

/// Threads performing bucket refresh lookups.
pub const REFRESH_WORKERS: usize = 4;

/// Capacity of the "nodes to inquire" work queue.
pub const WORK_QUEUE_CAPACITY: usize = 4096;

/// Capacity of the rejected (node, hash) cache.
pub const REJECT_CACHE_CAPACITY: usize = 4096;

/// How long a (node, hash) pair stays rejected after failing to yield a token.
pub const REJECT_TTL: Duration = Duration::from_secs(10 * 60);

// ============================================================================
// Bootstrap
// ============================================================================

/// Well-known routers used to join the network.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
    "dht.libtorrent.org:25401",
];

/// Threads resolving and pinging bootstrap hosts.
pub const BOOTSTRAP_THREADS: usize = 4;

/// Delay before the whole bootstrap pool retries after a failed round.
pub const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(30);

// ============================================================================
// BEP-42
// ============================================================================

/// IPv4 mask applied before hashing the external address.
pub const BEP42_IPV4_MASK: u32 = 0x030f3fff;

/// IPv6 mask applied to the high 64 bits of the external address.
pub const BEP42_IPV6_MASK: u64 = 0x0103070f1f3f7fff;

/// Distinct hosts that must report the same external address before the
/// public endpoint changes.
pub const BEP42_REQUIRED_VOTES: usize = 3;

/// Reported external addresses tracked at once; the tally restarts past this.
pub const BEP42_MAX_CANDIDATES: usize = 64;
