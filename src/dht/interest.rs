use super::bucket::Bucket;
use super::id::Id;
use super::node::Node;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the search workers do for an interest besides `find_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InterestFlags {
    /// Ask for peers with `get_peers`.
    pub peers: bool,
    /// Announce ourselves with `announce_peer`. Implies `peers`.
    pub announce: bool,
    /// Fetch the stored item with `get`.
    pub data: bool,
    /// Push the local item with `put`, after syncing. Implies `data`.
    pub publish: bool,
    /// Never expires; removed only explicitly.
    pub persistent: bool,
}

impl InterestFlags {
    pub fn lookup() -> Self {
        Self::default()
    }

    pub fn peers() -> Self {
        Self {
            peers: true,
            persistent: true,
            ..Self::default()
        }
    }

    pub fn announce() -> Self {
        Self {
            announce: true,
            ..Self::peers()
        }
    }

    pub fn data() -> Self {
        Self {
            data: true,
            persistent: true,
            ..Self::default()
        }
    }

    pub fn publish() -> Self {
        Self {
            publish: true,
            ..Self::data()
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            peers: self.peers || other.peers || self.announce || other.announce,
            announce: self.announce || other.announce,
            data: self.data || other.data || self.publish || other.publish,
            publish: self.publish || other.publish,
            persistent: self.persistent || other.persistent,
        }
    }
}

/// Nodes waiting to be tried for one interest, closest first.
///
/// Nodes without an identifier sort ahead of every known distance. The queue
/// holds at most `capacity` entries; the farthest are dropped.
pub struct CandidateQueue {
    center: Id,
    capacity: usize,
    nodes: Mutex<Vec<Arc<Node>>>,
}

impl CandidateQueue {
    pub fn new(center: Id, capacity: usize) -> Self {
        Self {
            center,
            capacity,
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Inserts `node` in distance order. Returns false if it was already
    /// queued or fell off the end.
    pub fn offer(&self, node: &Arc<Node>) -> bool {
        let mut nodes = self.nodes.lock();
        let endpoint = node.endpoint();
        if nodes.iter().any(|n| Arc::ptr_eq(n, node) || n.endpoint() == endpoint) {
            return false;
        }

        let key = node.distance_to(&self.center);
        let at = nodes.partition_point(|n| n.distance_to(&self.center) <= key);
        if at >= self.capacity {
            return false;
        }
        nodes.insert(at, node.clone());
        nodes.truncate(self.capacity);
        true
    }

    pub fn contains(&self, node: &Arc<Node>) -> bool {
        self.nodes.lock().iter().any(|n| Arc::ptr_eq(n, node))
    }

    pub fn remove(&self, node: &Arc<Node>) -> bool {
        let mut nodes = self.nodes.lock();
        let before = nodes.len();
        nodes.retain(|n| !Arc::ptr_eq(n, node));
        nodes.len() != before
    }

    pub fn remove_id(&self, id: &Id) -> usize {
        let mut nodes = self.nodes.lock();
        let before = nodes.len();
        nodes.retain(|n| n.id().as_ref() != Some(id));
        before - nodes.len()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A hash the local node is working towards: the closest nodes found so far,
/// the candidates still to try and what to do with each of them.
pub struct Interest {
    hash: Id,
    pub bucket: Bucket,
    pub queue: CandidateQueue,
    flags: Mutex<InterestFlags>,
    touched: Mutex<Instant>,
}

impl Interest {
    pub fn new(hash: Id, flags: InterestFlags, queue_capacity: usize) -> Self {
        Self {
            bucket: Bucket::centered(hash.clone()),
            queue: CandidateQueue::new(hash.clone(), queue_capacity),
            hash,
            flags: Mutex::new(InterestFlags::lookup().union(flags)),
            touched: Mutex::new(Instant::now()),
        }
    }

    pub fn hash(&self) -> &Id {
        &self.hash
    }

    pub fn flags(&self) -> InterestFlags {
        *self.flags.lock()
    }

    /// Adds `flags` to the interest. Returns true if anything changed.
    pub fn upgrade(&self, flags: InterestFlags) -> bool {
        let mut current = self.flags.lock();
        let next = current.union(flags);
        let changed = next != *current;
        *current = next;
        changed
    }

    pub fn touch(&self) {
        *self.touched.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.touched.lock().elapsed()
    }

    /// Whether `node` currently belongs to this interest, as a member or a candidate.
    pub fn tracks(&self, node: &Arc<Node>) -> bool {
        self.bucket.contains(node) || self.queue.contains(node)
    }
}
