use super::error::DhtError;
use super::id::Id;
use super::node::{Liveness, Node};
use super::routing::RoutingTable;
use crate::constants::{EVICTION_PING_ATTEMPTS, K};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Why a node is being considered for admission, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reason {
    /// Named in someone else's reply.
    Rumor,
    /// Sent us a query.
    Talked,
    /// Seeded from the local table into a new interest.
    Refresh,
    /// Answered one of our queries.
    Responded,
    /// Answered and handed out a write token.
    Cooperated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Already present; its endpoint was refreshed.
    Refreshed,
    Added,
    Rejected,
}

struct BucketState {
    min: Id,
    max: Id,
    slots: Vec<Option<Arc<Node>>>,
    /// Slot and distance of the member farthest from the center, if known.
    farthest: Option<(usize, Id)>,
    changed_at: Instant,
}

impl BucketState {
    fn new(min: Id, max: Id) -> Self {
        Self {
            min,
            max,
            slots: vec![None; K],
            farthest: None,
            changed_at: Instant::now(),
        }
    }

    fn occupy(&mut self, slot: usize, node: &Arc<Node>) {
        self.slots[slot] = Some(node.clone());
        self.farthest = None;
        self.changed_at = Instant::now();
    }

    fn position(&self, id: &Id) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().and_then(|n| n.id()).as_ref() == Some(id))
    }

    fn empty_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }
}

/// Up to [`K`] nodes.
///
/// A routing bucket covers the identifier range `[min, max)` and prefers
/// long-lived nodes. An interest bucket has a center, covers the whole space
/// and keeps the `K` nodes closest to the center.
pub struct Bucket {
    center: Option<Id>,
    created: Instant,
    state: Mutex<BucketState>,
}

impl Bucket {
    pub fn new(min: Id, max: Id) -> Self {
        Self {
            center: None,
            created: Instant::now(),
            state: Mutex::new(BucketState::new(min, max)),
        }
    }

    pub fn centered(center: Id) -> Self {
        Self {
            center: Some(center),
            created: Instant::now(),
            state: Mutex::new(BucketState::new(Id::zero(), Id::end())),
        }
    }

    pub fn center(&self) -> Option<&Id> {
        self.center.as_ref()
    }

    pub fn range(&self) -> (Id, Id) {
        let state = self.state.lock();
        (state.min.clone(), state.max.clone())
    }

    pub fn in_range(&self, id: &Id) -> bool {
        let state = self.state.lock();
        state.min <= *id && *id < state.max
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == K
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.state.lock().slots.iter().flatten().cloned().collect()
    }

    pub fn contains(&self, node: &Arc<Node>) -> bool {
        self.state
            .lock()
            .slots
            .iter()
            .flatten()
            .any(|n| Arc::ptr_eq(n, node))
    }

    pub fn find(&self, id: &Id) -> Option<Arc<Node>> {
        let state = self.state.lock();
        state.position(id).and_then(|slot| state.slots[slot].clone())
    }

    /// Time of the last membership change or refresh.
    pub fn changed_at(&self) -> Instant {
        self.state.lock().changed_at
    }

    pub fn touch(&self) {
        self.state.lock().changed_at = Instant::now();
    }

    /// Removes `node`. Returns false if it was not a member.
    pub fn remove(&self, node: &Arc<Node>) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)))
        else {
            return false;
        };
        state.slots[slot] = None;
        state.farthest = None;
        state.changed_at = Instant::now();
        true
    }

    /// Clears every slot holding `id`. Returns how many were cleared.
    pub fn remove_id(&self, id: &Id) -> usize {
        let mut state = self.state.lock();
        let mut cleared = 0;
        for slot in state.slots.iter_mut() {
            if slot.as_ref().is_some_and(|n| n.id().as_ref() == Some(id)) {
                *slot = None;
                cleared += 1;
            }
        }
        if cleared > 0 {
            state.farthest = None;
            state.changed_at = Instant::now();
        }
        cleared
    }

    /// Splits a routing bucket around the midpoint of its range.
    ///
    /// `self` keeps the lower half and the upper half is returned, each node
    /// moving to the half its identifier falls in. Fails if the range is no
    /// wider than `K` or does not contain `local_id`.
    pub fn split(&self, local_id: &Id) -> Result<Bucket, DhtError> {
        let mut state = self.state.lock();
        let width = state.max.checked_sub(&state.min).unwrap_or_default();
        if width <= Id::from_u64(K as u64) {
            return Err(DhtError::BucketTooSmall);
        }
        if !(state.min <= *local_id && *local_id < state.max) {
            return Err(DhtError::SplitOffPath);
        }

        let mid = &(&state.min + &state.max) >> 1;
        let mut upper = BucketState::new(mid.clone(), state.max.clone());
        let mut next = 0;
        for slot in state.slots.iter_mut() {
            let moves = slot
                .as_ref()
                .and_then(|node| node.id())
                .is_some_and(|id| id >= mid);
            if moves {
                upper.slots[next] = slot.take();
                next += 1;
            }
        }

        trace!(min = %state.min, mid = %mid, "bucket split");
        state.max = mid;
        state.farthest = None;
        state.changed_at = Instant::now();

        Ok(Bucket {
            center: None,
            created: Instant::now(),
            state: Mutex::new(upper),
        })
    }

    /// Offers `node` to the bucket.
    ///
    /// Questionable members of a full routing bucket are pinged before being
    /// evicted; the bucket lock is not held while those pings run.
    pub fn consider(&self, table: &RoutingTable, node: &Arc<Node>, reason: Reason) -> Admission {
        let Some(id) = node.id() else {
            return Admission::Rejected;
        };

        {
            let mut state = self.state.lock();
            if let Some(slot) = state.position(&id) {
                if let Some(existing) = &state.slots[slot] {
                    if !Arc::ptr_eq(existing, node) {
                        existing.set_endpoint(node.endpoint());
                    }
                }
                return Admission::Refreshed;
            }

            if let Some(center) = &self.center {
                return self.admit_closer(&mut state, table, node, &id, center, reason);
            }

            if !(state.min <= id && id < state.max) {
                return Admission::Rejected;
            }
            if let Some(slot) = state.empty_slot() {
                state.occupy(slot, node);
                return Admission::Added;
            }
            if reason != Reason::Rumor {
                if let Some(slot) = state
                    .slots
                    .iter()
                    .position(|s| s.as_ref().is_some_and(|n| n.is_bad()))
                {
                    state.occupy(slot, node);
                    return Admission::Added;
                }
            }
        }

        self.evict_questionable(table, node, &id)
    }

    fn admit_closer(
        &self,
        state: &mut BucketState,
        table: &RoutingTable,
        node: &Arc<Node>,
        id: &Id,
        center: &Id,
        reason: Reason,
    ) -> Admission {
        if reason == Reason::Rumor && self.created.elapsed() >= table.config().interest_rumor_window
        {
            return Admission::Rejected;
        }
        if let Some(slot) = state.empty_slot() {
            state.occupy(slot, node);
            return Admission::Added;
        }

        let (slot, farthest) = match &state.farthest {
            Some(cached) => cached.clone(),
            None => {
                let Some(found) = farthest_member(&state.slots, center) else {
                    return Admission::Rejected;
                };
                state.farthest = Some(found.clone());
                found
            }
        };

        if id.distance(center) < farthest {
            state.occupy(slot, node);
            Admission::Added
        } else {
            Admission::Rejected
        }
    }

    fn evict_questionable(&self, table: &RoutingTable, node: &Arc<Node>, id: &Id) -> Admission {
        let window = table.config().good_window;

        for _ in 0..K {
            let candidate = {
                let state = self.state.lock();
                state
                    .slots
                    .iter()
                    .flatten()
                    .filter(|n| n.liveness(window) == Liveness::Questionable)
                    .min_by_key(|n| n.last_active())
                    .cloned()
            };
            let Some(candidate) = candidate else {
                return Admission::Rejected;
            };

            let mut alive = false;
            for _ in 0..EVICTION_PING_ATTEMPTS {
                if table.cancel_token().is_cancelled() {
                    return Admission::Rejected;
                }
                if candidate.ping(table).is_ok() {
                    alive = true;
                    break;
                }
            }
            if alive {
                continue;
            }

            let mut state = self.state.lock();
            if state.position(id).is_some() {
                return Admission::Refreshed;
            }
            let slot = state
                .slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|n| Arc::ptr_eq(n, &candidate)))
                .or_else(|| state.empty_slot());
            if let Some(slot) = slot {
                debug!(
                    "evicting {} for {}",
                    candidate.endpoint(),
                    node.endpoint()
                );
                state.occupy(slot, node);
                return Admission::Added;
            }
        }
        Admission::Rejected
    }
}

fn farthest_member(slots: &[Option<Arc<Node>>], center: &Id) -> Option<(usize, Id)> {
    slots
        .iter()
        .enumerate()
        .filter_map(|(slot, node)| {
            let distance = node.as_ref()?.distance_to(center)?;
            Some((slot, distance))
        })
        .max_by(|a, b| a.1.cmp(&b.1))
}
