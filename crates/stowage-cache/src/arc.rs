//! ARC replacement policy over arbitrary keys
//!
//! [`ArcPolicy`] decides which keys are resident. A single location map
//! places every key it knows in one of four lists: `T1` (resident, hit
//! once), `T2` (resident, hit again), and the ghost lists `B1`/`B2`
//! holding keys recently pushed out of `T1`/`T2`. A ghost hit on
//! admission shifts the `T1` target `p` toward the list it came from.
//!
//! Values are not stored here. [`ArcPolicy::admit`] returns an
//! [`Admission`] naming the list the key landed in, the resident keys it
//! pushed into a ghost list, and the ghosts it forgot, so the owner can
//! free storage and metadata to match.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Which list a key is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListLocation {
    T1,
    T2,
    B1,
    B2,
}

impl ListLocation {
    /// T1 and T2 hold values; B1 and B2 only remember keys
    #[must_use]
    pub const fn is_resident(&self) -> bool {
        matches!(self, Self::T1 | Self::T2)
    }
}

/// A resident key pushed out to a ghost list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction<K> {
    pub key: K,
    /// Ghost list the key now lives in
    pub to: ListLocation,
}

/// Side effects of [`ArcPolicy::admit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission<K> {
    /// List the admitted key landed in
    pub list: ListLocation,
    /// Resident keys that lost their value
    pub evicted: Vec<Eviction<K>>,
    /// Ghost keys dropped entirely
    pub forgotten: Vec<K>,
}

impl<K> Admission<K> {
    fn landing_in(list: ListLocation) -> Self {
        Self {
            list,
            evicted: Vec::new(),
            forgotten: Vec::new(),
        }
    }
}

/// Diagnostic view of the lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArcInfo {
    pub t1_len: usize,
    pub t2_len: usize,
    pub b1_len: usize,
    pub b2_len: usize,
    pub p: usize,
    pub capacity: usize,
}

/// ARC list bookkeeping over keys of type `K`
#[derive(Debug)]
pub struct ArcPolicy<K> {
    /// Recently accessed (seen once)
    t1: VecDeque<K>,
    /// Frequently accessed (seen multiple times)
    t2: VecDeque<K>,
    /// Ghost entries from T1
    b1: VecDeque<K>,
    /// Ghost entries from T2
    b2: VecDeque<K>,
    location: HashMap<K, ListLocation>,
    /// Target size for T1 (adaptive parameter)
    p: usize,
    capacity: usize,
}

impl<K: Clone + Eq + Hash> ArcPolicy<K> {
    /// Create a policy for `capacity` resident keys (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            location: HashMap::with_capacity(capacity * 2),
            p: 0,
            capacity,
        }
    }

    pub fn location(&self, key: &K) -> Option<ListLocation> {
        self.location.get(key).copied()
    }

    pub fn is_resident(&self, key: &K) -> bool {
        self.location(key).is_some_and(|l| l.is_resident())
    }

    fn list_mut(&mut self, list: ListLocation) -> &mut VecDeque<K> {
        match list {
            ListLocation::T1 => &mut self.t1,
            ListLocation::T2 => &mut self.t2,
            ListLocation::B1 => &mut self.b1,
            ListLocation::B2 => &mut self.b2,
        }
    }

    fn unlink(&mut self, key: &K, list: ListLocation) {
        self.list_mut(list).retain(|k| k != key);
        self.location.remove(key);
    }

    fn push_mru(&mut self, key: K, list: ListLocation) {
        self.location.insert(key.clone(), list);
        self.list_mut(list).push_back(key);
    }

    /// Current size of T1 + T2 (resident keys)
    pub fn resident_len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn ghost_len(&self) -> usize {
        self.b1.len() + self.b2.len()
    }

    /// Record a hit on a resident key, promoting it to the MRU end of T2.
    /// Returns `false` (and changes nothing) for ghosts and unknown keys.
    pub fn access(&mut self, key: &K) -> bool {
        match self.location(key) {
            Some(list @ (ListLocation::T1 | ListLocation::T2)) => {
                self.unlink(key, list);
                self.push_mru(key.clone(), ListLocation::T2);
                true
            }
            _ => false,
        }
    }

    /// Insert or refresh `key`
    pub fn admit(&mut self, key: K) -> Admission<K> {
        let capacity = self.capacity;

        match self.location(&key) {
            // Case 1: resident hit - move to T2
            Some(list @ (ListLocation::T1 | ListLocation::T2)) => {
                self.unlink(&key, list);
                self.push_mru(key, ListLocation::T2);
                Admission::landing_in(ListLocation::T2)
            }

            // Case 2: ghost hit in B1 - recency is paying off, grow T1's target
            Some(ListLocation::B1) => {
                let delta = std::cmp::max(1, self.b2.len() / self.b1.len().max(1));
                self.p = std::cmp::min(capacity, self.p + delta);
                self.unlink(&key, ListLocation::B1);

                let mut admission = Admission::landing_in(ListLocation::T2);
                if self.resident_len() >= capacity {
                    self.replace(false, &mut admission);
                }
                self.push_mru(key, ListLocation::T2);
                admission
            }

            // Case 3: ghost hit in B2 - frequency is paying off, shrink T1's target
            Some(ListLocation::B2) => {
                let delta = std::cmp::max(1, self.b1.len() / self.b2.len().max(1));
                self.p = self.p.saturating_sub(delta);
                self.unlink(&key, ListLocation::B2);

                let mut admission = Admission::landing_in(ListLocation::T2);
                if self.resident_len() >= capacity {
                    self.replace(true, &mut admission);
                }
                self.push_mru(key, ListLocation::T2);
                admission
            }

            // Case 4: new key
            None => {
                let mut admission = Admission::landing_in(ListLocation::T1);
                let l1_len = self.t1.len() + self.b1.len();

                if l1_len >= capacity {
                    if self.t1.len() < capacity {
                        // Still room in T1, forget the oldest B1 ghost
                        if let Some(ghost) = self.b1.pop_front() {
                            self.location.remove(&ghost);
                            admission.forgotten.push(ghost);
                        }
                        if self.resident_len() >= capacity {
                            self.replace(false, &mut admission);
                        }
                    } else if let Some(evicted) = self.t1.pop_front() {
                        // T1 alone fills the cache
                        self.push_ghost(evicted, ListLocation::B1, &mut admission);
                    }
                } else if self.resident_len() + self.ghost_len() >= capacity {
                    if self.resident_len() + self.ghost_len() >= 2 * capacity {
                        if let Some(ghost) = self.b2.pop_front() {
                            self.location.remove(&ghost);
                            admission.forgotten.push(ghost);
                        }
                    }
                    if self.resident_len() >= capacity {
                        self.replace(false, &mut admission);
                    }
                }

                self.push_mru(key, ListLocation::T1);
                admission
            }
        }
    }

    /// Evict one resident key from T1 or T2 into its ghost list
    fn replace(&mut self, in_b2: bool, admission: &mut Admission<K>) {
        let t1_len = self.t1.len();
        let evict_from_t1 = t1_len > 0
            && (self.t2.is_empty() || t1_len > self.p || (in_b2 && t1_len == self.p));

        let (source, ghost) = if evict_from_t1 {
            (ListLocation::T1, ListLocation::B1)
        } else {
            (ListLocation::T2, ListLocation::B2)
        };
        if let Some(evicted) = self.list_mut(source).pop_front() {
            self.push_ghost(evicted, ghost, admission);
        }
    }

    fn push_ghost(&mut self, key: K, ghost: ListLocation, admission: &mut Admission<K>) {
        self.push_mru(key.clone(), ghost);
        admission.evicted.push(Eviction { key, to: ghost });

        // Ghost lists never outgrow the cache
        let capacity = self.capacity;
        while self.list_mut(ghost).len() > capacity {
            if let Some(oldest) = self.list_mut(ghost).pop_front() {
                self.location.remove(&oldest);
                admission.forgotten.push(oldest);
            }
        }
    }

    /// Drop `key` from whichever list holds it
    pub fn remove(&mut self, key: &K) -> Option<ListLocation> {
        let list = self.location(key)?;
        self.unlink(key, list);
        Some(list)
    }

    /// Resident keys, least recently used first within T1 then T2
    pub fn resident_keys(&self) -> impl Iterator<Item = &K> {
        self.t1.iter().chain(self.t2.iter())
    }

    pub fn clear(&mut self) {
        self.t1.clear();
        self.t2.clear();
        self.b1.clear();
        self.b2.clear();
        self.location.clear();
        self.p = 0;
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn info(&self) -> ArcInfo {
        ArcInfo {
            t1_len: self.t1.len(),
            t2_len: self.t2.len(),
            b1_len: self.b1.len(),
            b2_len: self.b2.len(),
            p: self.p,
            capacity: self.capacity,
        }
    }
}
