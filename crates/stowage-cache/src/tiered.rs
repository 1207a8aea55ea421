//! Tiered content cache
//!
//! ARC decides residency. Every resident value is kept on disk (Warm) and
//! the most recently hit ones are also held in memory (Hot), bounded by
//! both an entry count and a byte budget. Keys evicted into the ghost lists
//! keep their replica metadata at tier Cold until ARC forgets them.
//!
//! The state lock covers bookkeeping only. Warm blobs are written before
//! the lock is taken and read or deleted after it is released; each entry
//! remembers the blob generation it was admitted with so a late delete
//! never removes a newer blob.

use crate::arc::{ArcInfo, ArcPolicy, ListLocation};
use crate::warm::{Generation, WarmStore};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use stowage_common::config::CacheConfig;
use stowage_common::{BackendId, ContentKey, Result};
use stowage_telemetry::Telemetry;
use tracing::{debug, warn};

/// Residency level of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// In memory (and on disk)
    Hot,
    /// On disk only
    Warm,
    /// Metadata only
    Cold,
}

/// Read-only copy of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntrySnapshot {
    pub key: ContentKey,
    pub size_bytes: u64,
    pub tier: Tier,
    pub list: ListLocation,
    pub hits: u64,
    pub replica_backends: BTreeSet<BackendId>,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub resident_entries: usize,
    pub ghost_entries: usize,
    pub hot_entries: usize,
    pub hot_bytes: u64,
    pub warm_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
}

struct EntryMeta {
    size_bytes: u64,
    tier: Tier,
    hits: u64,
    replicas: BTreeSet<BackendId>,
    /// Warm blob backing the value while not Cold
    generation: Generation,
}

/// In-memory LRU over a subset of resident values
struct HotTier {
    order: VecDeque<ContentKey>,
    values: HashMap<ContentKey, Bytes>,
    bytes: u64,
    max_entries: usize,
    max_bytes: u64,
}

impl HotTier {
    fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            order: VecDeque::new(),
            values: HashMap::new(),
            bytes: 0,
            max_entries,
            max_bytes,
        }
    }

    fn get(&self, key: &ContentKey) -> Option<Bytes> {
        self.values.get(key).cloned()
    }

    fn remove(&mut self, key: &ContentKey) -> bool {
        let Some(value) = self.values.remove(key) else {
            return false;
        };
        self.order.retain(|k| k != key);
        self.bytes -= value.len() as u64;
        true
    }

    /// Make `key` the most recent hot value; returns keys pushed out.
    /// A value larger than the whole budget is not held.
    fn insert(&mut self, key: &ContentKey, value: Bytes) -> Vec<ContentKey> {
        self.remove(key);
        let size = value.len() as u64;
        if size > self.max_bytes {
            return Vec::new();
        }

        self.order.push_back(key.clone());
        self.values.insert(key.clone(), value);
        self.bytes += size;

        let mut demoted = Vec::new();
        while self.order.len() > self.max_entries || self.bytes > self.max_bytes {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(value) = self.values.remove(&oldest) {
                self.bytes -= value.len() as u64;
            }
            demoted.push(oldest);
        }
        demoted
    }

    fn clear(&mut self) {
        self.order.clear();
        self.values.clear();
        self.bytes = 0;
    }
}

struct CacheState {
    arc: ArcPolicy<ContentKey>,
    entries: HashMap<ContentKey, EntryMeta>,
    hot: HotTier,
    warm_bytes: u64,
}

impl CacheState {
    /// Release the value of an evicted key, keeping its metadata.
    /// Returns the blob generation to delete.
    fn demote_to_cold(&mut self, key: &ContentKey) -> Option<Generation> {
        self.hot.remove(key);
        let entry = self.entries.get_mut(key)?;
        if entry.tier == Tier::Cold {
            return None;
        }
        self.warm_bytes = self.warm_bytes.saturating_sub(entry.size_bytes);
        entry.tier = Tier::Cold;
        Some(entry.generation)
    }

    fn drop_entry(&mut self, key: &ContentKey) -> Option<Generation> {
        self.arc.remove(key);
        self.hot.remove(key);
        let entry = self.entries.remove(key)?;
        if entry.tier == Tier::Cold {
            return None;
        }
        self.warm_bytes = self.warm_bytes.saturating_sub(entry.size_bytes);
        Some(entry.generation)
    }
}

/// ARC-managed cache with hot, warm and cold tiers
pub struct TieredCache {
    state: Mutex<CacheState>,
    warm: WarmStore,
    telemetry: Arc<Telemetry>,
}

impl TieredCache {
    /// Create the cache, clearing any warm blobs left in `config.dir`
    pub fn open(config: &CacheConfig, telemetry: Arc<Telemetry>) -> Result<Self> {
        let warm = WarmStore::open(&config.dir)?;
        Ok(Self {
            state: Mutex::new(CacheState {
                arc: ArcPolicy::new(config.capacity_entries),
                entries: HashMap::new(),
                hot: HotTier::new(config.hot_max_entries(), config.hot_max_bytes),
                warm_bytes: 0,
            }),
            warm,
            telemetry,
        })
    }

    /// Look up `key`; a hit promotes it in ARC and into the hot tier.
    /// A miss changes nothing.
    pub fn get(&self, key: &ContentKey) -> Option<Bytes> {
        loop {
            let generation = {
                let mut state = self.state.lock();
                if !state.arc.is_resident(key) {
                    self.telemetry.record_cache_miss();
                    return None;
                }
                if let Some(value) = state.hot.get(key) {
                    self.record_hit(&mut state, key, value.clone());
                    return Some(value);
                }
                state.entries.get(key).map(|entry| entry.generation)
            };

            let read = self.warm.read(key);

            let mut state = self.state.lock();
            let current = if state.arc.is_resident(key) {
                state.entries.get(key).map(|entry| entry.generation)
            } else {
                None
            };
            if current != generation {
                // Replaced or evicted during the read
                continue;
            }

            let reason = match read {
                Ok(Some(value)) => {
                    self.record_hit(&mut state, key, value.clone());
                    return Some(value);
                }
                Ok(None) if self.warm.generation(key).is_some_and(|g| Some(g) != generation) => {
                    // Rewritten under us; the newer put is about to land
                    drop(state);
                    std::thread::yield_now();
                    continue;
                }
                Ok(None) => "warm blob missing".to_string(),
                Err(e) => e.to_string(),
            };
            warn!(key = %key, reason = %reason, "Dropping resident entry without a readable warm blob");
            let released = state.drop_entry(key);
            drop(state);
            self.release_blobs(released.map(|generation| (key.clone(), generation)));
            self.telemetry.record_cache_miss();
            return None;
        }
    }

    fn record_hit(&self, state: &mut CacheState, key: &ContentKey, value: Bytes) {
        state.arc.access(key);
        if let Some(entry) = state.entries.get_mut(key) {
            entry.hits += 1;
        }
        self.promote(state, key, value);
        self.telemetry.record_cache_hit();
    }

    /// Insert or refresh `key`; a recently evicted key goes straight to T2
    pub fn put(&self, key: ContentKey, value: Bytes) -> Result<()> {
        let size = value.len() as u64;
        let generation = self.warm.write(&key, &value)?;

        let mut released = Vec::new();
        {
            let mut state = self.state.lock();
            if self.warm.generation(&key) != Some(generation) {
                // A newer write of this key owns the blob now
                debug!(key = %key, generation, "Skipping superseded cache write");
                return Ok(());
            }

            let previous_size = state
                .entries
                .get(&key)
                .filter(|e| e.tier != Tier::Cold)
                .map_or(0, |e| e.size_bytes);
            state.warm_bytes = state.warm_bytes.saturating_sub(previous_size) + size;

            let admission = state.arc.admit(key.clone());
            for eviction in &admission.evicted {
                if let Some(evicted) = state.demote_to_cold(&eviction.key) {
                    released.push((eviction.key.clone(), evicted));
                }
                self.telemetry.record_cache_eviction();
            }
            for forgotten in &admission.forgotten {
                state.entries.remove(forgotten);
            }

            let entry = state.entries.entry(key.clone()).or_insert_with(|| EntryMeta {
                size_bytes: size,
                tier: Tier::Warm,
                hits: 0,
                replicas: BTreeSet::new(),
                generation,
            });
            entry.size_bytes = size;
            entry.generation = generation;
            if entry.tier == Tier::Cold {
                entry.tier = Tier::Warm;
            }

            debug!(
                key = %key,
                size,
                list = ?admission.list,
                evicted = admission.evicted.len(),
                "Cached content"
            );
            self.promote(&mut state, &key, value);
        }

        self.release_blobs(released);
        Ok(())
    }

    /// Move a value into the hot tier, demoting whatever falls out
    fn promote(&self, state: &mut CacheState, key: &ContentKey, value: Bytes) {
        let was_hot = state.entries.get(key).is_some_and(|e| e.tier == Tier::Hot);
        let demoted = state.hot.insert(key, value);
        let now_hot = state.hot.values.contains_key(key);

        if let Some(entry) = state.entries.get_mut(key) {
            entry.tier = if now_hot { Tier::Hot } else { Tier::Warm };
        }
        if now_hot && !was_hot {
            self.telemetry.record_cache_promotion();
        }
        for demoted_key in demoted {
            if let Some(entry) = state.entries.get_mut(&demoted_key) {
                entry.tier = Tier::Warm;
            }
            self.telemetry.record_cache_demotion();
        }
    }

    /// Delete warm blobs outside the state lock
    fn release_blobs(&self, released: impl IntoIterator<Item = (ContentKey, Generation)>) {
        for (key, generation) in released {
            if let Err(e) = self.warm.release(&key, generation) {
                warn!(key = %key, error = %e, "Failed to delete warm blob");
            }
        }
    }

    /// Forget `key` entirely, including ghost metadata
    pub fn remove(&self, key: &ContentKey) -> bool {
        let (known, released) = {
            let mut state = self.state.lock();
            let known = state.arc.location(key).is_some();
            (known, state.drop_entry(key))
        };
        self.release_blobs(released.map(|generation| (key.clone(), generation)));
        known
    }

    /// Whether `key` currently has a value (T1 or T2)
    pub fn contains(&self, key: &ContentKey) -> bool {
        self.state.lock().arc.is_resident(key)
    }

    pub fn entry(&self, key: &ContentKey) -> Option<CacheEntrySnapshot> {
        let state = self.state.lock();
        let list = state.arc.location(key)?;
        let entry = state.entries.get(key)?;
        Some(CacheEntrySnapshot {
            key: key.clone(),
            size_bytes: entry.size_bytes,
            tier: entry.tier,
            list,
            hits: entry.hits,
            replica_backends: entry.replicas.clone(),
        })
    }

    /// Note that `backend` holds a durable copy; `false` if `key` is unknown
    pub fn record_replica(&self, key: &ContentKey, backend: BackendId) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.replicas.insert(backend);
                true
            }
            None => false,
        }
    }

    /// Forget a copy, e.g. after a migration removed the source
    pub fn remove_replica(&self, key: &ContentKey, backend: &BackendId) -> bool {
        let mut state = self.state.lock();
        state
            .entries
            .get_mut(key)
            .is_some_and(|entry| entry.replicas.remove(backend))
    }

    /// Replace the replica set of `key`; `false` if `key` is unknown
    pub fn set_replicas(&self, key: &ContentKey, replicas: BTreeSet<BackendId>) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.replicas = replicas;
                true
            }
            None => false,
        }
    }

    pub fn replicas(&self, key: &ContentKey) -> Option<BTreeSet<BackendId>> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.replicas.clone())
    }

    /// Keys that currently hold a value
    pub fn resident_keys(&self) -> Vec<ContentKey> {
        self.state.lock().arc.resident_keys().cloned().collect()
    }

    pub fn arc_info(&self) -> ArcInfo {
        self.state.lock().arc.info()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let info = state.arc.info();
        CacheStats {
            resident_entries: info.t1_len + info.t2_len,
            ghost_entries: info.b1_len + info.b2_len,
            hot_entries: state.hot.values.len(),
            hot_bytes: state.hot.bytes,
            warm_bytes: state.warm_bytes,
            hits: self.telemetry.cache_hit_total(),
            misses: self.telemetry.cache_miss_total(),
            evictions: self.telemetry.cache_eviction_total(),
            hit_ratio: self.telemetry.cache_hit_ratio(),
        }
    }

    /// Drop every entry and blob
    pub fn clear(&self) -> Result<()> {
        let released: Vec<(ContentKey, Generation)> = {
            let mut state = self.state.lock();
            let released = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.tier != Tier::Cold)
                .map(|(key, entry)| (key.clone(), entry.generation))
                .collect();
            state.arc.clear();
            state.entries.clear();
            state.hot.clear();
            state.warm_bytes = 0;
            released
        };
        for (key, generation) in released {
            self.warm.release(&key, generation)?;
        }
        Ok(())
    }
}
