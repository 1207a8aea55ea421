//! Replication policy
//!
//! Keeps every cached key on at least `factor` backends by writing
//! `Transfer` operations into the WAL and handing each one to the
//! [`OperationQueue`] that feeds the workers. This is the only place where
//! the cache writes to the log.

use crate::tiered::TieredCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use stowage_common::config::ReplicationConfig;
use stowage_common::{
    BackendId, BackendRegistry, ContentKey, Error, Operation, OperationId, OperationKind,
    PayloadRef, Result, SharedClock,
};
use stowage_health::HealthMonitor;
use stowage_wal::WalHandle;
use tracing::{debug, info, warn};

/// Receives operations written to the WAL so workers pick them up
pub trait OperationQueue: Send + Sync {
    fn enqueue(&self, op: &Operation);
}

/// Submits transfers until each key reaches the replication factor
pub struct ReplicationEngine {
    config: ReplicationConfig,
    wal: WalHandle,
    cache: Arc<TieredCache>,
    health: Arc<HealthMonitor>,
    registry: BackendRegistry,
    clock: SharedClock,
    queue: Arc<dyn OperationQueue>,
    /// Transfers submitted but not finished, per key and target backend
    in_flight: Mutex<HashMap<ContentKey, BTreeMap<BackendId, OperationId>>>,
}

impl ReplicationEngine {
    pub fn new(
        config: ReplicationConfig,
        wal: WalHandle,
        cache: Arc<TieredCache>,
        health: Arc<HealthMonitor>,
        registry: BackendRegistry,
        clock: SharedClock,
        queue: Arc<dyn OperationQueue>,
    ) -> Self {
        Self {
            config,
            wal,
            cache,
            health,
            registry,
            clock,
            queue,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub const fn factor(&self) -> usize {
        self.config.factor
    }

    /// Submit transfers for the missing copies of `key`
    ///
    /// Targets are healthy registered backends that neither hold the key
    /// nor have a transfer pending, taken in backend ID order. The source
    /// of every transfer is the first existing replica.
    pub fn reconcile(&self, key: &ContentKey) -> Result<Vec<OperationId>> {
        let Some(replicas) = self.cache.replicas(key) else {
            return Ok(Vec::new());
        };
        let Some(source) = replicas.first().cloned() else {
            debug!(key = %key, "No replica to copy from");
            return Ok(Vec::new());
        };

        let mut in_flight = self.in_flight.lock();
        let pending = in_flight.get(key);
        let deficit = self
            .config
            .factor
            .saturating_sub(replicas.len() + pending.map_or(0, BTreeMap::len));
        if deficit == 0 {
            return Ok(Vec::new());
        }

        let targets: Vec<BackendId> = self
            .registry
            .ids()
            .filter(|id| !replicas.contains(*id))
            .filter(|id| !pending.is_some_and(|pending| pending.contains_key(*id)))
            .filter(|id| self.health.is_available(id))
            .take(deficit)
            .cloned()
            .collect();
        if targets.len() < deficit {
            warn!(
                key = %key,
                replicas = replicas.len(),
                deficit,
                eligible = targets.len(),
                "Not enough healthy backends to reach replication factor"
            );
        }
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let pending = in_flight.entry(key.clone()).or_default();
        let mut submitted = Vec::with_capacity(targets.len());
        for target in targets {
            let op = Operation::new(
                OperationKind::Transfer {
                    content: key.clone(),
                    source: source.clone(),
                },
                target.clone(),
                PayloadRef::new(key.as_str()),
                self.config.transfer_max_attempts,
                self.clock.now(),
            );
            let id = self.submit(op)?;
            info!(key = %key, source = %source, target = %target, op = %id, "Submitted replication transfer");
            pending.insert(target, id);
            submitted.push(id);
        }
        Ok(submitted)
    }

    /// Reconcile every resident key
    pub fn reconcile_all(&self) -> Result<Vec<OperationId>> {
        let mut submitted = Vec::new();
        for key in self.cache.resident_keys() {
            submitted.extend(self.reconcile(&key)?);
        }
        Ok(submitted)
    }

    /// Move `key` from `source` to `target`
    pub fn migrate(
        &self,
        key: &ContentKey,
        source: &BackendId,
        target: &BackendId,
        remove_source: bool,
    ) -> Result<OperationId> {
        if !self.registry.contains(target) {
            return Err(Error::UnknownBackend(target.clone()));
        }
        let op = Operation::new(
            OperationKind::Migrate {
                content: key.clone(),
                source: source.clone(),
                remove_source,
            },
            target.clone(),
            PayloadRef::new(key.as_str()),
            self.config.transfer_max_attempts,
            self.clock.now(),
        );
        // Held across the submit so a fast completion finds the reservation
        let mut in_flight = self.in_flight.lock();
        let id = self.submit(op)?;
        in_flight
            .entry(key.clone())
            .or_default()
            .insert(target.clone(), id);
        info!(key = %key, source = %source, target = %target, op = %id, "Submitted migration");
        Ok(id)
    }

    fn submit(&self, op: Operation) -> Result<OperationId> {
        let queued = op.clone();
        let id = self.wal.append(op)?;
        self.queue.enqueue(&queued);
        Ok(id)
    }

    /// A transfer to `backend` finished successfully
    pub fn on_transfer_complete(&self, key: &ContentKey, backend: &BackendId) {
        self.clear_in_flight(key, backend);
        debug!(key = %key, backend = %backend, "Replication transfer complete");
    }

    /// A transfer to `backend` failed for good; a later reconcile may retry
    /// it as a fresh operation
    pub fn on_transfer_failed(&self, key: &ContentKey, backend: &BackendId) {
        self.clear_in_flight(key, backend);
        warn!(key = %key, backend = %backend, "Replication transfer failed");
    }

    fn clear_in_flight(&self, key: &ContentKey, backend: &BackendId) {
        let mut in_flight = self.in_flight.lock();
        if let Some(pending) = in_flight.get_mut(key) {
            pending.remove(backend);
            if pending.is_empty() {
                in_flight.remove(key);
            }
        }
    }

    /// Pending transfer targets of `key`
    pub fn in_flight(&self, key: &ContentKey) -> Vec<BackendId> {
        self.in_flight
            .lock()
            .get(key)
            .map(|pending| pending.keys().cloned().collect())
            .unwrap_or_default()
    }
}
