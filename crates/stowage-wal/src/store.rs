//! WAL store
//!
//! Owns every partition file and an in-memory index of the latest snapshot
//! of each operation. Writes to one backend are serialized by that
//! backend's log mutex, so a slow partition never blocks another backend.
//! Readers only consult the index, which is updated after the record is
//! durable.

use crate::iter::{ListCursor, ListFilter, OperationIter};
use crate::partition::{
    parse_partition_name, partition_path, read_sealed, recover_active, rewrite_sealed, sync_dir,
    ActivePartition, PartitionId, PartitionInfo, PartitionMeta, PartitionState, SEALED_EXT,
};
use crate::record::WalRecord;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use stowage_common::config::WalConfig;
use stowage_common::{
    BackendId, Error, ErrorClass, Lease, Operation, OperationError, OperationId, OperationStatus,
    Result, SharedClock, WorkerId,
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Shared handle to an open WAL
pub type WalHandle = Arc<WalStore>;

/// A requested status change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: OperationStatus,
    /// Fail with `InvalidTransition` unless the current status is this one
    pub expected: Option<OperationStatus>,
    pub error: Option<OperationError>,
    /// Only meaningful for `Retrying`; defaults to now
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Only meaningful for `Processing`
    pub lease: Option<Lease>,
    /// Charge one attempt against `max_attempts`
    pub count_attempt: bool,
}

impl StatusUpdate {
    #[must_use]
    pub const fn to(status: OperationStatus) -> Self {
        Self {
            status,
            expected: None,
            error: None,
            next_retry_at: None,
            lease: None,
            count_attempt: false,
        }
    }

    #[must_use]
    pub fn expecting(mut self, status: OperationStatus) -> Self {
        self.expected = Some(status);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: Option<OperationError>) -> Self {
        self.error = error;
        self
    }

    #[must_use]
    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    #[must_use]
    pub fn counting_attempt(mut self) -> Self {
        self.count_attempt = true;
        self
    }

    /// Produce the next snapshot of `current`
    fn apply(&self, current: &Operation, now: DateTime<Utc>) -> Result<Operation> {
        let invalid = || Error::InvalidTransition {
            id: current.id,
            from: current.status,
            to: self.status,
        };
        if self.expected.is_some_and(|expected| expected != current.status) {
            return Err(invalid());
        }
        if !current.status.can_transition_to(self.status) {
            return Err(invalid());
        }

        let mut next = current.clone();
        next.status = self.status;
        next.updated_at = now;
        if self.count_attempt {
            next.attempt_count = next.attempt_count.saturating_add(1);
        }
        if let Some(error) = &self.error {
            next.error_history.push(error.clone());
        }

        match self.status {
            OperationStatus::Processing => {
                next.lease = self.lease;
                next.next_retry_at = None;
                next.error = None;
            }
            OperationStatus::Retrying => {
                next.lease = None;
                next.next_retry_at = Some(self.next_retry_at.unwrap_or(now));
                if self.error.is_some() {
                    next.error.clone_from(&self.error);
                }
            }
            OperationStatus::Failed => {
                next.lease = None;
                next.next_retry_at = None;
                if self.error.is_some() {
                    next.error.clone_from(&self.error);
                }
            }
            OperationStatus::Completed | OperationStatus::Pending => {
                next.lease = None;
                next.next_retry_at = None;
                next.error = None;
            }
        }

        Ok(next)
    }
}

/// Result of compacting one sealed partition
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompactionReport {
    pub partition: Option<PartitionId>,
    pub records_before: u64,
    pub records_after: u64,
    /// Completed operations whose last record was dropped
    pub operations_removed: u64,
    pub bytes_reclaimed: u64,
}

/// Result of a [`WalStore::gc`] pass
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GcReport {
    pub partitions_compacted: u64,
    pub partitions_deleted: Vec<PartitionId>,
    pub records_dropped: u64,
    pub operations_removed: u64,
    pub bytes_reclaimed: u64,
}

/// Per-backend slice of [`WalStats`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendWalStats {
    pub backend: BackendId,
    pub active: Option<PartitionInfo>,
    pub sealed_partitions: u64,
    pub records: u64,
    pub bytes: u64,
    pub operations: u64,
}

/// WAL-wide statistics
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalStats {
    pub operations: u64,
    pub status_counts: BTreeMap<String, u64>,
    pub total_bytes: u64,
    pub max_total_bytes: u64,
    pub next_lsn: u64,
    pub backends: Vec<BackendWalStats>,
}

/// Latest snapshot of an operation plus where its records live
struct IndexEntry {
    op: Operation,
    lsn: u64,
    /// Record count per partition sequence number in the operation's backend
    records: BTreeMap<u64, u32>,
}

impl IndexEntry {
    fn add_record(&mut self, seq: u64) {
        *self.records.entry(seq).or_default() += 1;
    }

    fn drop_record(&mut self, seq: u64) {
        if let Some(count) = self.records.get_mut(&seq) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.records.remove(&seq);
            }
        }
    }
}

/// Partition files of one backend
struct BackendLog {
    backend: BackendId,
    dir: PathBuf,
    active: Option<ActivePartition>,
    sealed: BTreeMap<u64, PartitionMeta>,
    next_seq: u64,
}

impl BackendLog {
    fn empty(backend: BackendId, dir: PathBuf) -> Self {
        Self {
            backend,
            dir,
            active: None,
            sealed: BTreeMap::new(),
            next_seq: 1,
        }
    }

    fn partition_id(&self, seq: u64) -> PartitionId {
        PartitionId::new(self.backend.clone(), seq)
    }

    fn bytes(&self) -> u64 {
        self.sealed.values().map(|m| m.bytes).sum::<u64>()
            + self.active.as_ref().map_or(0, |a| a.meta.bytes)
    }

    fn records(&self) -> u64 {
        self.sealed.values().map(|m| m.records).sum::<u64>()
            + self.active.as_ref().map_or(0, |a| a.meta.records)
    }

    fn partitions(&self) -> Vec<PartitionInfo> {
        let mut infos: Vec<PartitionInfo> = self
            .sealed
            .iter()
            .map(|(seq, meta)| meta.info(self.partition_id(*seq), PartitionState::Sealed))
            .collect();
        if let Some(active) = &self.active {
            infos.push(
                active
                    .meta
                    .info(self.partition_id(active.seq), PartitionState::Active),
            );
        }
        infos
    }
}

/// Partitioned, durable log of operations
pub struct WalStore {
    root: PathBuf,
    config: WalConfig,
    clock: SharedClock,
    next_lsn: AtomicU64,
    total_bytes: AtomicU64,
    logs: RwLock<BTreeMap<BackendId, Arc<Mutex<BackendLog>>>>,
    index: RwLock<HashMap<OperationId, IndexEntry>>,
    closed: AtomicBool,
    changed: Notify,
}

impl WalStore {
    /// Open (or create) a WAL rooted at `root`, replaying every partition
    pub fn open(root: impl AsRef<Path>, config: WalConfig, clock: SharedClock) -> Result<WalHandle> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut logs = BTreeMap::new();
        let mut index = HashMap::new();
        let mut max_lsn = 0u64;
        let mut total_bytes = 0u64;

        let mut dirs: Vec<(BackendId, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().map(BackendId::new) {
                Some(Ok(backend)) => dirs.push((backend, entry.path())),
                _ => warn!(
                    path = %entry.path().display(),
                    "Ignoring directory that is not a backend ID"
                ),
            }
        }
        dirs.sort();

        for (backend, dir) in dirs {
            let log = Self::recover_backend(backend.clone(), dir, &config, &mut index, &mut max_lsn)?;
            total_bytes += log.bytes();
            logs.insert(backend, Arc::new(Mutex::new(log)));
        }

        info!(
            root = %root.display(),
            backends = logs.len(),
            operations = index.len(),
            next_lsn = max_lsn + 1,
            total_bytes,
            "Opened WAL"
        );

        Ok(Arc::new(Self {
            root,
            config,
            clock,
            next_lsn: AtomicU64::new(max_lsn + 1),
            total_bytes: AtomicU64::new(total_bytes),
            logs: RwLock::new(logs),
            index: RwLock::new(index),
            closed: AtomicBool::new(false),
            changed: Notify::new(),
        }))
    }

    /// Replay one backend directory in sequence order
    fn recover_backend(
        backend: BackendId,
        dir: PathBuf,
        config: &WalConfig,
        index: &mut HashMap<OperationId, IndexEntry>,
        max_lsn: &mut u64,
    ) -> Result<BackendLog> {
        let mut files: Vec<(u64, PartitionState, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                debug!(path = %path.display(), "Removing leftover compaction file");
                fs::remove_file(&path)?;
                continue;
            }
            if let Some((seq, state)) = parse_partition_name(&path) {
                files.push((seq, state, path));
            }
        }
        files.sort_by_key(|(seq, _, _)| *seq);

        let mut log = BackendLog::empty(backend, dir);
        let last_seq = files.last().map(|(seq, _, _)| *seq);

        for (seq, state, path) in files {
            let decoded = match state {
                PartitionState::Sealed => read_sealed(&path)?,
                PartitionState::Active => recover_active(&path)?,
            };

            for record in &decoded.records {
                *max_lsn = (*max_lsn).max(record.lsn);
                match index.entry(record.op.id) {
                    Entry::Vacant(slot) => {
                        slot.insert(IndexEntry {
                            op: record.op.clone(),
                            lsn: record.lsn,
                            records: BTreeMap::from([(seq, 1)]),
                        });
                    }
                    Entry::Occupied(mut slot) => {
                        let entry = slot.get_mut();
                        entry.add_record(seq);
                        if record.lsn > entry.lsn {
                            entry.lsn = record.lsn;
                            entry.op = record.op.clone();
                        }
                    }
                }
            }

            let meta = PartitionMeta::from_records(&decoded.records, decoded.valid_len);
            match state {
                PartitionState::Active if Some(seq) == last_seq => {
                    log.active = Some(ActivePartition::reopen(
                        path,
                        seq,
                        meta,
                        config.sync_on_write,
                    )?);
                }
                PartitionState::Active => {
                    // A newer partition exists, so this one never receives appends again
                    warn!(path = %path.display(), "Sealing stale active partition");
                    fs::rename(&path, partition_path(&log.dir, seq, SEALED_EXT))?;
                    sync_dir(&log.dir)?;
                    log.sealed.insert(seq, meta);
                }
                PartitionState::Sealed => {
                    log.sealed.insert(seq, meta);
                }
            }
            log.next_seq = seq + 1;
        }

        debug!(
            backend = %log.backend,
            sealed = log.sealed.len(),
            active = ?log.active.as_ref().map(|a| a.seq),
            "Recovered backend log"
        );
        Ok(log)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Signalled after every durable mutation
    pub const fn changed(&self) -> &Notify {
        &self.changed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn log_for(&self, backend: &BackendId) -> Result<Arc<Mutex<BackendLog>>> {
        if let Some(log) = self.logs.read().get(backend) {
            return Ok(Arc::clone(log));
        }

        let mut logs = self.logs.write();
        if let Some(log) = logs.get(backend) {
            return Ok(Arc::clone(log));
        }
        let dir = self.root.join(backend.as_str());
        fs::create_dir_all(&dir)?;
        sync_dir(&self.root)?;
        let log = Arc::new(Mutex::new(BackendLog::empty(backend.clone(), dir)));
        logs.insert(backend.clone(), Arc::clone(&log));
        Ok(log)
    }

    fn existing_log(&self, backend: &BackendId) -> Option<Arc<Mutex<BackendLog>>> {
        self.logs.read().get(backend).cloned()
    }

    fn reserve(&self, len: u64) -> Result<()> {
        let max = self.config.max_total_bytes;
        self.total_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|total| *total <= max)
            })
            .map(|_| ())
            .map_err(|used| Error::CapacityExceeded {
                required: len,
                available: max.saturating_sub(used),
            })
    }

    /// Append one snapshot to the backend's active partition, rotating
    /// first if it is full. Returns `(lsn, partition seq)`.
    fn write_locked(&self, log: &mut BackendLog, op: &Operation) -> Result<(u64, u64)> {
        let now = self.clock.now();
        if log.active.as_ref().is_some_and(|active| {
            active.is_full(
                self.config.max_partition_entries,
                self.config.max_partition_age(),
                now,
            )
        }) {
            self.seal_locked(log)?;
        }

        if log.active.is_none() {
            let active = ActivePartition::create(&log.dir, log.next_seq, self.config.sync_on_write)?;
            debug!(partition = %log.partition_id(active.seq), "Opened active partition");
            log.next_seq += 1;
            log.active = Some(active);
        }
        let active = log
            .active
            .as_mut()
            .ok_or_else(|| Error::storage("no active partition"))?;

        let lsn = self.next_lsn.fetch_add(1, Ordering::AcqRel);
        let frame = WalRecord::encode(lsn, op)?;
        let len = frame.len() as u64;
        self.reserve(len)?;

        if let Err(e) = active.append(&frame, op.updated_at) {
            self.total_bytes.fetch_sub(len, Ordering::AcqRel);
            return Err(e);
        }
        Ok((lsn, active.seq))
    }

    fn seal_locked(&self, log: &mut BackendLog) -> Result<Option<PartitionId>> {
        let Some(active) = &log.active else {
            return Ok(None);
        };
        if active.meta.records == 0 {
            return Ok(None);
        }

        active.seal(&log.dir)?;
        let seq = active.seq;
        let meta = active.meta.clone();
        log.active = None;

        let id = log.partition_id(seq);
        info!(
            partition = %id,
            records = meta.records,
            bytes = meta.bytes,
            "Sealed WAL partition"
        );
        log.sealed.insert(seq, meta);
        Ok(Some(id))
    }

    /// Persist a new `Pending` operation; durable on return
    pub fn append(&self, op: Operation) -> Result<OperationId> {
        self.ensure_open()?;
        if op.status != OperationStatus::Pending {
            return Err(Error::invalid_argument(format!(
                "new operations must be pending, got {}",
                op.status
            )));
        }
        if op.max_attempts == 0 {
            return Err(Error::invalid_argument("max_attempts must be at least 1"));
        }

        let log = self.log_for(&op.backend_id)?;
        let mut log = log.lock();
        if self.index.read().contains_key(&op.id) {
            return Err(Error::invalid_argument(format!(
                "operation {} already exists",
                op.id
            )));
        }

        let (lsn, seq) = self.write_locked(&mut log, &op)?;
        let id = op.id;
        debug!(
            op = %id,
            backend = %op.backend_id,
            kind = op.kind.name(),
            lsn,
            "Appended operation"
        );
        self.index.write().insert(
            id,
            IndexEntry {
                op,
                lsn,
                records: BTreeMap::from([(seq, 1)]),
            },
        );
        drop(log);

        self.changed.notify_waiters();
        Ok(id)
    }

    /// Read-modify-write of one operation under its backend's log mutex.
    /// `f` returns `None` to leave the operation untouched.
    fn mutate<F>(&self, id: OperationId, f: F) -> Result<Option<Operation>>
    where
        F: FnOnce(&Operation, DateTime<Utc>) -> Result<Option<Operation>>,
    {
        self.ensure_open()?;
        let backend = self
            .index
            .read()
            .get(&id)
            .map(|entry| entry.op.backend_id.clone())
            .ok_or(Error::NotFound(id))?;
        let log = self.existing_log(&backend).ok_or(Error::NotFound(id))?;
        let mut log = log.lock();

        let current = self
            .index
            .read()
            .get(&id)
            .map(|entry| entry.op.clone())
            .ok_or(Error::NotFound(id))?;
        let Some(next) = f(&current, self.clock.now())? else {
            return Ok(None);
        };

        let (lsn, seq) = self.write_locked(&mut log, &next)?;
        if let Some(entry) = self.index.write().get_mut(&id) {
            entry.op = next.clone();
            entry.lsn = lsn;
            entry.add_record(seq);
        }
        drop(log);

        debug!(
            op = %id,
            from = %current.status,
            to = %next.status,
            lsn,
            "Operation status changed"
        );
        self.changed.notify_waiters();
        Ok(Some(next))
    }

    /// Apply a status change, validating it against the state machine
    pub fn transition(&self, id: OperationId, update: &StatusUpdate) -> Result<Operation> {
        self.mutate(id, |current, now| update.apply(current, now).map(Some))?
            .ok_or(Error::NotFound(id))
    }

    /// Move an operation to `new_status`, recording `error` if given
    pub fn update_status(
        &self,
        id: OperationId,
        new_status: OperationStatus,
        error: Option<OperationError>,
    ) -> Result<Operation> {
        self.transition(id, &StatusUpdate::to(new_status).with_error(error))
    }

    /// Compare-and-swap `expected -> Processing`, taking a lease for `worker`
    ///
    /// Exactly one concurrent claimer succeeds; the others see
    /// `InvalidTransition`.
    pub fn claim(
        &self,
        id: OperationId,
        expected: OperationStatus,
        worker: WorkerId,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Operation> {
        self.transition(
            id,
            &StatusUpdate::to(OperationStatus::Processing)
                .expecting(expected)
                .with_lease(Lease {
                    worker,
                    expires_at: lease_expires_at,
                }),
        )
    }

    /// Move every `Processing` operation whose lease expired back to
    /// `Retrying`, due immediately, without charging an attempt
    pub fn recover_expired_leases(&self) -> Result<Vec<Operation>> {
        let now = self.clock.now();
        let candidates: Vec<OperationId> = self
            .index
            .read()
            .values()
            .filter(|entry| {
                entry.op.status == OperationStatus::Processing
                    && entry.op.lease.is_none_or(|lease| lease.is_expired(now))
            })
            .map(|entry| entry.op.id)
            .collect();

        let mut recovered = Vec::new();
        for id in candidates {
            let result = self.mutate(id, |current, now| {
                let expired = current.status == OperationStatus::Processing
                    && current.lease.is_none_or(|lease| lease.is_expired(now));
                if !expired {
                    return Ok(None);
                }
                let owner = current
                    .lease
                    .map_or_else(|| "unknown worker".to_string(), |lease| lease.worker.to_string());
                let error = OperationError::new(
                    ErrorClass::LeaseExpired,
                    format!("lease held by {owner} expired"),
                    current.attempt_count,
                    now,
                );
                StatusUpdate::to(OperationStatus::Retrying)
                    .expecting(OperationStatus::Processing)
                    .with_error(Some(error))
                    .retry_at(now)
                    .apply(current, now)
                    .map(Some)
            });

            match result {
                Ok(Some(op)) => {
                    info!(op = %op.id, backend = %op.backend_id, "Recovered operation with expired lease");
                    recovered.push(op);
                }
                Ok(None) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Latest snapshot of an operation
    pub fn get(&self, id: OperationId) -> Result<Operation> {
        self.index
            .read()
            .get(&id)
            .map(|entry| entry.op.clone())
            .ok_or(Error::NotFound(id))
    }

    /// Number of operations known to the WAL
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Lazily list operations ordered by `(created_at, id)`
    pub fn list(&self, filter: ListFilter) -> OperationIter<'_> {
        self.list_after(filter, None)
    }

    /// Resume a listing strictly after `cursor`
    pub fn list_from(&self, filter: ListFilter, cursor: ListCursor) -> OperationIter<'_> {
        self.list_after(filter, Some(cursor))
    }

    fn list_after(&self, filter: ListFilter, after: Option<ListCursor>) -> OperationIter<'_> {
        let mut keys: Vec<ListCursor> = self
            .index
            .read()
            .values()
            .filter(|entry| filter.matches(&entry.op))
            .map(|entry| ListCursor {
                created_at: entry.op.created_at,
                id: entry.op.id,
            })
            .filter(|key| after.is_none_or(|cursor| *key > cursor))
            .collect();
        keys.sort_unstable();
        OperationIter::new(self, filter, keys)
    }

    /// Seal the backend's active partition; `None` if it has no records
    pub fn seal_partition(&self, backend: &BackendId) -> Result<Option<PartitionId>> {
        self.ensure_open()?;
        let Some(log) = self.existing_log(backend) else {
            return Ok(None);
        };
        let mut log = log.lock();
        self.seal_locked(&mut log)
    }

    /// Partitions of one backend, or of all backends
    pub fn partitions(&self, backend: Option<&BackendId>) -> Vec<PartitionInfo> {
        let logs: Vec<Arc<Mutex<BackendLog>>> = self
            .logs
            .read()
            .iter()
            .filter(|(id, _)| backend.is_none_or(|b| *id == b))
            .map(|(_, log)| Arc::clone(log))
            .collect();
        logs.iter().flat_map(|log| log.lock().partitions()).collect()
    }

    /// Compact a sealed partition using the configured retention
    pub fn compact(&self, partition: &PartitionId) -> Result<CompactionReport> {
        self.ensure_open()?;
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(self.config.retention())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let log = self
            .existing_log(&partition.backend)
            .ok_or_else(|| Error::PartitionNotFound {
                backend: partition.backend.clone(),
                seq: partition.seq,
            })?;
        let mut log = log.lock();
        self.compact_locked(&mut log, partition.seq, cutoff)
    }

    /// Rewrite a sealed partition without superseded records and without
    /// completed operations last updated before `cutoff` that have no
    /// record in any other partition
    fn compact_locked(
        &self,
        log: &mut BackendLog,
        seq: u64,
        cutoff: DateTime<Utc>,
    ) -> Result<CompactionReport> {
        let id = log.partition_id(seq);
        if log.active.as_ref().is_some_and(|active| active.seq == seq) {
            return Err(Error::storage(format!(
                "partition {id} is active; seal it before compacting"
            )));
        }
        let old_meta = log
            .sealed
            .get(&seq)
            .cloned()
            .ok_or_else(|| Error::PartitionNotFound {
                backend: log.backend.clone(),
                seq,
            })?;

        let decoded = read_sealed(&partition_path(&log.dir, seq, SEALED_EXT))?;
        let records_before = decoded.records.len() as u64;

        let mut kept = Vec::new();
        let mut dropped = Vec::new();
        let mut removed = Vec::new();
        {
            let index = self.index.read();
            for record in decoded.records {
                let op_id = record.op.id;
                let Some(entry) = index.get(&op_id) else {
                    dropped.push(op_id);
                    continue;
                };
                if record.lsn < entry.lsn {
                    dropped.push(op_id);
                    continue;
                }
                let expired = entry.op.status == OperationStatus::Completed
                    && entry.op.updated_at < cutoff
                    && entry.records.keys().all(|s| *s == seq);
                if expired {
                    dropped.push(op_id);
                    removed.push(op_id);
                    continue;
                }
                kept.push(record);
            }
        }

        let mut report = CompactionReport {
            partition: Some(id.clone()),
            records_before,
            records_after: records_before,
            ..CompactionReport::default()
        };
        if dropped.is_empty() {
            return Ok(report);
        }

        let frames = kept
            .iter()
            .map(|record| WalRecord::encode(record.lsn, &record.op))
            .collect::<Result<Vec<_>>>()?;
        let new_bytes = rewrite_sealed(&log.dir, seq, &frames, self.config.write_buffer_size)?;

        {
            let mut index = self.index.write();
            for op_id in &dropped {
                if let Some(entry) = index.get_mut(op_id) {
                    entry.drop_record(seq);
                }
            }
            for op_id in &removed {
                index.remove(op_id);
            }
        }

        let reclaimed = old_meta.bytes.saturating_sub(new_bytes);
        self.total_bytes.fetch_sub(reclaimed, Ordering::AcqRel);
        log.sealed
            .insert(seq, PartitionMeta::from_records(&kept, new_bytes));

        report.records_after = kept.len() as u64;
        report.operations_removed = removed.len() as u64;
        report.bytes_reclaimed = reclaimed;
        info!(
            partition = %id,
            records_before,
            records_after = report.records_after,
            operations_removed = report.operations_removed,
            bytes_reclaimed = reclaimed,
            "Compacted WAL partition"
        );
        Ok(report)
    }

    /// Compact every sealed partition whose newest record predates
    /// `before`, using `before` as the retention cutoff, then delete the
    /// partitions left empty
    pub fn gc(&self, before: DateTime<Utc>) -> Result<GcReport> {
        self.ensure_open()?;
        let logs: Vec<Arc<Mutex<BackendLog>>> = self.logs.read().values().cloned().collect();
        let mut report = GcReport::default();

        for log in logs {
            let mut log = log.lock();
            let candidates: Vec<u64> = log
                .sealed
                .iter()
                .filter(|(_, meta)| meta.newest_record_at.is_none_or(|at| at < before))
                .map(|(seq, _)| *seq)
                .collect();

            for seq in candidates {
                let compacted = self.compact_locked(&mut log, seq, before)?;
                report.partitions_compacted += 1;
                report.records_dropped += compacted.records_before - compacted.records_after;
                report.operations_removed += compacted.operations_removed;
                report.bytes_reclaimed += compacted.bytes_reclaimed;
            }

            let empty: Vec<u64> = log
                .sealed
                .iter()
                .filter(|(_, meta)| meta.records == 0)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in &empty {
                fs::remove_file(partition_path(&log.dir, *seq, SEALED_EXT))?;
                if let Some(meta) = log.sealed.remove(seq) {
                    self.total_bytes.fetch_sub(meta.bytes, Ordering::AcqRel);
                }
                report.partitions_deleted.push(log.partition_id(*seq));
            }
            if !empty.is_empty() {
                sync_dir(&log.dir)?;
            }
        }

        info!(
            partitions_compacted = report.partitions_compacted,
            partitions_deleted = report.partitions_deleted.len(),
            records_dropped = report.records_dropped,
            operations_removed = report.operations_removed,
            "WAL garbage collection finished"
        );
        Ok(report)
    }

    pub fn stats(&self) -> WalStats {
        let mut status_counts: BTreeMap<String, u64> = OperationStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        let mut per_backend: HashMap<BackendId, u64> = HashMap::new();
        let operations = {
            let index = self.index.read();
            for entry in index.values() {
                *status_counts
                    .entry(entry.op.status.as_str().to_string())
                    .or_default() += 1;
                *per_backend.entry(entry.op.backend_id.clone()).or_default() += 1;
            }
            index.len() as u64
        };

        let logs: Vec<Arc<Mutex<BackendLog>>> = self.logs.read().values().cloned().collect();
        let backends = logs
            .iter()
            .map(|log| {
                let log = log.lock();
                BackendWalStats {
                    backend: log.backend.clone(),
                    active: log
                        .active
                        .as_ref()
                        .map(|a| a.meta.info(log.partition_id(a.seq), PartitionState::Active)),
                    sealed_partitions: log.sealed.len() as u64,
                    records: log.records(),
                    bytes: log.bytes(),
                    operations: per_backend.get(&log.backend).copied().unwrap_or(0),
                }
            })
            .collect();

        WalStats {
            operations,
            status_counts,
            total_bytes: self.total_bytes.load(Ordering::Acquire),
            max_total_bytes: self.config.max_total_bytes,
            next_lsn: self.next_lsn.load(Ordering::Acquire),
            backends,
        }
    }

    /// Fsync every active partition
    pub fn sync(&self) -> Result<()> {
        let logs: Vec<Arc<Mutex<BackendLog>>> = self.logs.read().values().cloned().collect();
        for log in logs {
            if let Some(active) = &log.lock().active {
                active.sync()?;
            }
        }
        Ok(())
    }

    /// Reject further writes and flush every active partition
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sync()?;
        self.changed.notify_waiters();
        info!(root = %self.root.display(), "WAL shut down");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Barrier;
    use stowage_common::{Clock, ManualClock, OperationKind, PayloadRef};

    fn config() -> WalConfig {
        WalConfig {
            sync_on_write: true,
            max_partition_entries: 1000,
            ..WalConfig::default()
        }
    }

    fn backend(name: &str) -> BackendId {
        BackendId::new(name).unwrap()
    }

    fn pin(clock: &ManualClock, backend_name: &str, content: &str) -> Operation {
        Operation::new(
            OperationKind::Pin {
                content: content.into(),
            },
            backend(backend_name),
            PayloadRef::new(format!("payload/{content}")),
            3,
            clock.now(),
        )
    }

    fn open(dir: &Path, config: WalConfig, clock: &Arc<ManualClock>) -> WalHandle {
        WalStore::open(dir, config, Arc::clone(clock) as SharedClock).unwrap()
    }

    #[test]
    fn test_append_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);

        let op = pin(&clock, "ipfs", "bafy1");
        let id = wal.append(op.clone()).unwrap();
        assert_eq!(id, op.id);
        assert_eq!(wal.get(id).unwrap(), op);
        assert!(dir.path().join("ipfs").join("0000000001.active").exists());
    }

    #[test]
    fn test_append_rejects_duplicates_and_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);

        let op = pin(&clock, "ipfs", "bafy1");
        wal.append(op.clone()).unwrap();
        assert!(matches!(wal.append(op), Err(Error::InvalidArgument(_))));

        let mut zero = pin(&clock, "ipfs", "bafy2");
        zero.max_attempts = 0;
        assert!(matches!(wal.append(zero), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();

        let (appended, claimed) = {
            let wal = open(dir.path(), config(), &clock);
            let a = pin(&clock, "ipfs", "a");
            let b = pin(&clock, "s3", "b");
            wal.append(a.clone()).unwrap();
            wal.append(b.clone()).unwrap();
            let claimed = wal
                .claim(
                    b.id,
                    OperationStatus::Pending,
                    WorkerId(1),
                    clock.now() + chrono::Duration::seconds(30),
                )
                .unwrap();
            crate::shutdown(wal).unwrap();
            (a, claimed)
        };

        let wal = open(dir.path(), config(), &clock);
        assert_eq!(wal.get(appended.id).unwrap(), appended);
        assert_eq!(wal.get(claimed.id).unwrap(), claimed);
        assert_eq!(wal.len(), 2);

        // LSNs keep growing after recovery
        let c = pin(&clock, "ipfs", "c");
        wal.append(c.clone()).unwrap();
        let stats = wal.stats();
        assert_eq!(stats.next_lsn, 5);
    }

    #[test]
    fn test_torn_tail_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let op = pin(&clock, "ipfs", "a");
        {
            let wal = open(dir.path(), config(), &clock);
            wal.append(op.clone()).unwrap();
        }

        let active = dir.path().join("ipfs").join("0000000001.active");
        let mut data = fs::read(&active).unwrap();
        let good_len = data.len();
        data.extend_from_slice(&crate::record::WAL_MAGIC.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3]);
        fs::write(&active, &data).unwrap();

        let wal = open(dir.path(), config(), &clock);
        assert_eq!(wal.get(op.id).unwrap(), op);
        assert_eq!(fs::metadata(&active).unwrap().len(), good_len as u64);

        // Appends continue after the truncated tail
        let next = pin(&clock, "ipfs", "b");
        wal.append(next.clone()).unwrap();
        drop(wal);
        let wal = open(dir.path(), config(), &clock);
        assert_eq!(wal.get(next.id).unwrap(), next);
    }

    #[test]
    fn test_sealed_corruption_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        {
            let wal = open(dir.path(), config(), &clock);
            wal.append(pin(&clock, "ipfs", "a")).unwrap();
            wal.seal_partition(&backend("ipfs")).unwrap();
        }

        let sealed = dir.path().join("ipfs").join("0000000001.sealed");
        let mut data = fs::read(&sealed).unwrap();
        data[20] ^= 0xff;
        fs::write(&sealed, &data).unwrap();

        let result = WalStore::open(dir.path(), config(), Arc::clone(&clock) as SharedClock);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_update_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);
        let id = wal.append(pin(&clock, "ipfs", "a")).unwrap();

        // Pending -> Completed skips Processing
        let err = wal
            .update_status(id, OperationStatus::Completed, None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: OperationStatus::Pending,
                to: OperationStatus::Completed,
                ..
            }
        ));

        wal.update_status(id, OperationStatus::Processing, None)
            .unwrap();
        let error = OperationError::new(ErrorClass::Transient, "connection reset", 1, clock.now());
        let retrying = wal
            .update_status(id, OperationStatus::Retrying, Some(error.clone()))
            .unwrap();
        assert_eq!(retrying.error, Some(error.clone()));
        assert_eq!(retrying.next_retry_at, Some(clock.now()));

        wal.update_status(id, OperationStatus::Processing, None)
            .unwrap();
        let done = wal
            .update_status(id, OperationStatus::Completed, None)
            .unwrap();
        assert_eq!(done.error, None);
        assert_eq!(done.error_history, vec![error]);

        assert!(matches!(
            wal.update_status(id, OperationStatus::Pending, None),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            wal.update_status(OperationId::new(), OperationStatus::Processing, None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_claim_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);

        for round in 0..20 {
            let id = wal.append(pin(&clock, "ipfs", &format!("c{round}"))).unwrap();
            let workers = 8;
            let barrier = Arc::new(Barrier::new(workers));
            let lease_until = clock.now() + chrono::Duration::seconds(30);

            let handles: Vec<_> = (0..workers)
                .map(|n| {
                    let wal = Arc::clone(&wal);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        wal.claim(
                            id,
                            OperationStatus::Pending,
                            WorkerId(u32::try_from(n).unwrap()),
                            lease_until,
                        )
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1, "round {round}");
            assert!(results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, Error::InvalidTransition { .. })));

            let owner = winners[0].lease.unwrap().worker;
            assert_eq!(wal.get(id).unwrap().lease.unwrap().worker, owner);
        }
    }

    #[test]
    fn test_rotation_by_entries_and_age() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(
            dir.path(),
            WalConfig {
                max_partition_entries: 2,
                max_partition_age_secs: 60,
                ..config()
            },
            &clock,
        );
        let ipfs = backend("ipfs");

        for n in 0..3 {
            wal.append(pin(&clock, "ipfs", &format!("e{n}"))).unwrap();
        }
        let parts = wal.partitions(Some(&ipfs));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].state, PartitionState::Sealed);
        assert_eq!(parts[0].records, 2);
        assert_eq!(parts[1].state, PartitionState::Active);
        assert_eq!(parts[1].records, 1);

        clock.advance(chrono::Duration::seconds(61));
        wal.append(pin(&clock, "ipfs", "late")).unwrap();
        let parts = wal.partitions(Some(&ipfs));
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].id.seq, 3);
    }

    #[test]
    fn test_partitions_isolated_per_backend() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);

        wal.append(pin(&clock, "ipfs", "a")).unwrap();
        wal.append(pin(&clock, "s3", "b")).unwrap();
        assert_eq!(wal.seal_partition(&backend("ipfs")).unwrap().unwrap().seq, 1);
        // Empty active partitions are not sealed
        assert_eq!(wal.seal_partition(&backend("ipfs")).unwrap(), None);
        assert_eq!(wal.seal_partition(&backend("filecoin")).unwrap(), None);

        let s3 = wal.partitions(Some(&backend("s3")));
        assert_eq!(s3.len(), 1);
        assert_eq!(s3[0].state, PartitionState::Active);
    }

    #[test]
    fn test_list_filters_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);

        let mut ids = Vec::new();
        for n in 0..5 {
            clock.advance(chrono::Duration::seconds(1));
            ids.push(wal.append(pin(&clock, "ipfs", &format!("l{n}"))).unwrap());
        }
        wal.append(pin(&clock, "s3", "other")).unwrap();
        wal.update_status(ids[1], OperationStatus::Processing, None)
            .unwrap();

        let ipfs_pending = ListFilter::all()
            .with_backend(backend("ipfs"))
            .with_status(OperationStatus::Pending);
        let mut iter = wal.list(ipfs_pending.clone());
        let first: Vec<OperationId> = iter.by_ref().take(2).map(|op| op.id).collect();
        assert_eq!(first, vec![ids[0], ids[2]]);

        let cursor = iter.cursor().unwrap();
        let rest: Vec<OperationId> = wal
            .list_from(ipfs_pending, cursor)
            .map(|op| op.id)
            .collect();
        assert_eq!(rest, vec![ids[3], ids[4]]);

        assert_eq!(wal.list(ListFilter::all()).count(), 6);
    }

    #[test]
    fn test_capacity_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(
            dir.path(),
            WalConfig {
                max_total_bytes: 300,
                ..config()
            },
            &clock,
        );

        let mut appended = 0;
        let err = loop {
            match wal.append(pin(&clock, "ipfs", &format!("cap{appended}"))) {
                Ok(_) => appended += 1,
                Err(e) => break e,
            }
            assert!(appended < 100);
        };
        assert!(matches!(err, Error::CapacityExceeded { .. }));
        assert_eq!(wal.len(), appended);
        assert!(wal.stats().total_bytes <= 300);
    }

    #[test]
    fn test_compact_drops_superseded_and_expired() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(
            dir.path(),
            WalConfig {
                retention_secs: 3600,
                ..config()
            },
            &clock,
        );
        let ipfs = backend("ipfs");

        let done = wal.append(pin(&clock, "ipfs", "done")).unwrap();
        let waiting = wal.append(pin(&clock, "ipfs", "waiting")).unwrap();
        let failed = wal.append(pin(&clock, "ipfs", "failed")).unwrap();
        for id in [done, failed] {
            wal.update_status(id, OperationStatus::Processing, None)
                .unwrap();
        }
        wal.update_status(done, OperationStatus::Completed, None)
            .unwrap();
        wal.update_status(failed, OperationStatus::Failed, None)
            .unwrap();
        let sealed = wal.seal_partition(&ipfs).unwrap().unwrap();

        // Within retention only superseded records go
        let report = wal.compact(&sealed).unwrap();
        assert_eq!(report.records_before, 7);
        assert_eq!(report.records_after, 3);
        assert_eq!(report.operations_removed, 0);
        assert_eq!(wal.get(done).unwrap().status, OperationStatus::Completed);

        clock.advance(chrono::Duration::seconds(3601));
        let report = wal.compact(&sealed).unwrap();
        assert_eq!(report.operations_removed, 1);
        assert_eq!(report.records_after, 2);
        assert!(matches!(wal.get(done), Err(Error::NotFound(_))));
        assert_eq!(wal.get(waiting).unwrap().status, OperationStatus::Pending);
        assert_eq!(wal.get(failed).unwrap().status, OperationStatus::Failed);

        // Survives restart
        drop(wal);
        let wal = open(dir.path(), config(), &clock);
        assert_eq!(wal.len(), 2);
        assert!(matches!(wal.get(done), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_unbounded_retention_keeps_completed() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(
            dir.path(),
            WalConfig {
                retention_secs: u64::MAX,
                max_partition_age_secs: u64::MAX,
                ..config()
            },
            &clock,
        );

        let done = wal.append(pin(&clock, "ipfs", "done")).unwrap();
        wal.update_status(done, OperationStatus::Processing, None)
            .unwrap();
        wal.update_status(done, OperationStatus::Completed, None)
            .unwrap();
        clock.advance(chrono::Duration::days(365));
        wal.append(pin(&clock, "ipfs", "later")).unwrap();
        let sealed = wal.seal_partition(&backend("ipfs")).unwrap().unwrap();

        let report = wal.compact(&sealed).unwrap();
        assert_eq!(report.operations_removed, 0);
        assert_eq!(wal.get(done).unwrap().status, OperationStatus::Completed);
    }

    #[test]
    fn test_compact_rejects_active_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);
        wal.append(pin(&clock, "ipfs", "a")).unwrap();

        let active = PartitionId::new(backend("ipfs"), 1);
        assert!(matches!(wal.compact(&active), Err(Error::Storage(_))));
        assert!(matches!(
            wal.compact(&PartitionId::new(backend("ipfs"), 9)),
            Err(Error::PartitionNotFound { .. })
        ));
    }

    #[test]
    fn test_completed_kept_while_older_records_remain() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(
            dir.path(),
            WalConfig {
                retention_secs: 10,
                ..config()
            },
            &clock,
        );
        let ipfs = backend("ipfs");

        let id = wal.append(pin(&clock, "ipfs", "split")).unwrap();
        let first = wal.seal_partition(&ipfs).unwrap().unwrap();
        wal.update_status(id, OperationStatus::Processing, None)
            .unwrap();
        wal.update_status(id, OperationStatus::Completed, None)
            .unwrap();
        let second = wal.seal_partition(&ipfs).unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(11));

        // The Pending record in the first partition pins the final record
        let report = wal.compact(&second).unwrap();
        assert_eq!(report.operations_removed, 0);
        assert_eq!(report.records_after, 1);

        wal.compact(&first).unwrap();
        let report = wal.compact(&second).unwrap();
        assert_eq!(report.operations_removed, 1);
        assert!(wal.is_empty());
    }

    #[test]
    fn test_gc_deletes_empty_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);
        let ipfs = backend("ipfs");

        let id = wal.append(pin(&clock, "ipfs", "gc")).unwrap();
        wal.update_status(id, OperationStatus::Processing, None)
            .unwrap();
        wal.update_status(id, OperationStatus::Completed, None)
            .unwrap();
        let sealed = wal.seal_partition(&ipfs).unwrap().unwrap();
        let keep = wal.append(pin(&clock, "ipfs", "keep")).unwrap();

        clock.advance(chrono::Duration::seconds(5));
        let report = wal.gc(clock.now()).unwrap();
        assert_eq!(report.partitions_compacted, 1);
        assert_eq!(report.partitions_deleted, vec![sealed]);
        assert_eq!(report.operations_removed, 1);
        assert_eq!(report.records_dropped, 3);
        assert!(!dir.path().join("ipfs").join("0000000001.sealed").exists());
        assert_eq!(wal.get(keep).unwrap().status, OperationStatus::Pending);
    }

    #[test]
    fn test_recover_expired_leases() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);

        let stale = wal.append(pin(&clock, "ipfs", "stale")).unwrap();
        let fresh = wal.append(pin(&clock, "ipfs", "fresh")).unwrap();
        wal.claim(
            stale,
            OperationStatus::Pending,
            WorkerId(1),
            clock.now() + chrono::Duration::seconds(5),
        )
        .unwrap();
        wal.claim(
            fresh,
            OperationStatus::Pending,
            WorkerId(2),
            clock.now() + chrono::Duration::seconds(60),
        )
        .unwrap();

        clock.advance(chrono::Duration::seconds(10));
        let recovered = wal.recover_expired_leases().unwrap();
        assert_eq!(recovered.len(), 1);

        let op = wal.get(stale).unwrap();
        assert_eq!(op.status, OperationStatus::Retrying);
        assert_eq!(op.attempt_count, 0);
        assert_eq!(op.next_retry_at, Some(clock.now()));
        assert_eq!(op.lease, None);
        assert_eq!(op.error.unwrap().class, ErrorClass::LeaseExpired);
        assert_eq!(wal.get(fresh).unwrap().status, OperationStatus::Processing);
    }

    #[test]
    fn test_shutdown_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);
        let id = wal.append(pin(&clock, "ipfs", "a")).unwrap();

        wal.shutdown().unwrap();
        assert!(wal.is_closed());
        assert!(matches!(
            wal.append(pin(&clock, "ipfs", "b")),
            Err(Error::ShuttingDown)
        ));
        // Reads still work
        assert!(wal.get(id).is_ok());
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let wal = open(dir.path(), config(), &clock);
        let a = wal.append(pin(&clock, "ipfs", "a")).unwrap();
        wal.append(pin(&clock, "s3", "b")).unwrap();
        wal.update_status(a, OperationStatus::Processing, None)
            .unwrap();

        let stats = wal.stats();
        assert_eq!(stats.operations, 2);
        assert_eq!(stats.status_counts["pending"], 1);
        assert_eq!(stats.status_counts["processing"], 1);
        assert_eq!(stats.status_counts["failed"], 0);
        assert_eq!(stats.backends.len(), 2);
        let ipfs = stats
            .backends
            .iter()
            .find(|b| b.backend.as_str() == "ipfs")
            .unwrap();
        assert_eq!(ipfs.records, 2);
        assert_eq!(ipfs.operations, 1);
        assert_eq!(
            stats.total_bytes,
            stats.backends.iter().map(|b| b.bytes).sum::<u64>()
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_replay_matches_live_state(
            steps in prop::collection::vec(
                (0usize..4, prop::sample::select(OperationStatus::ALL.to_vec())),
                1..40,
            ),
            max_entries in 1u64..5,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let clock = ManualClock::starting_now();
            let config = WalConfig {
                max_partition_entries: max_entries,
                ..config()
            };
            let wal = open(dir.path(), config.clone(), &clock);
            let ids: Vec<OperationId> = (0..4)
                .map(|n| wal.append(pin(&clock, "ipfs", &format!("p{n}"))).unwrap())
                .collect();

            for (slot, status) in steps {
                clock.advance(chrono::Duration::milliseconds(10));
                let before = wal.get(ids[slot]).unwrap().status;
                match wal.update_status(ids[slot], status, None) {
                    Ok(op) => {
                        prop_assert!(before.can_transition_to(status));
                        prop_assert_eq!(op.status, status);
                    }
                    Err(Error::InvalidTransition { .. }) => {
                        prop_assert!(!before.can_transition_to(status));
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {e}"),
                }
            }

            let live: Vec<Operation> = ids.iter().map(|id| wal.get(*id).unwrap()).collect();
            drop(wal);
            let wal = open(dir.path(), config, &clock);
            let replayed: Vec<Operation> = ids.iter().map(|id| wal.get(*id).unwrap()).collect();
            prop_assert_eq!(live, replayed);
        }
    }
}
