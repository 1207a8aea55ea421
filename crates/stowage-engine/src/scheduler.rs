//! Work scheduler
//!
//! Per backend, pending operations wait in a queue ordered by `created_at`
//! and retrying operations wait in a min-heap keyed by `next_retry_at`.
//! Backends are visited round-robin so one busy backend cannot starve the
//! others. A retrying operation only becomes eligible at its retry time,
//! which relaxes strict FIFO in favor of liveness.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use stowage_common::{BackendId, Operation, OperationId, OperationStatus};
use stowage_wal::{ListFilter, WalStore};
use tokio::sync::Notify;
use tracing::debug;

/// An operation handed to a worker, with the status it must be claimed from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub id: OperationId,
    pub backend: BackendId,
    pub expected: OperationStatus,
}

#[derive(Default)]
struct BackendQueue {
    pending: BTreeSet<(DateTime<Utc>, OperationId)>,
    retrying: BinaryHeap<Reverse<(DateTime<Utc>, OperationId)>>,
}

impl BackendQueue {
    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.retrying.is_empty()
    }

    fn len(&self) -> usize {
        self.pending.len() + self.retrying.len()
    }

    fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<(OperationId, OperationStatus)> {
        if let Some(Reverse((due, _))) = self.retrying.peek() {
            if *due <= now {
                return self
                    .retrying
                    .pop()
                    .map(|Reverse((_, id))| (id, OperationStatus::Retrying));
            }
        }
        self.pending
            .pop_first()
            .map(|(_, id)| (id, OperationStatus::Pending))
    }
}

#[derive(Default)]
struct SchedulerState {
    queues: BTreeMap<BackendId, BackendQueue>,
    /// Backend visited first on the next poll
    next_backend: usize,
}

#[derive(Default)]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    ready: Notify,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the queues from the WAL's pending and retrying operations
    pub fn rebuild(&self, wal: &WalStore) -> usize {
        let mut queues: BTreeMap<BackendId, BackendQueue> = BTreeMap::new();
        let mut count = 0usize;
        for op in wal.list(ListFilter::all()) {
            let queue = queues.entry(op.backend_id.clone()).or_default();
            match op.status {
                OperationStatus::Pending => {
                    queue.pending.insert((op.created_at, op.id));
                }
                OperationStatus::Retrying => {
                    let due = op.next_retry_at.unwrap_or(op.updated_at);
                    queue.retrying.push(Reverse((due, op.id)));
                }
                _ => continue,
            }
            count += 1;
        }
        queues.retain(|_, queue| !queue.is_empty());

        let mut state = self.state.lock();
        state.queues = queues;
        state.next_backend = 0;
        drop(state);

        debug!(operations = count, "Rebuilt scheduler from WAL");
        if count > 0 {
            self.ready.notify_one();
        }
        count
    }

    /// Queue a freshly submitted operation
    pub fn schedule_pending(&self, op: &Operation) {
        self.state
            .lock()
            .queues
            .entry(op.backend_id.clone())
            .or_default()
            .pending
            .insert((op.created_at, op.id));
        self.ready.notify_one();
    }

    /// Queue an operation to run again at `due`
    pub fn schedule_retry(&self, backend: &BackendId, id: OperationId, due: DateTime<Utc>) {
        self.state
            .lock()
            .queues
            .entry(backend.clone())
            .or_default()
            .retrying
            .push(Reverse((due, id)));
        self.ready.notify_one();
    }

    /// Take the next runnable operation, visiting eligible backends
    /// round-robin. Work for ineligible backends stays queued.
    pub fn next_ready(
        &self,
        now: DateTime<Utc>,
        eligible: impl Fn(&BackendId) -> bool,
    ) -> Option<Ticket> {
        let mut state = self.state.lock();
        let backends = state.queues.len();
        if backends == 0 {
            return None;
        }

        let start = state.next_backend % backends;
        let mut ticket = None;
        for offset in 0..backends {
            let index = (start + offset) % backends;
            let Some((backend, queue)) = state.queues.iter_mut().nth(index) else {
                break;
            };
            if !eligible(backend) {
                continue;
            }
            if let Some((id, expected)) = queue.pop_ready(now) {
                ticket = Some((
                    index,
                    Ticket {
                        id,
                        backend: backend.clone(),
                        expected,
                    },
                ));
                break;
            }
        }

        let (index, ticket) = ticket?;
        state.next_backend = index + 1;
        if state
            .queues
            .get(&ticket.backend)
            .is_some_and(BackendQueue::is_empty)
        {
            state.queues.remove(&ticket.backend);
        }
        Some(ticket)
    }

    /// Earliest retry time across all backends
    pub fn next_retry_due(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .queues
            .values()
            .filter_map(|queue| queue.retrying.peek().map(|Reverse((due, _))| *due))
            .min()
    }

    /// Wait until new work is queued
    pub async fn notified(&self) {
        self.ready.notified().await;
    }

    pub fn len(&self) -> usize {
        self.state.lock().queues.values().map(BackendQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
