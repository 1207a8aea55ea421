//! WAL processor
//!
//! Workers repeatedly take a ticket from the [`Scheduler`], claim the
//! operation in the WAL (compare-and-swap to `Processing` with a lease),
//! call the backend with a bounded timeout and record the outcome:
//!
//! ```text
//! Pending ──claim──> Processing ──ok──────────────> Completed
//!                        │  ──transient (budget)──> Retrying ──due──> Processing
//!                        │  ──transient (spent)───> Failed
//!                        └─ ──permanent───────────> Failed
//! ```
//!
//! A caller deadline on the operation shortens the call timeout and rules
//! out retries that would land after it.
//!
//! No lock is held across the backend call. A worker that dies mid-call
//! leaves its operation `Processing`; the lease sweep moves it back to
//! `Retrying` once the lease expires.

use crate::backoff::Backoff;
use crate::scheduler::{Scheduler, Ticket};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use stowage_cache::{ReplicationEngine, TieredCache};
use stowage_common::config::ProcessorConfig;
use stowage_common::{
    BackendError, BackendOutcome, BackendRegistry, ContentKey, Error, Operation,
    OperationError, OperationKind, OperationStatus, Result, SharedClock, WorkerId,
};
use stowage_health::HealthMonitor;
use stowage_telemetry::Telemetry;
use stowage_wal::{StatusUpdate, WalHandle};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Processor {
    config: ProcessorConfig,
    wal: WalHandle,
    scheduler: Arc<Scheduler>,
    registry: BackendRegistry,
    health: Arc<HealthMonitor>,
    cache: Arc<TieredCache>,
    replication: Arc<ReplicationEngine>,
    telemetry: Arc<Telemetry>,
    clock: SharedClock,
    backoff: Backoff,
}

/// Running worker and sweeper tasks
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Stop every task. In-flight backend calls are abandoned and their
    /// operations stay `Processing` until lease recovery.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Processor task panicked: {e}");
            }
        }
    }
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProcessorConfig,
        wal: WalHandle,
        scheduler: Arc<Scheduler>,
        registry: BackendRegistry,
        health: Arc<HealthMonitor>,
        cache: Arc<TieredCache>,
        replication: Arc<ReplicationEngine>,
        telemetry: Arc<Telemetry>,
        clock: SharedClock,
    ) -> Self {
        let backoff = Backoff::from_config(&config);
        Self {
            config,
            wal,
            scheduler,
            registry,
            health,
            cache,
            replication,
            telemetry,
            clock,
            backoff,
        }
    }

    pub const fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Spawn `workers` worker tasks and the lease sweeper
    pub fn start(self: &Arc<Self>, workers: usize) -> ProcessorHandle {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(workers + 1);

        match self.sweep_leases() {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "Recovered expired leases at start"),
            Err(e) => warn!("Lease recovery failed at start: {e}"),
        }

        for n in 0..workers {
            let worker = WorkerId(u32::try_from(n).unwrap_or(u32::MAX));
            tasks.push(tokio::spawn(Arc::clone(self).worker_loop(worker, rx.clone())));
        }
        tasks.push(tokio::spawn(Arc::clone(self).sweep_loop(rx)));

        info!(workers, "WAL processor started");
        ProcessorHandle { shutdown, tasks }
    }

    async fn worker_loop(self: Arc<Self>, worker: WorkerId, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %worker, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = tokio::select! {
                result = self.process_one(worker) => result,
                _ = shutdown.changed() => break,
            };
            match processed {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(Error::ShuttingDown) => break,
                Err(e) => error!(worker = %worker, "Processing failed: {e}"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval()) => {}
                () = self.scheduler.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(worker = %worker, "Worker stopped");
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.lease_sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = self.sweep_leases() {
                warn!("Lease sweep failed: {e}");
            }
        }
    }

    /// Move operations with expired leases back to `Retrying` and queue them
    pub fn sweep_leases(&self) -> Result<usize> {
        let recovered = self.wal.recover_expired_leases()?;
        for op in &recovered {
            self.telemetry.record_status(OperationStatus::Retrying);
            let due = op.next_retry_at.unwrap_or(op.updated_at);
            self.scheduler.schedule_retry(&op.backend_id, op.id, due);
        }
        Ok(recovered.len())
    }

    /// Run one claim/execute/record cycle
    ///
    /// Returns the operation's snapshot after the cycle, or `None` when no
    /// eligible work is queued.
    pub async fn process_one(&self, worker: WorkerId) -> Result<Option<Operation>> {
        let Some(op) = self.claim_next(worker)? else {
            return Ok(None);
        };

        let adapter = match self.registry.get(&op.backend_id) {
            Ok(adapter) => adapter,
            Err(e) => {
                let failure = BackendError::permanent(e.to_string());
                return self.record_failure(op, failure, false).map(Some);
            }
        };

        // The caller's deadline, when tighter, replaces the backend timeout
        let backend_timeout = self.config.backend_timeout();
        let (timeout, caller_deadline) = match op.time_to_deadline(self.clock.now()) {
            Some(left) if left < backend_timeout => (left, true),
            _ => (backend_timeout, false),
        };

        let started = Instant::now();
        let mut deadline_reached = false;
        let result = if caller_deadline && timeout.is_zero() {
            deadline_reached = true;
            Err(BackendError::transient("deadline passed before the backend call"))
        } else {
            match tokio::time::timeout(timeout, adapter.execute(&op)).await {
                Ok(result) => result,
                Err(_) if caller_deadline => {
                    deadline_reached = true;
                    Err(BackendError::transient(format!(
                        "deadline reached after {timeout:?}"
                    )))
                }
                Err(_) => Err(BackendError::transient(format!(
                    "backend call timed out after {timeout:?}"
                ))),
            }
        };
        self.telemetry
            .record_operation_latency(&op.backend_id, started.elapsed());

        match result {
            Ok(outcome) => self.record_success(op, outcome).map(Some),
            Err(failure) => self.record_failure(op, failure, deadline_reached).map(Some),
        }
    }

    /// Claim the next runnable operation for an available backend
    fn claim_next(&self, worker: WorkerId) -> Result<Option<Operation>> {
        loop {
            let now = self.clock.now();
            let Some(Ticket { id, backend, expected }) = self
                .scheduler
                .next_ready(now, |backend| self.health.is_available(backend))
            else {
                return Ok(None);
            };

            let lease_until = now
                .checked_add_signed(self.config.lease())
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            match self.wal.claim(id, expected, worker, lease_until) {
                Ok(op) => {
                    self.telemetry.record_status(OperationStatus::Processing);
                    debug!(worker = %worker, op = %id, backend = %backend, attempt = op.attempt_count + 1, "Claimed operation");
                    return Ok(Some(op));
                }
                // Stale ticket: already claimed, finished or forgotten
                Err(Error::InvalidTransition { .. } | Error::NotFound(_)) => {
                    debug!(op = %id, backend = %backend, "Skipping stale ticket");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_success(&self, op: Operation, outcome: BackendOutcome) -> Result<Operation> {
        self.health.record_success(&op.backend_id);

        let done = self.wal.transition(
            op.id,
            &StatusUpdate::to(OperationStatus::Completed)
                .expecting(OperationStatus::Processing)
                .counting_attempt(),
        )?;
        self.telemetry.record_status(OperationStatus::Completed);
        info!(op = %done.id, backend = %done.backend_id, kind = done.kind.name(), attempts = done.attempt_count, "Operation completed");

        if let Some((key, data)) = outcome.content {
            self.cache_content(key, data);
        }
        self.apply_replica_effects(&done, outcome.stored);
        Ok(done)
    }

    /// Record a failed call. `deadline_reached` means the caller's deadline
    /// cut the call short, which neither counts against the backend's
    /// health nor leaves room for a retry.
    fn record_failure(
        &self,
        op: Operation,
        failure: BackendError,
        deadline_reached: bool,
    ) -> Result<Operation> {
        let now = self.clock.now();
        let attempt = op.attempt_count.saturating_add(1);
        let error = OperationError::new(failure.class, failure.message.clone(), attempt, now);

        if deadline_reached {
            debug!(op = %op.id, backend = %op.backend_id, "Caller deadline reached");
        } else if failure.is_transient() {
            self.health.record_failure(&op.backend_id, &failure.message);
        } else {
            // A permanent error means the backend answered
            self.health.record_success(&op.backend_id);
        }

        let due = (failure.is_transient() && !deadline_reached && attempt < op.max_attempts)
            .then(|| retry_time(now, self.backoff.delay(attempt)))
            .filter(|due| op.deadline.is_none_or(|deadline| *due < deadline));
        let retry = due.is_some();
        let update = match due {
            Some(due) => StatusUpdate::to(OperationStatus::Retrying).retry_at(due),
            None => StatusUpdate::to(OperationStatus::Failed),
        };
        let next = self.wal.transition(
            op.id,
            &update
                .expecting(OperationStatus::Processing)
                .with_error(Some(error))
                .counting_attempt(),
        )?;
        self.telemetry.record_status(next.status);

        if retry {
            let due = next.next_retry_at.unwrap_or(now);
            debug!(op = %next.id, backend = %next.backend_id, attempt, retry_at = %due, "Backend call failed, retrying: {}", failure.message);
            self.scheduler.schedule_retry(&next.backend_id, next.id, due);
        } else {
            warn!(
                op = %next.id,
                backend = %next.backend_id,
                kind = next.kind.name(),
                class = %failure.class,
                attempts = next.attempt_count,
                "Operation failed: {}",
                failure.message
            );
            if matches!(
                next.kind,
                OperationKind::Transfer { .. } | OperationKind::Migrate { .. }
            ) {
                self.replication
                    .on_transfer_failed(next.kind.content(), &next.backend_id);
            }
        }
        Ok(next)
    }

    fn cache_content(&self, key: ContentKey, data: Bytes) {
        if let Err(e) = self.cache.put(key.clone(), data) {
            warn!(key = %key, "Failed to cache backend output: {e}");
        }
    }

    /// Keep the cache's replica sets in step with a completed operation
    fn apply_replica_effects(&self, op: &Operation, stored: bool) {
        let key = op.kind.content();
        match &op.kind {
            OperationKind::Unpin { .. } => {
                self.cache.remove_replica(key, &op.backend_id);
            }
            OperationKind::Migrate {
                source,
                remove_source: true,
                ..
            } if stored => {
                self.cache.record_replica(key, op.backend_id.clone());
                self.cache.remove_replica(key, source);
            }
            _ if stored => {
                self.cache.record_replica(key, op.backend_id.clone());
            }
            _ => {}
        }

        if matches!(
            op.kind,
            OperationKind::Transfer { .. } | OperationKind::Migrate { .. }
        ) {
            self.replication.on_transfer_complete(key, &op.backend_id);
        }
        if stored && op.kind.creates_replica() {
            if let Err(e) = self.replication.reconcile(key) {
                warn!(key = %key, "Replication reconcile failed: {e}");
            }
        }
    }
}

fn retry_time(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use crate::testing::{backend, harness, key, Behavior};
    use bytes::Bytes;
    use chrono::Duration;
    use stowage_common::{
        Clock, ErrorClass, OperationKind, OperationStatus, PayloadRef, WorkerId,
    };
    use stowage_health::CircuitState;

    const WORKER: WorkerId = WorkerId(0);

    fn pin(content: &str) -> OperationKind {
        OperationKind::Pin {
            content: key(content),
        }
    }

    #[tokio::test]
    async fn test_success_completes_and_records_replica() {
        let h = harness(&[("ipfs", Behavior::Succeed)], |_| {});
        let content = key("bafy-pinned");
        h.engine
            .cache()
            .put(content.clone(), Bytes::from_static(b"data"))
            .unwrap();
        let id = h
            .engine
            .submit(pin("bafy-pinned"), backend("ipfs"), PayloadRef::new("p"), 3)
            .unwrap();

        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.id, id);
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.attempt_count, 1);
        assert!(op.lease.is_none());
        assert!(h
            .engine
            .cache()
            .replicas(&content)
            .unwrap()
            .contains(&backend("ipfs")));

        assert!(h.engine.processor().process_one(WORKER).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_output_is_cached() {
        let h = harness(&[("s3", Behavior::Succeed)], |_| {});
        h.engine
            .submit(
                OperationKind::Get {
                    content: key("s3://bucket/obj"),
                },
                backend("s3"),
                PayloadRef::new("s3://bucket/obj"),
                3,
            )
            .unwrap();

        h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(
            h.engine.cache().get(&key("s3://bucket/obj")),
            Some(Bytes::from("content of s3://bucket/obj"))
        );
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_attempts() {
        let h = harness(&[("filecoin", Behavior::Transient)], |_| {});
        let id = h
            .engine
            .submit(pin("bafy-deal"), backend("filecoin"), PayloadRef::new("p"), 3)
            .unwrap();

        let mut retry_times = Vec::new();
        for attempt in 1..=2 {
            let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
            assert_eq!(op.status, OperationStatus::Retrying);
            assert_eq!(op.attempt_count, attempt);
            let due = op.next_retry_at.unwrap();
            assert!(due > h.clock.now());
            retry_times.push(due);

            // Not eligible before its retry time
            assert!(h.engine.processor().process_one(WORKER).await.unwrap().is_none());
            h.clock.advance(Duration::seconds(10));
        }
        assert!(retry_times[0] < retry_times[1]);

        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.id, id);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.attempt_count, 3);
        assert_eq!(op.error_history.len(), 3);
        assert_eq!(op.error.as_ref().unwrap().class, ErrorClass::Transient);
        assert_eq!(h.backends["filecoin"].executions(), 3);
        assert_eq!(h.engine.telemetry().wal_retry_total(), 2);
        assert_eq!(
            h.engine.telemetry().wal_operations_total(OperationStatus::Failed),
            1
        );

        // Nothing left to run
        h.clock.advance(Duration::minutes(10));
        assert!(h.engine.processor().process_one(WORKER).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backoff_doubles_between_attempts() {
        let h = harness(&[("s3", Behavior::Transient)], |_| {});
        h.engine
            .submit(pin("obj"), backend("s3"), PayloadRef::new("p"), 5)
            .unwrap();

        let start = h.clock.now();
        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.next_retry_at.unwrap() - start, Duration::milliseconds(100));

        h.clock.advance(Duration::seconds(1));
        let second = h.clock.now();
        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.next_retry_at.unwrap() - second, Duration::milliseconds(200));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_immediate() {
        let h = harness(&[("ipfs", Behavior::Permanent)], |_| {});
        h.engine
            .submit(pin("bad"), backend("ipfs"), PayloadRef::new("p"), 5)
            .unwrap();

        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.attempt_count, 1);
        assert_eq!(op.error.unwrap().class, ErrorClass::Permanent);
        // The backend answered, so its circuit stays closed
        let record = h.engine.health().record(&backend("ipfs")).unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let h = harness(&[("cluster", Behavior::Hang)], |_| {});
        h.engine
            .submit(pin("slow"), backend("cluster"), PayloadRef::new("p"), 3)
            .unwrap();

        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Retrying);
        let error = op.error.unwrap();
        assert_eq!(error.class, ErrorClass::Transient);
        assert!(error.message.contains("timed out"));
        assert_eq!(
            h.engine.health().record(&backend("cluster")).unwrap().consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn test_transient_failure_then_recovery() {
        let h = harness(&[("s3", Behavior::Transient)], |_| {});
        h.engine
            .submit(pin("flaky"), backend("s3"), PayloadRef::new("p"), 3)
            .unwrap();

        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Retrying);

        h.backends["s3"].set_behavior(Behavior::Succeed);
        h.clock.advance(Duration::seconds(1));
        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.attempt_count, 2);
        assert_eq!(op.error_history.len(), 1);
        assert!(op.error.is_none());
    }

    #[tokio::test]
    async fn test_caller_deadline_cuts_backend_call() {
        let h = harness(&[("cluster", Behavior::Hang)], |_| {});
        let id = h
            .engine
            .submit_with_deadline(
                pin("slow"),
                backend("cluster"),
                PayloadRef::new("p"),
                3,
                h.clock.now() + Duration::milliseconds(50),
            )
            .unwrap();

        // The backend timeout is 200ms; the deadline ends the call first
        let started = std::time::Instant::now();
        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        assert_eq!(op.id, id);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.attempt_count, 1);
        let error = op.error.unwrap();
        assert_eq!(error.class, ErrorClass::Transient);
        assert!(error.message.contains("deadline"));
        assert!(h
            .engine
            .health()
            .record(&backend("cluster"))
            .is_none_or(|record| record.consecutive_failures == 0));
    }

    #[tokio::test]
    async fn test_passed_deadline_skips_backend() {
        let h = harness(&[("ipfs", Behavior::Succeed)], |_| {});
        h.engine
            .submit_with_deadline(
                pin("late"),
                backend("ipfs"),
                PayloadRef::new("p"),
                3,
                h.clock.now() - Duration::seconds(1),
            )
            .unwrap();

        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(h.backends["ipfs"].executions(), 0);
    }

    #[tokio::test]
    async fn test_no_retry_scheduled_past_deadline() {
        let h = harness(&[("s3", Behavior::Transient)], |_| {});
        // First backoff is 100ms, past the deadline
        h.engine
            .submit_with_deadline(
                pin("obj"),
                backend("s3"),
                PayloadRef::new("p"),
                3,
                h.clock.now() + Duration::milliseconds(50),
            )
            .unwrap();

        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.attempt_count, 1);
        assert!(op.next_retry_at.is_none());
        assert_eq!(
            h.engine.health().record(&backend("s3")).unwrap().consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn test_open_circuit_leaves_work_pending() {
        let h = harness(&[("s3", Behavior::Transient)], |config| {
            config.health.trip_threshold = 2;
        });
        let first = h
            .engine
            .submit(pin("a"), backend("s3"), PayloadRef::new("p"), 5)
            .unwrap();
        let second = h
            .engine
            .submit(pin("b"), backend("s3"), PayloadRef::new("p"), 5)
            .unwrap();

        h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(h.engine.health().state(&backend("s3")), CircuitState::Open);

        // Retries are due, but the circuit is open
        h.clock.advance(Duration::seconds(10));
        assert!(h.engine.processor().process_one(WORKER).await.unwrap().is_none());
        assert_eq!(h.backends["s3"].executions(), 2);

        let third = h
            .engine
            .submit(pin("c"), backend("s3"), PayloadRef::new("p"), 5)
            .unwrap();
        assert!(h.engine.processor().process_one(WORKER).await.unwrap().is_none());
        let op = h.engine.status(third).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempt_count, 0);

        for id in [first, second] {
            assert_eq!(h.engine.status(id).unwrap().attempt_count, 1);
        }
    }

    #[tokio::test]
    async fn test_backends_are_isolated() {
        let h = harness(&[("ipfs", Behavior::Succeed), ("s3", Behavior::Transient)], |config| {
            config.health.trip_threshold = 1;
        });
        let slow = h
            .engine
            .submit(pin("x"), backend("s3"), PayloadRef::new("p"), 3)
            .unwrap();
        h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(h.engine.health().state(&backend("s3")), CircuitState::Open);

        let healthy = h
            .engine
            .submit(pin("y"), backend("ipfs"), PayloadRef::new("p"), 3)
            .unwrap();
        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.id, healthy);
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(h.engine.status(slow).unwrap().status, OperationStatus::Retrying);
    }

    #[tokio::test]
    async fn test_expired_lease_is_recovered_without_charge() {
        let h = harness(&[("ipfs", Behavior::Succeed)], |_| {});
        let id = h
            .engine
            .submit(pin("bafy"), backend("ipfs"), PayloadRef::new("p"), 3)
            .unwrap();

        // A worker claims it and dies
        let ticket = h.engine.scheduler().next_ready(h.clock.now(), |_| true).unwrap();
        h.engine
            .wal()
            .claim(
                ticket.id,
                ticket.expected,
                WorkerId(7),
                h.clock.now() + Duration::seconds(30),
            )
            .unwrap();
        assert_eq!(h.engine.processor().sweep_leases().unwrap(), 0);

        h.clock.advance(Duration::seconds(31));
        assert_eq!(h.engine.processor().sweep_leases().unwrap(), 1);
        let op = h.engine.status(id).unwrap();
        assert_eq!(op.status, OperationStatus::Retrying);
        assert_eq!(op.attempt_count, 0);
        assert_eq!(op.error.unwrap().class, ErrorClass::LeaseExpired);

        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_replication_converges() {
        let h = harness(
            &[
                ("ipfs", Behavior::Succeed),
                ("s3", Behavior::Succeed),
                ("filecoin", Behavior::Succeed),
            ],
            |config| config.replication.factor = 3,
        );
        let content = key("bafy-replicated");
        h.engine
            .cache()
            .put(content.clone(), Bytes::from_static(b"payload"))
            .unwrap();
        h.engine.cache().record_replica(&content, backend("ipfs"));

        let transfers = h.engine.replication().reconcile(&content).unwrap();
        assert_eq!(transfers.len(), 2);
        assert_eq!(h.engine.scheduler().len(), 2);

        for _ in 0..2 {
            let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
            assert_eq!(op.status, OperationStatus::Completed);
            assert!(matches!(op.kind, OperationKind::Transfer { .. }));
        }
        assert!(h.engine.processor().process_one(WORKER).await.unwrap().is_none());

        let replicas = h.engine.cache().replicas(&content).unwrap();
        assert_eq!(replicas.len(), 3);
        assert!(h.engine.replication().in_flight(&content).is_empty());
        assert!(h.engine.replication().reconcile(&content).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transfer_releases_target() {
        let h = harness(&[("ipfs", Behavior::Succeed), ("s3", Behavior::Permanent)], |config| {
            config.replication.factor = 2;
        });
        let content = key("bafy-stuck");
        h.engine
            .cache()
            .put(content.clone(), Bytes::from_static(b"payload"))
            .unwrap();
        h.engine.cache().record_replica(&content, backend("ipfs"));

        h.engine.replication().reconcile(&content).unwrap();
        assert_eq!(h.engine.replication().in_flight(&content), vec![backend("s3")]);

        let op = h.engine.processor().process_one(WORKER).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(h.engine.replication().in_flight(&content).is_empty());
        assert_eq!(h.engine.cache().replicas(&content).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_migrate_moves_replica() {
        let h = harness(&[("ipfs", Behavior::Succeed), ("filecoin", Behavior::Succeed)], |config| {
            config.replication.factor = 1;
        });
        let content = key("bafy-archive");
        h.engine
            .cache()
            .put(content.clone(), Bytes::from_static(b"payload"))
            .unwrap();
        h.engine.cache().record_replica(&content, backend("ipfs"));

        h.engine
            .submit(
                OperationKind::Migrate {
                    content: content.clone(),
                    source: backend("ipfs"),
                    remove_source: true,
                },
                backend("filecoin"),
                PayloadRef::new("bafy-archive"),
                3,
            )
            .unwrap();
        h.engine.processor().process_one(WORKER).await.unwrap().unwrap();

        let replicas = h.engine.cache().replicas(&content).unwrap();
        assert_eq!(replicas.into_iter().collect::<Vec<_>>(), vec![backend("filecoin")]);
    }

    #[tokio::test]
    async fn test_concurrent_workers_claim_each_operation_once() {
        let h = harness(&[("ipfs", Behavior::Succeed), ("s3", Behavior::Succeed)], |_| {});
        for i in 0..40 {
            let target = if i % 2 == 0 { "ipfs" } else { "s3" };
            h.engine
                .submit(pin(&format!("k{i}")), backend(target), PayloadRef::new("p"), 3)
                .unwrap();
        }

        let mut tasks = Vec::new();
        for n in 0..4 {
            let processor = std::sync::Arc::clone(h.engine.processor());
            tasks.push(tokio::spawn(async move {
                let mut done = 0usize;
                while processor.process_one(WorkerId(n)).await.unwrap().is_some() {
                    done += 1;
                }
                done
            }));
        }
        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }

        assert_eq!(total, 40);
        assert_eq!(
            h.backends["ipfs"].executions() + h.backends["s3"].executions(),
            40
        );
        assert_eq!(
            h.engine.telemetry().wal_operations_total(OperationStatus::Completed),
            40
        );
    }
}
