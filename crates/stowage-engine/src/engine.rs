//! Submission interface
//!
//! [`Engine`] wires the WAL, scheduler, processor, health monitor, tiered
//! cache and replication engine together and exposes `submit`, `status`,
//! `wait` and the read-through `fetch` path.

use crate::processor::{Processor, ProcessorHandle};
use crate::scheduler::Scheduler;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use stowage_cache::{OperationQueue, ReplicationEngine, TieredCache};
use stowage_common::{
    BackendId, BackendRegistry, Config, ContentKey, Error, Operation, OperationId, OperationKind,
    OperationStatus, PayloadRef, Result, SharedClock,
};
use stowage_health::HealthMonitor;
use stowage_telemetry::{PrometheusExporter, Telemetry};
use stowage_wal::WalHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Path every new operation takes from the WAL to the workers
struct Submissions {
    scheduler: Arc<Scheduler>,
    telemetry: Arc<Telemetry>,
}

impl OperationQueue for Submissions {
    fn enqueue(&self, op: &Operation) {
        self.telemetry.record_status(OperationStatus::Pending);
        self.scheduler.schedule_pending(op);
    }
}

struct Running {
    processor: ProcessorHandle,
    health_shutdown: watch::Sender<bool>,
    health_task: JoinHandle<()>,
}

pub struct Engine {
    config: Config,
    clock: SharedClock,
    wal: WalHandle,
    registry: BackendRegistry,
    telemetry: Arc<Telemetry>,
    health: Arc<HealthMonitor>,
    cache: Arc<TieredCache>,
    replication: Arc<ReplicationEngine>,
    scheduler: Arc<Scheduler>,
    submissions: Arc<Submissions>,
    processor: Arc<Processor>,
    running: Mutex<Option<Running>>,
}

impl Engine {
    /// Open the WAL and cache, and queue every unfinished operation
    pub fn open(config: Config, registry: BackendRegistry, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            return Err(Error::Configuration("no backends registered".into()));
        }

        let telemetry = Telemetry::new();
        let wal = stowage_wal::init(&config.wal.dir, config.wal.clone(), Arc::clone(&clock))?;
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        ));
        let cache = Arc::new(TieredCache::open(&config.cache, Arc::clone(&telemetry))?);
        let scheduler = Arc::new(Scheduler::new());
        let submissions = Arc::new(Submissions {
            scheduler: Arc::clone(&scheduler),
            telemetry: Arc::clone(&telemetry),
        });
        let replication = Arc::new(ReplicationEngine::new(
            config.replication.clone(),
            Arc::clone(&wal),
            Arc::clone(&cache),
            Arc::clone(&health),
            registry.clone(),
            Arc::clone(&clock),
            Arc::clone(&submissions) as Arc<dyn OperationQueue>,
        ));
        let queued = scheduler.rebuild(&wal);

        let processor = Arc::new(Processor::new(
            config.processor.clone(),
            Arc::clone(&wal),
            Arc::clone(&scheduler),
            registry.clone(),
            Arc::clone(&health),
            Arc::clone(&cache),
            Arc::clone(&replication),
            Arc::clone(&telemetry),
            Arc::clone(&clock),
        ));

        info!(
            wal_dir = %config.wal.dir.display(),
            backends = registry.len(),
            operations = wal.len(),
            queued,
            "Engine opened"
        );

        Ok(Self {
            config,
            clock,
            wal,
            registry,
            telemetry,
            health,
            cache,
            replication,
            scheduler,
            submissions,
            processor,
            running: Mutex::new(None),
        })
    }

    /// Start the workers, the lease sweeper and the health probe loop
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("Engine already started");
            return;
        }

        let processor = self.processor.start(self.config.processor.workers);
        let (health_shutdown, rx) = watch::channel(false);
        let health_task = tokio::spawn(Arc::clone(&self.health).run(self.registry.clone(), rx));

        *running = Some(Running {
            processor,
            health_shutdown,
            health_task,
        });
    }

    /// Stop background tasks, then flush and close the WAL
    pub async fn shutdown(&self) -> Result<()> {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.health_shutdown.send(true);
            running.processor.shutdown().await;
            if let Err(e) = running.health_task.await {
                warn!("Health monitor task panicked: {e}");
            }
        }
        self.wal.shutdown()?;
        info!("Engine stopped");
        Ok(())
    }

    /// Log a new operation and queue it for processing
    pub fn submit(
        &self,
        kind: OperationKind,
        backend_id: BackendId,
        payload_ref: PayloadRef,
        max_attempts: u32,
    ) -> Result<OperationId> {
        self.submit_operation(kind, backend_id, payload_ref, max_attempts, None)
    }

    /// Like [`Engine::submit`], but backend calls stop at `deadline` and no
    /// retry is scheduled past it
    pub fn submit_with_deadline(
        &self,
        kind: OperationKind,
        backend_id: BackendId,
        payload_ref: PayloadRef,
        max_attempts: u32,
        deadline: DateTime<Utc>,
    ) -> Result<OperationId> {
        self.submit_operation(kind, backend_id, payload_ref, max_attempts, Some(deadline))
    }

    fn submit_operation(
        &self,
        kind: OperationKind,
        backend_id: BackendId,
        payload_ref: PayloadRef,
        max_attempts: u32,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<OperationId> {
        if !self.registry.contains(&backend_id) {
            return Err(Error::UnknownBackend(backend_id));
        }
        if max_attempts == 0 {
            return Err(Error::invalid_argument("max_attempts must be at least 1"));
        }

        let mut op = Operation::new(kind, backend_id, payload_ref, max_attempts, self.clock.now());
        if let Some(deadline) = deadline {
            op = op.with_deadline(deadline);
        }
        let queued = op.clone();
        let id = self.wal.append(op)?;
        self.submissions.enqueue(&queued);
        debug!(op = %id, backend = %queued.backend_id, kind = queued.kind.name(), "Submitted operation");
        Ok(id)
    }

    /// Submit with the configured default attempt budget
    pub fn submit_default(
        &self,
        kind: OperationKind,
        backend_id: BackendId,
        payload_ref: PayloadRef,
    ) -> Result<OperationId> {
        let max_attempts = self.config.processor.default_max_attempts;
        self.submit(kind, backend_id, payload_ref, max_attempts)
    }

    pub fn status(&self, id: OperationId) -> Result<Operation> {
        self.wal.get(id)
    }

    /// Wait until the operation is `Completed` or `Failed`
    pub async fn wait(&self, id: OperationId, timeout: Duration) -> Result<Operation> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before reading so a change in between is not missed
            let changed = self.wal.changed().notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let op = self.status(id)?;
            if op.status.is_terminal() {
                return Ok(op);
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Read content through the cache
    ///
    /// A miss reads straight from the backend, without touching the WAL,
    /// and caches the result.
    pub async fn fetch(&self, key: &ContentKey, backend: &BackendId) -> Result<Option<Bytes>> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }

        let adapter = self.registry.get(backend)?;
        if !self.health.is_available(backend) {
            return Err(Error::CircuitOpen(backend.clone()));
        }

        let timeout = self.config.processor.backend_timeout();
        let fetched = match tokio::time::timeout(timeout, adapter.fetch(key)).await {
            Ok(result) => result,
            Err(_) => {
                self.health
                    .record_failure(backend, &format!("fetch timed out after {timeout:?}"));
                return Err(Error::Timeout);
            }
        };

        match fetched {
            Ok(Some(value)) => {
                self.health.record_success(backend);
                self.cache.put(key.clone(), value.clone())?;
                self.cache.record_replica(key, backend.clone());
                debug!(key = %key, backend = %backend, bytes = value.len(), "Fetched from backend");
                Ok(Some(value))
            }
            Ok(None) => {
                self.health.record_success(backend);
                Ok(None)
            }
            Err(e) if e.is_transient() => {
                self.health.record_failure(backend, &e.message);
                Err(Error::BackendTransient(e.message))
            }
            Err(e) => {
                self.health.record_success(backend);
                Err(Error::BackendPermanent(e.message))
            }
        }
    }

    /// Prometheus text for the current counters and histograms
    pub fn render_metrics(&self) -> String {
        PrometheusExporter::default().export(&self.telemetry.snapshot())
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn wal(&self) -> &WalHandle {
        &self.wal
    }

    pub const fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub const fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub const fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub const fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub const fn replication(&self) -> &Arc<ReplicationEngine> {
        &self.replication
    }

    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub const fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }
}
