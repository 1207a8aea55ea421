//! Scripted backends and an engine harness for unit tests

use crate::engine::Engine;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stowage_common::{
    BackendAdapter, BackendError, BackendId, BackendOutcome, BackendRegistry, Config, ContentKey,
    HealthSignal, ManualClock, Operation, OperationKind, SharedClock,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Transient,
    Permanent,
    Hang,
}

pub struct ScriptedBackend {
    id: BackendId,
    behavior: Mutex<Behavior>,
    executions: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(id: &str, behavior: Behavior) -> Self {
        Self {
            id: backend(id),
            behavior: Mutex::new(behavior),
            executions: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn execute(&self, op: &Operation) -> Result<BackendOutcome, BackendError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock();
        match behavior {
            Behavior::Succeed => Ok(match &op.kind {
                OperationKind::Get { content } => BackendOutcome::done().with_content(
                    content.clone(),
                    Bytes::from(format!("content of {content}")),
                ),
                OperationKind::Unpin { .. } => BackendOutcome::done(),
                _ => BackendOutcome::stored(),
            }),
            Behavior::Transient => Err(BackendError::transient("connection reset by peer")),
            Behavior::Permanent => Err(BackendError::permanent("invalid content identifier")),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(BackendOutcome::done())
            }
        }
    }

    async fn probe(&self) -> HealthSignal {
        HealthSignal::Healthy {
            latency: std::time::Duration::from_millis(1),
        }
    }

    async fn fetch(&self, key: &ContentKey) -> Result<Option<Bytes>, BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Bytes::from(format!("content of {key}"))))
    }
}

pub fn backend(name: &str) -> BackendId {
    BackendId::new(name).unwrap()
}

pub fn key(name: &str) -> ContentKey {
    ContentKey::new(name)
}

pub struct Harness {
    dir: tempfile::TempDir,
    config: Config,
    pub clock: Arc<ManualClock>,
    pub backends: BTreeMap<String, Arc<ScriptedBackend>>,
    pub engine: Engine,
}

impl Harness {
    /// Reopen the engine over the same directories and backends
    pub fn reopen(self) -> Self {
        let Self {
            dir,
            config,
            clock,
            backends,
            engine,
        } = self;
        drop(engine);
        let engine = open_engine(config.clone(), &backends, &clock);
        Self {
            dir,
            config,
            clock,
            backends,
            engine,
        }
    }
}

fn open_engine(
    config: Config,
    backends: &BTreeMap<String, Arc<ScriptedBackend>>,
    clock: &Arc<ManualClock>,
) -> Engine {
    let mut registry = BackendRegistry::new();
    for adapter in backends.values() {
        registry
            .register(Arc::clone(adapter) as Arc<dyn BackendAdapter>)
            .unwrap();
    }
    let clock: SharedClock = Arc::clone(clock) as SharedClock;
    Engine::open(config, registry, clock).unwrap()
}

/// Engine over scripted backends with fast, jitter-free retries
pub fn harness(backends: &[(&str, Behavior)], tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.wal.dir = dir.path().join("wal");
    config.cache.dir = dir.path().join("cache");
    config.cache.capacity_entries = 16;
    config.processor.backoff_base_ms = 100;
    config.processor.backoff_cap_ms = 10_000;
    config.processor.jitter_ratio = 0.0;
    config.processor.backend_timeout_ms = 200;
    tweak(&mut config);

    let backends: BTreeMap<String, Arc<ScriptedBackend>> = backends
        .iter()
        .map(|(name, behavior)| ((*name).to_string(), Arc::new(ScriptedBackend::new(name, *behavior))))
        .collect();
    let clock = ManualClock::starting_now();
    let engine = open_engine(config.clone(), &backends, &clock);

    Harness {
        dir,
        config,
        clock,
        backends,
        engine,
    }
}
