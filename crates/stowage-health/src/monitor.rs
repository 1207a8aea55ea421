//! Backend health monitor
//!
//! One circuit breaker per backend:
//!
//! - Closed: healthy, the WAL processor may claim work for the backend
//! - Open: tripped after `trip_threshold` consecutive failures; no new claims
//! - HalfOpen: cooldown elapsed, a single probe is in flight
//!
//! ```text
//! Closed --(threshold failures)--> Open --(cooldown, probe)--> HalfOpen
//!    ^                               ^                            |
//!    +------------(success)----------+---------(failure)----------+
//! ```

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use stowage_common::config::HealthConfig;
use stowage_common::{BackendAdapter, BackendId, BackendRegistry, HealthSignal, SharedClock};
use stowage_telemetry::Telemetry;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Health record for one backend
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealthRecord {
    pub backend_id: BackendId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    /// When the circuit last opened
    pub opened_at: Option<DateTime<Utc>>,
    pub trip_threshold: u32,
    pub last_error: Option<String>,
}

impl BackendHealthRecord {
    fn new(backend_id: BackendId, trip_threshold: u32) -> Self {
        Self {
            backend_id,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_probe_at: None,
            opened_at: None,
            trip_threshold,
            last_error: None,
        }
    }
}

/// Whether a probe should be sent now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    Probe,
    Skip,
}

/// Tracks per-backend availability
pub struct HealthMonitor {
    config: HealthConfig,
    clock: SharedClock,
    telemetry: Arc<Telemetry>,
    records: RwLock<HashMap<BackendId, BackendHealthRecord>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, clock: SharedClock, telemetry: Arc<Telemetry>) -> Self {
        Self {
            config,
            clock,
            telemetry,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Current state (unknown backends are Closed)
    pub fn state(&self, backend: &BackendId) -> CircuitState {
        self.records
            .read()
            .get(backend)
            .map_or(CircuitState::Closed, |r| r.state)
    }

    /// Whether new work may be claimed for the backend
    pub fn is_available(&self, backend: &BackendId) -> bool {
        self.state(backend) == CircuitState::Closed
    }

    /// Record a successful call or probe
    pub fn record_success(&self, backend: &BackendId) {
        let mut records = self.records.write();
        let record = self.record_mut(&mut records, backend);

        match record.state {
            CircuitState::HalfOpen => {
                record.state = CircuitState::Closed;
                record.consecutive_failures = 0;
                record.opened_at = None;
                record.last_error = None;
                info!(backend = %backend, "Circuit breaker closed after successful probe");
            }
            CircuitState::Closed => {
                record.consecutive_failures = 0;
            }
            CircuitState::Open => {
                // Late completion of work claimed before the trip; recovery
                // is decided by the probe only.
                debug!(backend = %backend, "Ignoring success while circuit is open");
            }
        }
    }

    /// Record a failed call or probe
    pub fn record_failure(&self, backend: &BackendId, reason: &str) {
        let now = self.clock.now();
        let mut records = self.records.write();
        let record = self.record_mut(&mut records, backend);

        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_error = Some(reason.to_string());

        match record.state {
            CircuitState::Closed => {
                if record.consecutive_failures >= record.trip_threshold {
                    record.state = CircuitState::Open;
                    record.opened_at = Some(now);
                    warn!(
                        backend = %backend,
                        failures = record.consecutive_failures,
                        reason,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                record.opened_at = Some(now);
                warn!(backend = %backend, reason, "Circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Gate for probes; moves an open circuit to HalfOpen once the cooldown
    /// has elapsed. Only one probe is let through per HalfOpen period.
    pub fn begin_probe(&self, backend: &BackendId) -> ProbeDecision {
        let now = self.clock.now();
        let mut records = self.records.write();
        let cooldown = self.config.cooldown();
        let record = self.record_mut(&mut records, backend);

        match record.state {
            CircuitState::Closed => ProbeDecision::Probe,
            CircuitState::HalfOpen => ProbeDecision::Skip,
            CircuitState::Open => {
                let elapsed = record.opened_at.map_or(cooldown, |at| now - at);
                if elapsed >= cooldown {
                    record.state = CircuitState::HalfOpen;
                    info!(backend = %backend, "Circuit breaker entering half-open state");
                    ProbeDecision::Probe
                } else {
                    debug!(
                        backend = %backend,
                        remaining_ms = (cooldown - elapsed).num_milliseconds(),
                        "Circuit breaker open, probe skipped"
                    );
                    ProbeDecision::Skip
                }
            }
        }
    }

    /// Probe one backend if the breaker allows it and record the result
    pub async fn probe_backend(&self, adapter: &dyn BackendAdapter) -> Option<HealthSignal> {
        let backend = adapter.id();
        if self.begin_probe(backend) == ProbeDecision::Skip {
            return None;
        }

        let started = Instant::now();
        let signal = match tokio::time::timeout(self.config.probe_timeout(), adapter.probe()).await
        {
            Ok(signal) => signal,
            Err(_) => HealthSignal::Unhealthy {
                reason: format!("probe timed out after {:?}", self.config.probe_timeout()),
            },
        };
        self.telemetry
            .record_probe_latency(backend, started.elapsed());

        {
            let now = self.clock.now();
            let mut records = self.records.write();
            self.record_mut(&mut records, backend).last_probe_at = Some(now);
        }

        match &signal {
            HealthSignal::Healthy { .. } => self.record_success(backend),
            HealthSignal::Unhealthy { reason } => self.record_failure(backend, reason),
        }
        Some(signal)
    }

    /// Probe every registered backend each `probe_interval` until shutdown
    pub async fn run(self: Arc<Self>, registry: BackendRegistry, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("Health monitor stopping");
                    return;
                }
            }
            if *shutdown.borrow() {
                return;
            }

            for adapter in registry.adapters() {
                self.probe_backend(adapter.as_ref()).await;
            }
        }
    }

    /// Read-only copy of every record
    pub fn snapshot(&self) -> Vec<BackendHealthRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        records
    }

    /// Read-only copy of one record
    pub fn record(&self, backend: &BackendId) -> Option<BackendHealthRecord> {
        self.records.read().get(backend).cloned()
    }

    fn record_mut<'a>(
        &self,
        records: &'a mut HashMap<BackendId, BackendHealthRecord>,
        backend: &BackendId,
    ) -> &'a mut BackendHealthRecord {
        records
            .entry(backend.clone())
            .or_insert_with(|| BackendHealthRecord::new(backend.clone(), self.config.trip_threshold))
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("backends", &self.records.read().len())
            .finish_non_exhaustive()
    }
}
