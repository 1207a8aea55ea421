//! Telemetry aggregator
//!
//! Collects counters and latency histograms from the WAL processor, the
//! tiered cache and the health monitor. Components hold an
//! `Arc<Telemetry>` and record into it; reporting layers read
//! [`TelemetrySnapshot`]s.

use crate::histogram::{HistogramSnapshot, LatencyHistogram};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use stowage_common::{BackendId, OperationStatus};

/// Per-status transition counters
#[derive(Debug, Default)]
struct StatusCounters {
    pending: AtomicU64,
    processing: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retrying: AtomicU64,
}

impl StatusCounters {
    const fn counter(&self, status: OperationStatus) -> &AtomicU64 {
        match status {
            OperationStatus::Pending => &self.pending,
            OperationStatus::Processing => &self.processing,
            OperationStatus::Completed => &self.completed,
            OperationStatus::Failed => &self.failed,
            OperationStatus::Retrying => &self.retrying,
        }
    }
}

/// Telemetry aggregator shared by all components
#[derive(Debug, Default)]
pub struct Telemetry {
    wal_operations: StatusCounters,
    wal_retries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    cache_promotions: AtomicU64,
    cache_demotions: AtomicU64,
    operation_latency: RwLock<BTreeMap<BackendId, Arc<LatencyHistogram>>>,
    probe_latency: RwLock<BTreeMap<BackendId, Arc<LatencyHistogram>>>,
}

impl Telemetry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// An operation entered `status` (including creation as Pending)
    pub fn record_status(&self, status: OperationStatus) {
        self.wal_operations
            .counter(status)
            .fetch_add(1, Ordering::Relaxed);
        if status == OperationStatus::Retrying {
            self.wal_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_eviction(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_promotion(&self) {
        self.cache_promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_demotion(&self) {
        self.cache_demotions.fetch_add(1, Ordering::Relaxed);
    }

    /// Latency of one backend execution (claim to terminal/retry decision)
    pub fn record_operation_latency(&self, backend: &BackendId, latency: Duration) {
        histogram_for(&self.operation_latency, backend).observe(latency);
    }

    pub fn record_probe_latency(&self, backend: &BackendId, latency: Duration) {
        histogram_for(&self.probe_latency, backend).observe(latency);
    }

    pub fn wal_operations_total(&self, status: OperationStatus) -> u64 {
        self.wal_operations.counter(status).load(Ordering::Relaxed)
    }

    pub fn wal_retry_total(&self) -> u64 {
        self.wal_retries.load(Ordering::Relaxed)
    }

    pub fn cache_hit_total(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_miss_total(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn cache_eviction_total(&self) -> u64 {
        self.cache_evictions.load(Ordering::Relaxed)
    }

    /// Cache hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.cache_hit_total() as f64;
        let total = hits + self.cache_miss_total() as f64;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    /// Point-in-time copy of everything
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            wal_operations_total: OperationStatus::ALL
                .into_iter()
                .map(|status| (status.as_str(), self.wal_operations_total(status)))
                .collect(),
            wal_retry_total: self.wal_retry_total(),
            cache_hit_total: self.cache_hit_total(),
            cache_miss_total: self.cache_miss_total(),
            cache_eviction_total: self.cache_eviction_total(),
            cache_promotion_total: self.cache_promotions.load(Ordering::Relaxed),
            cache_demotion_total: self.cache_demotions.load(Ordering::Relaxed),
            operation_latency: snapshot_map(&self.operation_latency),
            probe_latency: snapshot_map(&self.probe_latency),
        }
    }
}

fn histogram_for(
    map: &RwLock<BTreeMap<BackendId, Arc<LatencyHistogram>>>,
    backend: &BackendId,
) -> Arc<LatencyHistogram> {
    if let Some(hist) = map.read().get(backend) {
        return Arc::clone(hist);
    }
    Arc::clone(map.write().entry(backend.clone()).or_default())
}

fn snapshot_map(
    map: &RwLock<BTreeMap<BackendId, Arc<LatencyHistogram>>>,
) -> BTreeMap<String, HistogramSnapshot> {
    map.read()
        .iter()
        .map(|(backend, hist)| (backend.to_string(), hist.snapshot()))
        .collect()
}

/// Serializable telemetry snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub wal_operations_total: BTreeMap<&'static str, u64>,
    pub wal_retry_total: u64,
    pub cache_hit_total: u64,
    pub cache_miss_total: u64,
    pub cache_eviction_total: u64,
    pub cache_promotion_total: u64,
    pub cache_demotion_total: u64,
    /// Keyed by backend ID
    pub operation_latency: BTreeMap<String, HistogramSnapshot>,
    /// Keyed by backend ID
    pub probe_latency: BTreeMap<String, HistogramSnapshot>,
}
