//! Lock-free latency histogram
//!
//! Fixed bucket boundaries sized for backend calls: sub-millisecond cache
//! and probe round trips up to minute-long archival retrievals.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const BUCKETS: usize = 16;

/// Bucket upper bounds in microseconds
pub const BUCKET_BOUNDARIES_US: [u64; BUCKETS] = [
    100,        // 0: 0-100us
    500,        // 1: 100-500us
    1_000,      // 2: 500us-1ms
    5_000,      // 3: 1-5ms
    10_000,     // 4: 5-10ms
    25_000,     // 5: 10-25ms
    50_000,     // 6: 25-50ms
    100_000,    // 7: 50-100ms
    250_000,    // 8: 100-250ms
    500_000,    // 9: 250-500ms
    1_000_000,  // 10: 500ms-1s
    2_500_000,  // 11: 1-2.5s
    5_000_000,  // 12: 2.5-5s
    10_000_000, // 13: 5-10s
    60_000_000, // 14: 10-60s
    u64::MAX,   // 15: 60s+
];

/// Latency histogram with atomic buckets
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl LatencyHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record a sample
    pub fn observe(&self, latency: Duration) {
        self.record(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX));
    }

    /// Record a latency sample in microseconds
    pub fn record(&self, latency_us: u64) {
        let bucket_idx = BUCKET_BOUNDARIES_US
            .iter()
            .position(|&boundary| latency_us < boundary)
            .unwrap_or(BUCKETS - 1);

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_us, Ordering::Relaxed);
        self.min.fetch_min(latency_us, Ordering::Relaxed);
        self.max.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Average latency in microseconds
    pub fn avg(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        self.sum() / count
    }

    pub fn min(&self) -> u64 {
        let min = self.min.load(Ordering::Relaxed);
        if min == u64::MAX { 0 } else { min }
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Percentile latency in microseconds (upper bound of the bucket)
    ///
    /// # Arguments
    /// * `percentile` - Percentile to calculate (0.0 to 1.0, e.g., 0.99 for p99)
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64) * percentile).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_BOUNDARIES_US[i];
            }
        }

        BUCKET_BOUNDARIES_US[BUCKETS - 1]
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count(),
            sum_us: self.sum(),
            min_us: self.min(),
            max_us: self.max(),
            p50_us: self.percentile(0.50),
            p99_us: self.percentile(0.99),
            buckets: BUCKET_BOUNDARIES_US
                .iter()
                .zip(self.buckets.iter())
                .map(|(&boundary, count)| (boundary, count.load(Ordering::Relaxed)))
                .collect(),
        }
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    /// `(upper_bound_us, count)` per bucket, non-cumulative
    pub buckets: Vec<(u64, u64)>,
}
