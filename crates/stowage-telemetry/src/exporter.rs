//! Prometheus text exporter
//!
//! # Metrics
//! - `stowage_wal_operations_total{status}` - Operations entering each status
//! - `stowage_wal_retry_total` - Retry transitions
//! - `stowage_cache_hit_total` / `stowage_cache_miss_total` - Cache lookups
//! - `stowage_cache_eviction_total` - ARC evictions into ghost lists
//! - `stowage_operation_latency_seconds{backend}` - Backend execution histogram
//! - `stowage_probe_latency_seconds{backend}` - Health probe histogram

use crate::aggregator::TelemetrySnapshot;
use crate::histogram::HistogramSnapshot;
use std::fmt::Write;

/// Renders a [`TelemetrySnapshot`] in Prometheus text exposition format
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "stowage")
    prefix: String,
}

impl PrometheusExporter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export metrics in Prometheus text format
    #[allow(clippy::cast_precision_loss)]
    pub fn export(&self, snapshot: &TelemetrySnapshot) -> String {
        let mut output = String::with_capacity(4 * 1024);

        self.write_help(
            &mut output,
            "wal_operations_total",
            "Operations that entered each status",
        );
        self.write_type(&mut output, "wal_operations_total", "counter");
        for (status, count) in &snapshot.wal_operations_total {
            self.write_metric_with_labels(
                &mut output,
                "wal_operations_total",
                *count as f64,
                &[("status", status)],
            );
        }

        let counters = [
            ("wal_retry_total", "Operations moved to Retrying", snapshot.wal_retry_total),
            ("cache_hit_total", "Tiered cache hits", snapshot.cache_hit_total),
            ("cache_miss_total", "Tiered cache misses", snapshot.cache_miss_total),
            (
                "cache_eviction_total",
                "Entries evicted from T1/T2",
                snapshot.cache_eviction_total,
            ),
            (
                "cache_promotion_total",
                "Entries promoted to the hot tier",
                snapshot.cache_promotion_total,
            ),
            (
                "cache_demotion_total",
                "Entries demoted from the hot tier",
                snapshot.cache_demotion_total,
            ),
        ];
        for (name, help, value) in counters {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "counter");
            self.write_metric(&mut output, name, value as f64);
        }

        self.export_histograms(
            &mut output,
            "operation_latency_seconds",
            "Backend operation latency",
            &snapshot.operation_latency,
        );
        self.export_histograms(
            &mut output,
            "probe_latency_seconds",
            "Backend probe latency",
            &snapshot.probe_latency,
        );

        output
    }

    #[allow(clippy::cast_precision_loss)]
    fn export_histograms<'a>(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        histograms: impl IntoIterator<Item = (&'a String, &'a HistogramSnapshot)>,
    ) {
        let mut histograms = histograms.into_iter().peekable();
        if histograms.peek().is_none() {
            return;
        }

        self.write_help(output, name, help);
        self.write_type(output, name, "histogram");
        for (backend, hist) in histograms {
            let mut cumulative = 0u64;
            for (boundary_us, count) in &hist.buckets {
                cumulative += count;
                let le = if *boundary_us == u64::MAX {
                    "+Inf".to_string()
                } else {
                    format!("{}", *boundary_us as f64 / 1_000_000.0)
                };
                let _ = writeln!(
                    output,
                    "{}_{}_bucket{{backend=\"{}\",le=\"{}\"}} {}",
                    self.prefix, name, backend, le, cumulative
                );
            }
            let _ = writeln!(
                output,
                "{}_{}_sum{{backend=\"{}\"}} {}",
                self.prefix,
                name,
                backend,
                hist.sum_us as f64 / 1_000_000.0
            );
            let _ = writeln!(
                output,
                "{}_{}_count{{backend=\"{}\"}} {}",
                self.prefix, name, backend, hist.count
            );
        }
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric(&self, output: &mut String, name: &str, value: f64) {
        let _ = writeln!(output, "{}_{} {}", self.prefix, name, value);
    }

    fn write_metric_with_labels(
        &self,
        output: &mut String,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let labels_str: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            labels_str.join(","),
            value
        );
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("stowage")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Telemetry;
    use std::time::Duration;
    use stowage_common::{BackendId, OperationStatus};

    #[test]
    fn test_export_counters() {
        let telemetry = Telemetry::new();
        telemetry.record_status(OperationStatus::Completed);
        telemetry.record_cache_miss();

        let text = PrometheusExporter::default().export(&telemetry.snapshot());
        assert!(text.contains("# TYPE stowage_wal_operations_total counter"));
        assert!(text.contains("stowage_wal_operations_total{status=\"completed\"} 1"));
        assert!(text.contains("stowage_cache_miss_total 1"));
        assert!(!text.contains("operation_latency_seconds"));
    }

    #[test]
    fn test_export_histogram_is_cumulative() {
        let telemetry = Telemetry::new();
        let backend = BackendId::new("s3").unwrap();
        telemetry.record_operation_latency(&backend, Duration::from_micros(50));
        telemetry.record_operation_latency(&backend, Duration::from_secs(120));

        let text = PrometheusExporter::default().export(&telemetry.snapshot());
        assert!(text.contains("stowage_operation_latency_seconds_bucket{backend=\"s3\",le=\"0.0001\"} 1"));
        assert!(text.contains("stowage_operation_latency_seconds_bucket{backend=\"s3\",le=\"+Inf\"} 2"));
        assert!(text.contains("stowage_operation_latency_seconds_count{backend=\"s3\"} 2"));
    }
}
