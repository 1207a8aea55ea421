//! Stowage Telemetry
//!
//! Counters and latency histograms for the WAL, the processor, the cache
//! and backend probes, plus a Prometheus text exporter. The reporting
//! transport is left to the embedding process.

pub mod aggregator;
pub mod exporter;
pub mod histogram;

pub use aggregator::{Telemetry, TelemetrySnapshot};
pub use exporter::PrometheusExporter;
pub use histogram::{HistogramSnapshot, LatencyHistogram};
